// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The query seam. Sessions hand query text to a [`QueryExecutor`]; what
//! language that text is in is the executor's business, not the session
//! layer's. The built-in [`TableScanExecutor`] understands exactly one
//! shape, `SELECT * FROM <table>`, which publishes the table's rows as a
//! paged result.

use strata_store::{Conglomerate, ResultInfo};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("cannot parse query: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] strata_store::Error),
}

#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// A published result the client pages through and must dispose.
    Rows(ResultInfo),
    /// A mutation; the number of rows affected.
    Count(usize),
}

pub trait QueryExecutor: Send + Sync {
    fn execute(&self, db: &Conglomerate, query: &str) -> Result<QueryOutcome, QueryError>;
}

/// Full-table reads only. Anything fancier plugs in its own executor.
pub struct TableScanExecutor;

impl QueryExecutor for TableScanExecutor {
    fn execute(&self, db: &Conglomerate, query: &str) -> Result<QueryOutcome, QueryError> {
        let table = parse_select_star(query)
            .ok_or_else(|| QueryError::Parse(format!("unsupported query: {query}")))?;
        let info = db.publish_result(&table, query)?;
        Ok(QueryOutcome::Rows(info))
    }
}

/// Accepts `SELECT * FROM <table>` with case-insensitive keywords and an
/// optional trailing semicolon. The table name is taken verbatim.
fn parse_select_star(query: &str) -> Option<String> {
    let trimmed = query.trim().trim_end_matches(';').trim();
    let mut words = trimmed.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    if words.next()? != "*" {
        return None;
    }
    if !words.next()?.eq_ignore_ascii_case("from") {
        return None;
    }
    let table = words.next()?;
    if words.next().is_some() {
        return None;
    }
    Some(table.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select_star() {
        assert_eq!(parse_select_star("SELECT * FROM Accounts"), Some("Accounts".into()));
        assert_eq!(parse_select_star("select * from t;"), Some("t".into()));
        assert_eq!(parse_select_star("  Select  *  From  t  "), Some("t".into()));
        assert_eq!(parse_select_star("SELECT name FROM t"), None);
        assert_eq!(parse_select_star("SELECT * FROM t WHERE x"), None);
        assert_eq!(parse_select_star("DROP TABLE t"), None);
        assert_eq!(parse_select_star(""), None);
    }
}
