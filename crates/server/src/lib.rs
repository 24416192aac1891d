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

//! Session boundary for an embedded strata conglomerate: authenticated
//! sessions, query execution through a pluggable executor, and paged
//! fetching of published results. Every result a session publishes is
//! tracked and disposed when the session ends, so an abandoned client
//! cannot pin table rows forever through leaked root locks.

mod executor;

pub use executor::{QueryError, QueryExecutor, QueryOutcome, TableScanExecutor};

use ahash::AHashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use strata_store::{Cell, Conglomerate};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("unknown or ended session")]
    UnknownSession,
    #[error("result does not belong to this session")]
    ForeignResult,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] strata_store::Error),
}

impl SessionError {
    /// Stable numeric codes for the wire; message text is free to change.
    pub fn code(&self) -> u16 {
        match self {
            SessionError::AuthenticationFailed => 10,
            SessionError::UnknownSession => 11,
            SessionError::ForeignResult => 12,
            SessionError::Query(QueryError::Parse(_)) => 20,
            SessionError::Query(QueryError::Store(_)) => 21,
            SessionError::Store(_) => 21,
        }
    }
}

struct Session {
    user: String,
    /// Results published by this session and not yet disposed.
    results: Vec<Uuid>,
}

#[derive(Debug)]
pub struct ExecuteResponse {
    pub outcome: QueryOutcome,
    pub elapsed_ms: u128,
}

pub struct SessionManager {
    db: Conglomerate,
    executor: Arc<dyn QueryExecutor>,
    sessions: Mutex<AHashMap<Uuid, Session>>,
}

impl SessionManager {
    pub fn new(db: Conglomerate, executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            db,
            executor,
            sessions: Mutex::new(AHashMap::new()),
        }
    }

    pub fn db(&self) -> &Conglomerate {
        &self.db
    }

    /// Authenticate against the conglomerate's stored credentials and open
    /// a session.
    pub fn login(&self, user: &str, password: &str) -> Result<Uuid, SessionError> {
        if !self.db.verify_credentials(user, password) {
            warn!("failed login for user '{user}'");
            return Err(SessionError::AuthenticationFailed);
        }
        let id = Uuid::new_v4();
        self.sessions.lock().unwrap().insert(
            id,
            Session {
                user: user.to_string(),
                results: vec![],
            },
        );
        info!("session {id} opened for '{user}'");
        Ok(id)
    }

    /// Run a query on behalf of a session. A `Rows` outcome is registered
    /// against the session for later fetch/dispose.
    pub fn execute(&self, session: Uuid, query: &str) -> Result<ExecuteResponse, SessionError> {
        self.ensure_session(session)?;
        let started = Instant::now();
        let outcome = self.executor.execute(&self.db, query)?;
        let elapsed_ms = started.elapsed().as_millis();
        if let QueryOutcome::Rows(info) = &outcome {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(s) = sessions.get_mut(&session) {
                s.results.push(info.id);
            }
            debug!(
                "session {session}: published result {} ({} rows) in {elapsed_ms}ms",
                info.id, info.row_count
            );
        } else {
            debug!("session {session}: query completed in {elapsed_ms}ms");
        }
        Ok(ExecuteResponse { outcome, elapsed_ms })
    }

    /// Fetch rows `[start, start + count)` of a result this session
    /// published.
    pub fn fetch(
        &self,
        session: Uuid,
        result: Uuid,
        start: usize,
        count: usize,
    ) -> Result<Vec<Vec<Cell>>, SessionError> {
        self.ensure_owns_result(session, result)?;
        Ok(self.db.result_part(result, start, count)?)
    }

    /// Release one of the session's results.
    pub fn dispose(&self, session: Uuid, result: Uuid) -> Result<(), SessionError> {
        self.ensure_owns_result(session, result)?;
        self.db.dispose_result(result)?;
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions.get_mut(&session) {
            s.results.retain(|r| *r != result);
        }
        Ok(())
    }

    /// End a session, disposing anything it still has published.
    pub fn logout(&self, session: Uuid) -> Result<(), SessionError> {
        let removed = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session)
            .ok_or(SessionError::UnknownSession)?;
        for result in &removed.results {
            if let Err(e) = self.db.dispose_result(*result) {
                warn!("session {session}: could not dispose result {result}: {e}");
            }
        }
        info!(
            "session {session} for '{}' ended, {} result(s) released",
            removed.user,
            removed.results.len()
        );
        Ok(())
    }

    /// End every session. Called on server shutdown so no root lock
    /// outlives the process's sessions.
    pub fn teardown(&self) {
        let all: Vec<Uuid> = self.sessions.lock().unwrap().keys().copied().collect();
        for session in all {
            let _ = self.logout(session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn ensure_session(&self, session: Uuid) -> Result<(), SessionError> {
        if self.sessions.lock().unwrap().contains_key(&session) {
            Ok(())
        } else {
            Err(SessionError::UnknownSession)
        }
    }

    fn ensure_owns_result(&self, session: Uuid, result: Uuid) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().unwrap();
        let s = sessions.get(&session).ok_or(SessionError::UnknownSession)?;
        if s.results.contains(&result) {
            Ok(())
        } else {
            Err(SessionError::ForeignResult)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::{ColumnDescription, ColumnType, TableSchema};

    fn manager(dir: &std::path::Path) -> SessionManager {
        let db = Conglomerate::create(dir, "serverdb", "admin", "secret").unwrap();
        let mut tx = db.begin();
        tx.create_table(
            "Accounts",
            TableSchema::new(vec![
                ColumnDescription::new("number", ColumnType::Numeric),
                ColumnDescription::new("name", ColumnType::String),
            ])
            .unwrap(),
        )
        .unwrap();
        tx.insert(
            "Accounts",
            vec![Cell::Numeric(105.0), Cell::String("Cash".into())],
        )
        .unwrap();
        tx.insert(
            "Accounts",
            vec![Cell::Numeric(505.0), Cell::String("Rent".into())],
        )
        .unwrap();
        tx.commit().unwrap();
        SessionManager::new(db, Arc::new(TableScanExecutor))
    }

    #[test]
    fn test_login_checks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert_eq!(
            m.login("admin", "wrong").unwrap_err(),
            SessionError::AuthenticationFailed
        );
        assert_eq!(
            m.login("nobody", "secret").unwrap_err(),
            SessionError::AuthenticationFailed
        );
        m.login("admin", "secret").unwrap();
        assert_eq!(m.session_count(), 1);
    }

    #[test]
    fn test_execute_fetch_dispose_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let session = m.login("admin", "secret").unwrap();

        let resp = m.execute(session, "SELECT * FROM Accounts").unwrap();
        let QueryOutcome::Rows(info) = resp.outcome else {
            panic!("expected rows");
        };
        assert_eq!(info.row_count, 2);
        assert_eq!(info.column_names(), vec!["number", "name"]);

        let rows = m.fetch(session, info.id, 0, 2).unwrap();
        assert_eq!(rows[0][1], Cell::String("Cash".into()));
        assert_eq!(rows[1][1], Cell::String("Rent".into()));

        m.dispose(session, info.id).unwrap();
        assert!(matches!(
            m.fetch(session, info.id, 0, 1),
            Err(SessionError::ForeignResult)
        ));
        assert_eq!(m.db().open_results(), 0);
    }

    #[test]
    fn test_unparseable_query_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let session = m.login("admin", "secret").unwrap();
        let err = m.execute(session, "EXPLAIN EVERYTHING").unwrap_err();
        assert_eq!(err.code(), 20);
    }

    #[test]
    fn test_foreign_result_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let a = m.login("admin", "secret").unwrap();
        let b = m.login("admin", "secret").unwrap();
        let resp = m.execute(a, "SELECT * FROM Accounts").unwrap();
        let QueryOutcome::Rows(info) = resp.outcome else {
            panic!("expected rows");
        };
        assert!(matches!(
            m.fetch(b, info.id, 0, 1),
            Err(SessionError::ForeignResult)
        ));
        m.logout(a).unwrap();
    }

    #[test]
    fn test_logout_releases_published_results() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let session = m.login("admin", "secret").unwrap();
        for _ in 0..3 {
            m.execute(session, "SELECT * FROM Accounts").unwrap();
        }
        assert_eq!(m.db().open_results(), 3);
        m.logout(session).unwrap();
        assert_eq!(m.db().open_results(), 0);
        assert!(matches!(
            m.execute(session, "SELECT * FROM Accounts"),
            Err(SessionError::UnknownSession)
        ));
    }

    #[test]
    fn test_teardown_ends_everything() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let a = m.login("admin", "secret").unwrap();
        let _b = m.login("admin", "secret").unwrap();
        m.execute(a, "SELECT * FROM Accounts").unwrap();
        m.teardown();
        assert_eq!(m.session_count(), 0);
        assert_eq!(m.db().open_results(), 0);
    }
}
