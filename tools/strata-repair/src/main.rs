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

//! Offline maintenance for strata data directories: structural check and
//! repair, journal compaction, migration to a new directory, and sequence
//! fast-forward. Takes the same
//! exclusive directory lock as a live server, so it can never run against
//! a conglomerate that is in use.

use clap::Parser;
use clap_derive::{Parser, Subcommand};
use eyre::{WrapErr, bail};
use std::path::PathBuf;
use strata_store::repair::{self, TerminalReporter};
use strata_store::Conglomerate;
use tracing::info;

#[derive(Parser)]
#[command(name = "strata-repair")]
#[command(about = "Check, repair and maintain strata data directories")]
struct Args {
    /// Path to the conglomerate data directory
    #[arg(long, value_name = "DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Report structural problems without modifying anything
    Check,
    /// Repair what can be repaired: quarantine orphan journal segments,
    /// reconcile header row counts, drop manifest entries with no data
    Fix,
    /// Merge accumulated journal segments into base storage
    Compact {
        /// Conglomerate name, as given at creation
        #[arg(long)]
        name: String,
        /// Compact only this table; all tables when omitted
        #[arg(long)]
        table: Option<String>,
    },
    /// Copy the conglomerate to a new directory, carrying every table and
    /// the last-used sequence values. Quarantined files stay behind
    Migrate {
        /// Destination directory; must not already hold a conglomerate
        #[arg(long, value_name = "DIR")]
        dest: PathBuf,
    },
    /// Jump a table's unique-ID sequence forward, e.g. after an import
    FastForward {
        /// Conglomerate name, as given at creation
        #[arg(long)]
        name: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        to: u64,
    },
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match args.command {
        Command::Check => {
            let mut reporter = TerminalReporter;
            let outcome = repair::check(&args.data_dir, &mut reporter)
                .wrap_err("structural check failed")?;
            if outcome.is_clean() {
                println!("clean: no problems found");
            } else {
                println!("{} problem(s) found; run `fix` to repair", outcome.problems);
                std::process::exit(1);
            }
        }
        Command::Fix => {
            let mut reporter = TerminalReporter;
            let outcome =
                repair::fix(&args.data_dir, &mut reporter).wrap_err("repair failed")?;
            println!(
                "{} problem(s) found, {} repaired",
                outcome.problems, outcome.repaired
            );
            if outcome.problems > outcome.repaired {
                bail!("some problems could not be repaired automatically");
            }
        }
        Command::Compact { name, table } => {
            let db = Conglomerate::open(&args.data_dir, &name)
                .wrap_err("could not open conglomerate")?;
            let tables = match table {
                Some(t) => vec![t],
                None => db.table_names(),
            };
            for t in &tables {
                db.flush_journals(t)
                    .wrap_err_with(|| format!("compaction of '{t}' failed"))?;
                info!("compacted '{t}'");
            }
            db.close()?;
            println!("compacted {} table(s)", tables.len());
        }
        Command::Migrate { dest } => {
            let mut reporter = TerminalReporter;
            repair::migrate(&args.data_dir, &dest, &mut reporter)
                .wrap_err("migration failed")?;
            println!("migrated to {}", dest.display());
        }
        Command::FastForward { name, table, to } => {
            let db = Conglomerate::open(&args.data_dir, &name)
                .wrap_err("could not open conglomerate")?;
            db.fast_forward_unique_id(&table, to)
                .wrap_err("fast-forward refused")?;
            db.close()?;
            println!("sequence for '{table}' now at {to}");
        }
    }
    Ok(())
}
