//! Schema migration runner.
//!
//! Migration files are embedded at build time and named
//! `NNNN_<scope>_<desc>.sql`, scope one of `main`, `active`, `group`
//! (alias `single`). Each database tracks applied files in a
//! `schema_migrations(filename, db_type)` table; on first open the
//! runner applies whatever is missing for that database's scope, in
//! filename order. For group databases the fully-migrated status is
//! cached per newsgroup so repeated opens skip the check.

use std::collections::HashSet;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::retry;

/// One embedded migration file.
pub struct Migration {
    pub filename: &'static str,
    pub sql: &'static str,
}

/// All migrations, in filename-sorted order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        filename: "0001_group_base.sql",
        sql: include_str!("../../migrations/0001_group_base.sql"),
    },
    Migration {
        filename: "0001_main_base.sql",
        sql: include_str!("../../migrations/0001_main_base.sql"),
    },
    Migration {
        filename: "0002_group_indexes.sql",
        sql: include_str!("../../migrations/0002_group_indexes.sql"),
    },
    Migration {
        filename: "0002_main_indexes.sql",
        sql: include_str!("../../migrations/0002_main_indexes.sql"),
    },
];

/// Which database family a migration file applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Main,
    Active,
    Group,
}

impl Scope {
    pub fn db_type(self) -> &'static str {
        match self {
            Scope::Main => "main",
            Scope::Active => "active",
            Scope::Group => "group",
        }
    }
}

/// Parse `NNNN_<scope>_<desc>.sql`; files with an unknown shape are
/// rejected rather than silently skipped.
pub fn parse_scope(filename: &str) -> Result<Scope> {
    let stem = filename
        .strip_suffix(".sql")
        .ok_or_else(|| Error::Migration(format!("not a .sql file: {filename}")))?;
    let mut parts = stem.splitn(3, '_');
    let seq = parts
        .next()
        .filter(|s| s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| Error::Migration(format!("missing sequence number: {filename}")))?;
    let _ = seq;
    let scope = parts
        .next()
        .ok_or_else(|| Error::Migration(format!("missing scope: {filename}")))?;
    match scope {
        "main" => Ok(Scope::Main),
        "active" => Ok(Scope::Active),
        "group" | "single" => Ok(Scope::Group),
        other => Err(Error::Migration(format!(
            "unknown migration scope {other:?} in {filename}"
        ))),
    }
}

/// Tracks which newsgroups' databases are known fully migrated.
#[derive(Default, Debug)]
pub struct MigrationRunner {
    migrated_groups: Mutex<HashSet<String>>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply missing migrations for `scope` to an open database.
    pub fn apply(&self, conn: &Connection, scope: Scope) -> Result<()> {
        retry::exec_batch(
            conn,
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                filename TEXT NOT NULL,
                db_type TEXT NOT NULL,
                PRIMARY KEY (filename, db_type)
            )",
        )?;

        let applied: HashSet<String> = retry::query_all(
            conn,
            "SELECT filename FROM schema_migrations WHERE db_type = ?1",
            &[&scope.db_type()],
            |row| row.get(0),
        )?
        .into_iter()
        .collect();

        for migration in MIGRATIONS {
            if parse_scope(migration.filename)? != scope {
                continue;
            }
            if applied.contains(migration.filename) {
                continue;
            }
            retry::exec_batch(conn, migration.sql)
                .map_err(|e| Error::Migration(format!("{}: {e}", migration.filename)))?;
            retry::exec(
                conn,
                "INSERT INTO schema_migrations (filename, db_type) VALUES (?1, ?2)",
                &[&migration.filename, &scope.db_type()],
            )?;
            debug!(migration = migration.filename, "applied migration");
        }
        Ok(())
    }

    /// Apply group-scope migrations unless this newsgroup's database is
    /// already known migrated.
    pub fn apply_group(&self, conn: &Connection, newsgroup: &str) -> Result<()> {
        {
            let migrated = self.migrated_groups.lock().expect("runner poisoned");
            if migrated.contains(newsgroup) {
                return Ok(());
            }
        }
        self.apply(conn, Scope::Group)?;
        self.migrated_groups
            .lock()
            .expect("runner poisoned")
            .insert(newsgroup.to_string());
        info!(group = newsgroup, "group database migrated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope() {
        assert_eq!(parse_scope("0001_main_base.sql").unwrap(), Scope::Main);
        assert_eq!(parse_scope("0002_group_indexes.sql").unwrap(), Scope::Group);
        assert_eq!(parse_scope("0003_single_fixup.sql").unwrap(), Scope::Group);
        assert_eq!(parse_scope("0004_active_sync.sql").unwrap(), Scope::Active);
        assert!(parse_scope("0001_unknown_x.sql").is_err());
        assert!(parse_scope("base.sql").is_err());
        assert!(parse_scope("0001_main_base.txt").is_err());
    }

    #[test]
    fn test_embedded_migrations_are_sorted_and_parseable() {
        let mut names: Vec<&str> = MIGRATIONS.iter().map(|m| m.filename).collect();
        let sorted = {
            let mut s = names.clone();
            s.sort();
            s
        };
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
        for m in MIGRATIONS {
            parse_scope(m.filename).unwrap();
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let runner = MigrationRunner::new();
        let conn = Connection::open_in_memory().unwrap();
        runner.apply(&conn, Scope::Main).unwrap();
        runner.apply(&conn, Scope::Main).unwrap();
        let applied: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE db_type = 'main'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(applied, 2);
        // Main tables exist, group tables do not.
        conn.query_row("SELECT COUNT(*) FROM newsgroups", [], |r| r.get::<_, i64>(0))
            .unwrap();
        assert!(conn
            .query_row("SELECT COUNT(*) FROM articles", [], |r| r.get::<_, i64>(0))
            .is_err());
    }

    #[test]
    fn test_apply_group_caches_status() {
        let runner = MigrationRunner::new();
        let conn = Connection::open_in_memory().unwrap();
        runner.apply_group(&conn, "alt.test").unwrap();
        assert!(runner
            .migrated_groups
            .lock()
            .unwrap()
            .contains("alt.test"));
        // Second call is a no-op via the cache.
        runner.apply_group(&conn, "alt.test").unwrap();
    }
}
