use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::Fixture;

use crate::error::SinkError;
use crate::sink::FixtureSink;

/// Thread-safe SQLite fixture store (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<(), SinkError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Connectivity("database lock poisoned".to_string()))
    }

    // ── Fixtures ──────────────────────────────────────────────────────────────

    /// Upsert a batch of fixtures in one transaction. Re-ingesting an id
    /// overwrites every field and lifts any tombstone.
    pub fn upsert_fixtures(&self, fixtures: &[Fixture]) -> Result<(), SinkError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fixtures (id, round, year, home_team, away_team,
                                       home_score, away_score, winner, completion,
                                       updated_at, removed_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,NULL)
                 ON CONFLICT(id) DO UPDATE SET
                    round=excluded.round,
                    year=excluded.year,
                    home_team=excluded.home_team,
                    away_team=excluded.away_team,
                    home_score=excluded.home_score,
                    away_score=excluded.away_score,
                    winner=excluded.winner,
                    completion=excluded.completion,
                    updated_at=excluded.updated_at,
                    removed_at=NULL",
            )?;
            let now = Utc::now();
            for f in fixtures {
                stmt.execute(params![
                    f.id,
                    f.round,
                    f.year,
                    f.home_team,
                    f.away_team,
                    f.home_score(),
                    f.away_score(),
                    f.winner,
                    f.completion(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark a fixture as removed upstream. The row is kept as a tombstone.
    pub fn tombstone_fixture(&self, id: i64) -> Result<bool, SinkError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fixtures SET removed_at=?1 WHERE id=?2 AND removed_at IS NULL",
            params![Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// Number of live (non-tombstoned) fixtures
    pub fn count_fixtures(&self) -> Result<i64, SinkError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM fixtures WHERE removed_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Fetch a fixture by id, with its tombstone flag.
    #[cfg(test)]
    pub fn get_fixture(&self, id: i64) -> Result<Option<(Fixture, bool)>, SinkError> {
        use rusqlite::OptionalExtension;

        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, round, year, home_team, away_team, home_score,
                        away_score, winner, completion, removed_at IS NOT NULL
                 FROM fixtures WHERE id=?1",
                params![id],
                |row| {
                    let raw = models::RawGame {
                        id: row.get(0)?,
                        round: row.get(1)?,
                        year: row.get(2)?,
                        hteam: row.get(3)?,
                        ateam: row.get(4)?,
                        hscore: row.get(5)?,
                        ascore: row.get(6)?,
                        winner: row.get(7)?,
                        complete: row.get(8)?,
                    };
                    let removed: bool = row.get(9)?;
                    Ok((raw, removed))
                },
            )
            .optional()?;
        match row {
            Some((raw, removed)) => {
                let fixture = Fixture::try_from(raw)
                    .map_err(|e| SinkError::Constraint(e.to_string()))?;
                Ok(Some((fixture, removed)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FixtureSink for Database {
    async fn upsert_all(&self, fixtures: &[Fixture]) -> Result<(), SinkError> {
        if fixtures.is_empty() {
            return Ok(());
        }
        self.upsert_fixtures(fixtures)
    }

    async fn remove(&self, id: i64) -> Result<(), SinkError> {
        self.tombstone_fixture(id).map(|_| ())
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS fixtures (
    id          INTEGER PRIMARY KEY,
    round       INTEGER NOT NULL,
    year        INTEGER NOT NULL,
    home_team   TEXT    NOT NULL,
    away_team   TEXT    NOT NULL,
    home_score  INTEGER CHECK (home_score IS NULL OR home_score >= 0),
    away_score  INTEGER CHECK (away_score IS NULL OR away_score >= 0),
    winner      TEXT,
    completion  INTEGER NOT NULL CHECK (completion BETWEEN 0 AND 100),
    updated_at  TEXT    NOT NULL,
    removed_at  TEXT
);

CREATE INDEX IF NOT EXISTS idx_fixtures_year_round ON fixtures(year, round);
"#;
