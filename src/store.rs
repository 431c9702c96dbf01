// SQLite persistence layer for races, participants, and text passages.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{Difficulty, Participant, Passage, Race, RaceStatus};

/// SQLite-backed record of races, their participants, and the passage
/// corpus. Pure data access: no timing logic, no broadcast knowledge.
///
/// Timestamps are stored as RFC 3339 text. Participant listing order is
/// insertion order (rowid), which the engine relies on as the stable
/// tie-break when two finishers share a timestamp.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS passages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                content    TEXT NOT NULL UNIQUE,
                difficulty TEXT NOT NULL,
                length     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS races (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                text            TEXT NOT NULL,
                max_players     INTEGER NOT NULL,
                difficulty      TEXT NOT NULL,
                time_limit_secs INTEGER NOT NULL,
                status          TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                started_at      TEXT,
                finished_at     TEXT
            );

            CREATE TABLE IF NOT EXISTS participants (
                race_id     TEXT NOT NULL REFERENCES races(id),
                player_id   TEXT NOT NULL,
                name        TEXT NOT NULL,
                progress    INTEGER NOT NULL DEFAULT 0,
                wpm         REAL NOT NULL DEFAULT 0,
                accuracy    REAL NOT NULL DEFAULT 100,
                errors      INTEGER NOT NULL DEFAULT 0,
                finished    INTEGER NOT NULL DEFAULT 0,
                finished_at TEXT,
                rank        INTEGER,
                PRIMARY KEY (race_id, player_id)
            );

            CREATE INDEX IF NOT EXISTS idx_races_status ON races(status);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Generate a unique race identifier: wall-clock prefix for log
    /// readability, random suffix so same-instant creations cannot collide.
    pub fn generate_race_id() -> String {
        let now = Utc::now();
        format!(
            "{}_{:08x}",
            now.format("race_%Y%m%d_%H%M%S"),
            rand::random::<u32>()
        )
    }

    // -----------------------------------------------------------------------
    // Races
    // -----------------------------------------------------------------------

    /// Persist a newly created race.
    pub fn insert_race(&self, race: &Race) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO races
                (id, name, text, max_players, difficulty, time_limit_secs,
                 status, created_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                race.id,
                race.name,
                race.text,
                race.max_players,
                race.difficulty.as_str(),
                race.time_limit_secs,
                race.status.as_str(),
                race.created_at.to_rfc3339(),
                race.started_at.map(|t| t.to_rfc3339()),
                race.finished_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("failed to insert race")?;
        Ok(())
    }

    /// Fetch a race by id. Returns `None` if it does not exist.
    pub fn get_race(&self, race_id: &str) -> Result<Option<Race>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, text, max_players, difficulty, time_limit_secs,
                    status, created_at, started_at, finished_at
             FROM races WHERE id = ?1",
            params![race_id],
            map_race_row,
        )
        .optional()
        .context("failed to query race")
    }

    /// List races, optionally filtered by status, newest first.
    pub fn list_races(&self, status: Option<RaceStatus>) -> Result<Vec<Race>> {
        let conn = self.conn();
        let mut races = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, name, text, max_players, difficulty, time_limit_secs,
                                status, created_at, started_at, finished_at
                         FROM races WHERE status = ?1 ORDER BY created_at DESC",
                    )
                    .context("failed to prepare list_races query")?;
                let rows = stmt
                    .query_map(params![status.as_str()], map_race_row)
                    .context("failed to query races by status")?;
                for row in rows {
                    races.push(row.context("failed to map race row")?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, name, text, max_players, difficulty, time_limit_secs,
                                status, created_at, started_at, finished_at
                         FROM races ORDER BY created_at DESC",
                    )
                    .context("failed to prepare list_races query")?;
                let rows = stmt
                    .query_map([], map_race_row)
                    .context("failed to query races")?;
                for row in rows {
                    races.push(row.context("failed to map race row")?);
                }
            }
        }
        Ok(races)
    }

    /// Transition a race to `active`, stamping `started_at`.
    pub fn mark_race_started(&self, race_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE races SET status = 'active', started_at = ?2 WHERE id = ?1",
            params![race_id, at.to_rfc3339()],
        )
        .context("failed to mark race started")?;
        Ok(())
    }

    /// Transition a race to `finished`, stamping `finished_at`.
    pub fn mark_race_finished(&self, race_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE races SET status = 'finished', finished_at = ?2 WHERE id = ?1",
            params![race_id, at.to_rfc3339()],
        )
        .context("failed to mark race finished")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    /// Persist a new participant row.
    pub fn insert_participant(&self, participant: &Participant) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO participants
                (race_id, player_id, name, progress, wpm, accuracy, errors,
                 finished, finished_at, rank)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                participant.race_id,
                participant.player_id,
                participant.name,
                participant.progress,
                participant.wpm,
                participant.accuracy,
                participant.errors,
                participant.finished,
                participant.finished_at.map(|t| t.to_rfc3339()),
                participant.rank,
            ],
        )
        .context("failed to insert participant")?;
        Ok(())
    }

    /// Fetch one participant by composite key.
    pub fn get_participant(
        &self,
        race_id: &str,
        player_id: &str,
    ) -> Result<Option<Participant>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT race_id, player_id, name, progress, wpm, accuracy, errors,
                    finished, finished_at, rank
             FROM participants WHERE race_id = ?1 AND player_id = ?2",
            params![race_id, player_id],
            map_participant_row,
        )
        .optional()
        .context("failed to query participant")
    }

    /// List a race's participants in insertion order. The engine depends on
    /// this ordering as the stable tie-break for identical finish times.
    pub fn participants_of(&self, race_id: &str) -> Result<Vec<Participant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT race_id, player_id, name, progress, wpm, accuracy, errors,
                        finished, finished_at, rank
                 FROM participants WHERE race_id = ?1 ORDER BY rowid",
            )
            .context("failed to prepare participants_of query")?;
        let rows = stmt
            .query_map(params![race_id], map_participant_row)
            .context("failed to query participants")?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row.context("failed to map participant row")?);
        }
        Ok(participants)
    }

    /// Number of participants currently in a race.
    pub fn participant_count(&self, race_id: &str) -> Result<u32> {
        let conn = self.conn();
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM participants WHERE race_id = ?1",
                params![race_id],
                |row| row.get(0),
            )
            .context("failed to count participants")?;
        Ok(count)
    }

    /// Last-write-wins update of a participant's reported metrics. Returns
    /// `true` if a row was updated, `false` if the participant is unknown.
    pub fn update_participant_progress(
        &self,
        race_id: &str,
        player_id: &str,
        progress: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    ) -> Result<bool> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE participants
                 SET progress = ?3, wpm = ?4, accuracy = ?5, errors = ?6
                 WHERE race_id = ?1 AND player_id = ?2",
                params![race_id, player_id, progress, wpm, accuracy, errors],
            )
            .context("failed to update participant progress")?;
        Ok(updated > 0)
    }

    /// Mark a participant finished, stamping their finish time.
    pub fn mark_participant_finished(
        &self,
        race_id: &str,
        player_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE participants SET finished = 1, finished_at = ?3
             WHERE race_id = ?1 AND player_id = ?2",
            params![race_id, player_id, at.to_rfc3339()],
        )
        .context("failed to mark participant finished")?;
        Ok(())
    }

    /// Assign a final rank to a finished participant.
    pub fn set_participant_rank(
        &self,
        race_id: &str,
        player_id: &str,
        rank: u32,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE participants SET rank = ?3
             WHERE race_id = ?1 AND player_id = ?2",
            params![race_id, player_id, rank],
        )
        .context("failed to set participant rank")?;
        Ok(())
    }

    /// Hard-delete a participant. Deleting an absent participant is a no-op.
    pub fn delete_participant(&self, race_id: &str, player_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM participants WHERE race_id = ?1 AND player_id = ?2",
            params![race_id, player_id],
        )
        .context("failed to delete participant")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Passages
    // -----------------------------------------------------------------------

    /// Insert corpus entries, skipping any whose content is already present.
    /// Returns the number of newly inserted passages.
    pub fn seed_passages(&self, seeds: &[(String, Difficulty)]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("failed to begin passage seed transaction")?;
        let mut inserted = 0;
        for (content, difficulty) in seeds {
            let length = content.chars().count() as u32;
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO passages (content, difficulty, length)
                     VALUES (?1, ?2, ?3)",
                    params![content, difficulty.as_str(), length],
                )
                .context("failed to insert passage")?;
        }
        tx.commit().context("failed to commit passage seeds")?;
        Ok(inserted)
    }

    /// List the whole corpus.
    pub fn list_passages(&self) -> Result<Vec<Passage>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, content, difficulty, length FROM passages ORDER BY id")
            .context("failed to prepare list_passages query")?;
        let rows = stmt
            .query_map([], map_passage_row)
            .context("failed to query passages")?;

        let mut passages = Vec::new();
        for row in rows {
            passages.push(row.context("failed to map passage row")?);
        }
        Ok(passages)
    }

    /// List corpus entries of one difficulty tier.
    pub fn passages_with_difficulty(&self, difficulty: Difficulty) -> Result<Vec<Passage>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, content, difficulty, length FROM passages
                 WHERE difficulty = ?1 ORDER BY id",
            )
            .context("failed to prepare passages_with_difficulty query")?;
        let rows = stmt
            .query_map(params![difficulty.as_str()], map_passage_row)
            .context("failed to query passages by difficulty")?;

        let mut passages = Vec::new();
        for row in rows {
            passages.push(row.context("failed to map passage row")?);
        }
        Ok(passages)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn map_race_row(row: &Row<'_>) -> rusqlite::Result<Race> {
    let difficulty_raw: String = row.get(4)?;
    let status_raw: String = row.get(6)?;
    let created_at_raw: String = row.get(7)?;
    let started_at_raw: Option<String> = row.get(8)?;
    let finished_at_raw: Option<String> = row.get(9)?;

    Ok(Race {
        id: row.get(0)?,
        name: row.get(1)?,
        text: row.get(2)?,
        max_players: row.get(3)?,
        difficulty: parse_difficulty(4, &difficulty_raw)?,
        time_limit_secs: row.get(5)?,
        status: parse_status(6, &status_raw)?,
        created_at: parse_timestamp(7, &created_at_raw)?,
        started_at: parse_optional_timestamp(8, started_at_raw)?,
        finished_at: parse_optional_timestamp(9, finished_at_raw)?,
    })
}

fn map_participant_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    let finished_at_raw: Option<String> = row.get(8)?;
    Ok(Participant {
        race_id: row.get(0)?,
        player_id: row.get(1)?,
        name: row.get(2)?,
        progress: row.get(3)?,
        wpm: row.get(4)?,
        accuracy: row.get(5)?,
        errors: row.get(6)?,
        finished: row.get(7)?,
        finished_at: parse_optional_timestamp(8, finished_at_raw)?,
        rank: row.get(9)?,
    })
}

fn map_passage_row(row: &Row<'_>) -> rusqlite::Result<Passage> {
    let difficulty_raw: String = row.get(2)?;
    Ok(Passage {
        id: row.get(0)?,
        content: row.get(1)?,
        difficulty: parse_difficulty(2, &difficulty_raw)?,
        length: row.get(3)?,
    })
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(idx, e))
}

fn parse_optional_timestamp(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_status(idx: usize, raw: &str) -> rusqlite::Result<RaceStatus> {
    RaceStatus::parse(raw)
        .ok_or_else(|| column_error(idx, format!("unknown race status '{raw}'")))
}

fn parse_difficulty(idx: usize, raw: &str) -> rusqlite::Result<Difficulty> {
    Difficulty::parse(raw)
        .ok_or_else(|| column_error(idx, format!("unknown difficulty '{raw}'")))
}

fn column_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
