// Domain types shared between the store, the lifecycle engine, and the
// wire protocol.
//
// All wire-visible structs serialize with camelCase field names and
// lowercase enum strings; the JSON shapes predate this server and are
// fixed by the clients that consume them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Race
// ---------------------------------------------------------------------------

/// Lifecycle status of a race. Transitions only move forward:
/// `Waiting -> Active -> Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Waiting,
    Active,
    Finished,
}

impl RaceStatus {
    /// Stable string form used for storage and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Waiting => "waiting",
            RaceStatus::Active => "active",
            RaceStatus::Finished => "finished",
        }
    }

    /// Parse the storage string form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(RaceStatus::Waiting),
            "active" => Some(RaceStatus::Active),
            "finished" => Some(RaceStatus::Finished),
            _ => None,
        }
    }
}

/// Passage difficulty tag. Races request a difficulty at creation and get
/// a passage drawn uniformly from that tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single timed typing competition instance.
///
/// The reference `text` is assigned at creation from a passage matching the
/// requested difficulty and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    pub id: String,
    pub name: String,
    pub text: String,
    pub max_players: u32,
    pub difficulty: Difficulty,
    #[serde(rename = "timeLimit")]
    pub time_limit_secs: u32,
    pub status: RaceStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Race {
    /// Build a fresh race in the `Waiting` state.
    pub fn new(
        id: String,
        name: String,
        text: String,
        max_players: u32,
        difficulty: Difficulty,
        time_limit_secs: u32,
    ) -> Self {
        Race {
            id,
            name,
            text,
            max_players,
            difficulty,
            time_limit_secs,
            status: RaceStatus::Waiting,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Number of characters in the reference text. A participant whose
    /// reported progress reaches this count has completed the passage.
    pub fn text_length(&self) -> u32 {
        self.text.chars().count() as u32
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A connection's membership and live performance record within one race.
///
/// Keyed by `(race_id, player_id)`. Progress, wpm, accuracy and errors are
/// client-reported and trusted as-is (last write wins); the engine does not
/// cross-check them against each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub race_id: String,
    pub player_id: String,
    pub name: String,
    pub progress: u32,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
    pub finished: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub rank: Option<u32>,
}

impl Participant {
    /// Build a participant in its initial state: no progress, perfect
    /// accuracy, unfinished.
    pub fn new(race_id: String, player_id: String, name: String) -> Self {
        Participant {
            race_id,
            player_id,
            name,
            progress: 0,
            wpm: 0.0,
            accuracy: 100.0,
            errors: 0,
            finished: false,
            finished_at: None,
            rank: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Text passage
// ---------------------------------------------------------------------------

/// An immutable corpus entry. One is chosen pseudorandomly among entries of
/// the requested difficulty at race creation and copied into the race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    pub id: i64,
    pub content: String,
    pub difficulty: Difficulty,
    pub length: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
