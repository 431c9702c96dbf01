// Race directory: the request/response surface for room discovery.
//
// Thin CRUD wrappers over the store. An HTTP router (or any other outer
// transport) is expected to sit in front of these functions; none of the
// room lifecycle logic lives here.

use rand::seq::SliceRandom;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{Difficulty, Participant, Passage, Race, RaceStatus};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("race not found: {0}")]
    RaceNotFound(String),

    #[error("no passages available for difficulty {0}")]
    NoPassageForDifficulty(Difficulty),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Parameters for creating a race.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRaceRequest {
    pub name: String,
    pub max_players: u32,
    pub difficulty: Difficulty,
    #[serde(rename = "timeLimit")]
    pub time_limit_secs: u32,
}

/// Create a race in the `waiting` state. The reference text is drawn
/// uniformly from the passages matching the requested difficulty and is
/// fixed for the race's lifetime.
pub fn create_race(store: &Store, request: CreateRaceRequest) -> Result<Race, ApiError> {
    let pool = store.passages_with_difficulty(request.difficulty)?;
    let passage = pool
        .choose(&mut rand::thread_rng())
        .ok_or(ApiError::NoPassageForDifficulty(request.difficulty))?;

    let race = Race::new(
        Store::generate_race_id(),
        request.name,
        passage.content.clone(),
        request.max_players,
        request.difficulty,
        request.time_limit_secs,
    );
    store.insert_race(&race)?;
    Ok(race)
}

/// List races, optionally filtered by lifecycle status.
pub fn list_races(store: &Store, status: Option<RaceStatus>) -> Result<Vec<Race>, ApiError> {
    Ok(store.list_races(status)?)
}

/// Fetch a race with its current participants.
pub fn get_race(store: &Store, race_id: &str) -> Result<(Race, Vec<Participant>), ApiError> {
    let race = store
        .get_race(race_id)?
        .ok_or_else(|| ApiError::RaceNotFound(race_id.to_string()))?;
    let participants = store.participants_of(race_id)?;
    Ok((race, participants))
}

/// List the passage corpus.
pub fn list_passages(store: &Store) -> Result<Vec<Passage>, ApiError> {
    Ok(store.list_passages()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passages;

    fn seeded_store() -> Store {
        let store = Store::open(":memory:").unwrap();
        passages::seed_defaults(&store).unwrap();
        store
    }

    fn request(difficulty: Difficulty) -> CreateRaceRequest {
        CreateRaceRequest {
            name: "Lunch break race".into(),
            max_players: 4,
            difficulty,
            time_limit_secs: 180,
        }
    }

    #[test]
    fn create_race_assigns_matching_passage_text() {
        let store = seeded_store();
        let race = create_race(&store, request(Difficulty::Medium)).unwrap();

        assert_eq!(race.status, RaceStatus::Waiting);
        assert_eq!(race.difficulty, Difficulty::Medium);
        let medium = store.passages_with_difficulty(Difficulty::Medium).unwrap();
        assert!(medium.iter().any(|p| p.content == race.text));

        // The race is persisted, not just returned.
        let loaded = store.get_race(&race.id).unwrap().unwrap();
        assert_eq!(loaded.text, race.text);
    }

    #[test]
    fn create_race_without_matching_passages_fails() {
        let store = Store::open(":memory:").unwrap();
        let err = create_race(&store, request(Difficulty::Hard)).unwrap_err();
        assert!(matches!(err, ApiError::NoPassageForDifficulty(Difficulty::Hard)));
    }

    #[test]
    fn create_race_request_parses_wire_json() {
        let json = r#"{"name":"Evening race","maxPlayers":6,"difficulty":"hard","timeLimit":240}"#;
        let request: CreateRaceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.max_players, 6);
        assert_eq!(request.difficulty, Difficulty::Hard);
        assert_eq!(request.time_limit_secs, 240);
    }

    #[test]
    fn list_races_filters_by_status() {
        let store = seeded_store();
        let open = create_race(&store, request(Difficulty::Easy)).unwrap();
        let started = create_race(&store, request(Difficulty::Easy)).unwrap();
        store
            .mark_race_started(&started.id, chrono::Utc::now())
            .unwrap();

        let waiting = list_races(&store, Some(RaceStatus::Waiting)).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, open.id);
        assert_eq!(list_races(&store, None).unwrap().len(), 2);
    }

    #[test]
    fn get_race_returns_participants() {
        let store = seeded_store();
        let race = create_race(&store, request(Difficulty::Easy)).unwrap();
        let participant = Participant::new(race.id.clone(), "p_1".into(), "alice".into());
        store.insert_participant(&participant).unwrap();

        let (loaded, participants) = get_race(&store, &race.id).unwrap();
        assert_eq!(loaded.id, race.id);
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].name, "alice");
    }

    #[test]
    fn get_missing_race_is_not_found() {
        let store = seeded_store();
        let err = get_race(&store, "race_nope").unwrap_err();
        assert!(matches!(err, ApiError::RaceNotFound(_)));
    }

    #[test]
    fn list_passages_returns_seeded_corpus() {
        let store = seeded_store();
        let all = list_passages(&store).unwrap();
        assert!(all.len() >= 9);
        assert!(all.iter().all(|p| p.length > 0));
    }
}
