// Wire protocol between clients and the lifecycle engine.
//
// Messages travel as JSON text frames over the WebSocket connection. Both
// directions use a closed tagged enum (`type` field selects the variant) so
// unknown event names fail to parse instead of silently falling through.

use serde::{Deserialize, Serialize};

use crate::model::{Participant, Race};

// ---------------------------------------------------------------------------
// Client -> engine
// ---------------------------------------------------------------------------

/// Events a client may send. Anything that does not parse into one of these
/// variants is answered with a generic `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request to join a waiting race under a display name.
    #[serde(rename_all = "camelCase")]
    JoinRace { race_id: String, player_name: String },

    /// Leave a race. Idempotent; leaving a race you are not in is a no-op.
    #[serde(rename_all = "camelCase")]
    LeaveRace { race_id: String },

    /// Incremental progress report. Ignored unless the race is active.
    /// All four metrics are client-computed and trusted as reported.
    #[serde(rename_all = "camelCase")]
    TypingUpdate {
        race_id: String,
        progress: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    },
}

// ---------------------------------------------------------------------------
// Engine -> client(s)
// ---------------------------------------------------------------------------

/// Events the engine emits. `RaceUpdate` is the full-room snapshot that
/// brings every client to a consistent view; the rest are incremental
/// notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full current (race, participants) snapshot.
    #[serde(rename_all = "camelCase")]
    RaceUpdate {
        race: Race,
        participants: Vec<Participant>,
    },

    /// The start countdown completed and the race is now active.
    #[serde(rename_all = "camelCase")]
    RaceStarted { race_id: String },

    /// The race finished; `results` is the full final participant list with
    /// ranks assigned to the finishers.
    #[serde(rename_all = "camelCase")]
    RaceFinished {
        race_id: String,
        results: Vec<Participant>,
    },

    /// A new participant joined; sent to members other than the joiner.
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        race_id: String,
        participant: Participant,
    },

    /// A participant left (or disconnected); sent to remaining members.
    #[serde(rename_all = "camelCase")]
    PlayerLeft { race_id: String, player_id: String },

    /// Generic error notification, delivered only to the originating
    /// connection.
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerMessage {
    /// Serialize to the JSON text-frame form. Serialization of these types
    /// cannot fail in practice; an error here indicates a bug, so it is
    /// propagated rather than papered over.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_race_parses_from_wire_json() {
        let json = r#"{"type":"join_race","raceId":"race_7","playerName":"alice"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRace {
                race_id: "race_7".into(),
                player_name: "alice".into(),
            }
        );
    }

    #[test]
    fn typing_update_parses_with_camel_case_fields() {
        let json = r#"{"type":"typing_update","raceId":"race_7","progress":42,"wpm":61.5,"accuracy":97.2,"errors":3}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::TypingUpdate {
                race_id,
                progress,
                wpm,
                accuracy,
                errors,
            } => {
                assert_eq!(race_id, "race_7");
                assert_eq!(progress, 42);
                assert_eq!(wpm, 61.5);
                assert_eq!(accuracy, 97.2);
                assert_eq!(errors, 3);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_name_fails_to_parse() {
        let json = r#"{"type":"spectate_race","raceId":"race_7"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn missing_field_fails_to_parse() {
        let json = r#"{"type":"join_race","raceId":"race_7"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn player_left_serializes_with_tag_and_camel_case() {
        let msg = ServerMessage::PlayerLeft {
            race_id: "race_7".into(),
            player_id: "p_1f".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "player_left");
        assert_eq!(json["raceId"], "race_7");
        assert_eq!(json["playerId"], "p_1f");
    }
}
