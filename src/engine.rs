// Room lifecycle engine.
//
// The central event loop that coordinates race rooms: admission and
// eviction of participants, progress snapshots, and the timer-driven
// transitions (start countdown, completion, time-limit expiry). All room
// state is owned by a single engine task fed by one mpsc channel, so every
// event — an inbound client message, a connection closing, a countdown
// firing — is processed to completion before the next one. No locks guard
// the room maps; ordering of `race_update` broadcasts per room matches the
// order events were processed.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RaceConfig;
use crate::model::{Participant, RaceStatus};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{ConnectionId, Registry};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// Everything that can wake the engine. The transport layer produces the
/// first three; countdown timer tasks produce the last one.
#[derive(Debug)]
pub enum EngineEvent {
    /// A client connected; `outbound` is the channel to its socket writer.
    Connected {
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<String>,
    },
    /// A text frame arrived from a client.
    Inbound { conn: ConnectionId, text: String },
    /// The client's connection closed.
    Disconnected { conn: ConnectionId },
    /// A start countdown armed earlier has elapsed. The start condition is
    /// re-checked on receipt; the firing itself guarantees nothing.
    CountdownElapsed { race_id: String },
}

/// Failures surfaced to the originating connection as an `error` frame.
/// None of these are fatal to the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("race is not open for joining")]
    RaceUnavailable,

    #[error("race is full")]
    RaceFull,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// The message sent back to the client. Internal failures are
    /// deliberately generic; details stay in the server log.
    fn client_message(&self) -> String {
        match self {
            EngineError::RaceUnavailable => "race is not open for joining".into(),
            EngineError::RaceFull => "race is full".into(),
            EngineError::MalformedMessage(_) => "malformed message".into(),
            EngineError::Internal(_) => "internal server error".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the store, the connection registry, and the pending start
/// countdowns. Created once at process start; all mutation happens on the
/// task running [`Engine::run`].
pub struct Engine {
    store: Store,
    registry: Registry,
    race_config: RaceConfig,
    /// Clone handed to countdown tasks so their firing re-enters the event
    /// loop instead of mutating state from a timer context.
    events_tx: mpsc::Sender<EngineEvent>,
    /// At most one pending countdown per race. Joins while one is pending
    /// do not stack timers; the handle is aborted when the room empties.
    pending_countdowns: HashMap<String, JoinHandle<()>>,
}

impl Engine {
    pub fn new(store: Store, race_config: RaceConfig, events_tx: mpsc::Sender<EngineEvent>) -> Self {
        Engine {
            store,
            registry: Registry::new(),
            race_config,
            events_tx,
            pending_countdowns: HashMap::new(),
        }
    }

    /// Read access to the store, for the directory surface and tests.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run the engine until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> anyhow::Result<()> {
        info!("Room lifecycle engine started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        // Channel closed: the process is shutting down. Pending countdowns
        // would fire into a dead channel; abort them instead.
        for (_, handle) in self.pending_countdowns.drain() {
            handle.abort();
        }
        info!("Room lifecycle engine exiting");
        Ok(())
    }

    /// Process one event to completion. A handler failure is answered to
    /// the originating connection only; it never tears down the engine.
    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connected { conn, outbound } => {
                let player_id = self.registry.register(conn, outbound);
                debug!("Connection {} registered as {}", conn, player_id);
            }
            EngineEvent::Inbound { conn, text } => self.handle_inbound(conn, &text),
            EngineEvent::Disconnected { conn } => {
                if let Err(e) = self.handle_disconnect(conn) {
                    warn!("Error while handling disconnect of {}: {}", conn, e);
                }
            }
            EngineEvent::CountdownElapsed { race_id } => {
                if let Err(e) = self.handle_countdown_elapsed(&race_id) {
                    warn!("Start countdown for race {} failed: {}", race_id, e);
                }
            }
        }
    }

    fn handle_inbound(&mut self, conn: ConnectionId, text: &str) {
        let result = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.dispatch(conn, message),
            Err(e) => Err(EngineError::MalformedMessage(e.to_string())),
        };
        if let Err(err) = result {
            self.respond_error(conn, &err);
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, message: ClientMessage) -> Result<(), EngineError> {
        match message {
            ClientMessage::JoinRace {
                race_id,
                player_name,
            } => self.handle_join(conn, &race_id, player_name),
            ClientMessage::LeaveRace { race_id } => self.handle_leave(conn, &race_id),
            ClientMessage::TypingUpdate {
                race_id,
                progress,
                wpm,
                accuracy,
                errors,
            } => self.handle_typing_update(conn, &race_id, progress, wpm, accuracy, errors),
        }
    }

    /// Send an `error` frame to the originating connection. Internal
    /// failures are logged with detail here and reported generically.
    fn respond_error(&mut self, conn: ConnectionId, err: &EngineError) {
        if let EngineError::Internal(e) = err {
            warn!("Internal failure handling message from {}: {:#}", conn, e);
        } else {
            debug!("Rejecting message from {}: {}", conn, err);
        }
        let frame = ServerMessage::Error {
            message: err.client_message(),
        };
        match frame.to_json() {
            Ok(json) => {
                self.registry.send_to(conn, &json);
            }
            Err(e) => warn!("Failed to serialize error frame: {}", e),
        }
    }

    // -----------------------------------------------------------------------
    // Join / leave / disconnect
    // -----------------------------------------------------------------------

    fn handle_join(
        &mut self,
        conn: ConnectionId,
        race_id: &str,
        player_name: String,
    ) -> Result<(), EngineError> {
        // A connection races one room at a time: joining while attached
        // leaves the previous room first.
        if let Some(previous) = self
            .registry
            .session(conn)
            .and_then(|s| s.race_id.clone())
        {
            self.handle_leave(conn, &previous)?;
        }

        let race = self
            .store
            .get_race(race_id)?
            .ok_or(EngineError::RaceUnavailable)?;
        if race.status != RaceStatus::Waiting {
            return Err(EngineError::RaceUnavailable);
        }
        let count = self.store.participant_count(race_id)?;
        if count >= race.max_players {
            return Err(EngineError::RaceFull);
        }

        let player_id = self
            .registry
            .session(conn)
            .map(|s| s.player_id.clone())
            .ok_or_else(|| anyhow!("no session registered for connection {conn}"))?;

        let participant = Participant::new(race_id.to_string(), player_id, player_name);
        self.store.insert_participant(&participant)?;
        self.registry.attach(conn, race_id);

        info!(
            "{} ({}) joined race {} ({}/{})",
            participant.name,
            participant.player_id,
            race_id,
            count + 1,
            race.max_players
        );

        // Full snapshot to the joiner, join notification to the existing
        // members, then an updated snapshot to everyone (joiner included).
        let participants = self.store.participants_of(race_id)?;
        let snapshot = ServerMessage::RaceUpdate {
            race,
            participants,
        }
        .to_json()?;
        self.registry.send_to(conn, &snapshot);

        let joined = ServerMessage::PlayerJoined {
            race_id: race_id.to_string(),
            participant,
        }
        .to_json()?;
        self.registry.broadcast(race_id, &joined, Some(conn));
        self.registry.broadcast(race_id, &snapshot, None);

        self.maybe_schedule_start(race_id)?;
        Ok(())
    }

    /// Remove a participant and its room attachment. Idempotent: leaving a
    /// race you are not in (or that does not exist) is a no-op.
    fn handle_leave(&mut self, conn: ConnectionId, race_id: &str) -> Result<(), EngineError> {
        let Some(session) = self.registry.session(conn) else {
            return Ok(());
        };
        let player_id = session.player_id.clone();

        self.store.delete_participant(race_id, &player_id)?;
        if session_attached_to(&self.registry, conn, race_id) {
            self.registry.detach(conn);
        }

        let left = ServerMessage::PlayerLeft {
            race_id: race_id.to_string(),
            player_id: player_id.clone(),
        }
        .to_json()?;
        self.registry.broadcast(race_id, &left, None);
        debug!("{} left race {}", player_id, race_id);

        // An empty room has no one left to start for; drop its pending
        // countdown rather than letting it fire into a no-op.
        if self.registry.members_of(race_id).is_empty() {
            self.cancel_countdown(race_id);
        }
        Ok(())
    }

    /// A closed connection is an implicit leave for whatever race the
    /// session was attached to, followed by session teardown.
    fn handle_disconnect(&mut self, conn: ConnectionId) -> Result<(), EngineError> {
        let attached = self
            .registry
            .session(conn)
            .and_then(|s| s.race_id.clone());
        if let Some(race_id) = attached {
            self.handle_leave(conn, &race_id)?;
        }
        self.registry.unregister(conn);
        debug!("Connection {} disconnected", conn);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Typing updates and finish detection
    // -----------------------------------------------------------------------

    fn handle_typing_update(
        &mut self,
        conn: ConnectionId,
        race_id: &str,
        progress: u32,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    ) -> Result<(), EngineError> {
        // Updates only count while the race runs; anything else (including
        // an unknown race id) is silently dropped.
        let Some(race) = self.store.get_race(race_id)? else {
            return Ok(());
        };
        if race.status != RaceStatus::Active {
            return Ok(());
        }
        let Some(session) = self.registry.session(conn) else {
            return Ok(());
        };
        let player_id = session.player_id.clone();

        let updated = self
            .store
            .update_participant_progress(race_id, &player_id, progress, wpm, accuracy, errors)?;
        if !updated {
            return Ok(());
        }

        if progress >= race.text_length() {
            // First completion wins; repeated full-progress reports must
            // not restamp the finish time and shuffle ranks.
            if let Some(participant) = self.store.get_participant(race_id, &player_id)? {
                if !participant.finished {
                    self.store
                        .mark_participant_finished(race_id, &player_id, Utc::now())?;
                    info!("{} finished race {}", player_id, race_id);
                }
            }
        }

        self.broadcast_snapshot(race_id)?;
        self.evaluate_finish(race_id)?;
        Ok(())
    }

    /// Finish check, evaluated after every accepted typing update. The
    /// time limit is checked lazily — there is no background expiry clock,
    /// so a race whose participants all go quiet stays active until its
    /// next triggering event.
    fn evaluate_finish(&mut self, race_id: &str) -> Result<(), EngineError> {
        let Some(race) = self.store.get_race(race_id)? else {
            return Ok(());
        };
        if race.status != RaceStatus::Active {
            return Ok(());
        }
        let started_at = race
            .started_at
            .ok_or_else(|| anyhow!("active race {race_id} has no start timestamp"))?;

        let now = Utc::now();
        let participants = self.store.participants_of(race_id)?;
        let all_finished = !participants.is_empty() && participants.iter().all(|p| p.finished);
        let time_up = now - started_at >= chrono::Duration::seconds(race.time_limit_secs as i64);
        if !(all_finished || time_up) {
            return Ok(());
        }

        self.store.mark_race_finished(race_id, now)?;

        // Dense ranks 1..N over the finishers, ordered by finish time.
        // `participants_of` returns insertion order and the sort is stable,
        // so identical timestamps keep their join order.
        let mut finishers: Vec<&Participant> =
            participants.iter().filter(|p| p.finished).collect();
        finishers.sort_by_key(|p| p.finished_at);
        for (index, finisher) in finishers.iter().enumerate() {
            self.store
                .set_participant_rank(race_id, &finisher.player_id, index as u32 + 1)?;
        }

        let results = self.store.participants_of(race_id)?;
        let frame = ServerMessage::RaceFinished {
            race_id: race_id.to_string(),
            results,
        }
        .to_json()?;
        self.registry.broadcast(race_id, &frame, None);
        info!(
            "Race {} finished ({} of {} participants ranked)",
            race_id,
            finishers.len(),
            participants.len()
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Start countdown
    // -----------------------------------------------------------------------

    /// Arm the start countdown if the start condition holds and no
    /// countdown is already pending for this race. Additional joins while
    /// one is pending neither cancel nor stack timers.
    fn maybe_schedule_start(&mut self, race_id: &str) -> Result<(), EngineError> {
        if self.pending_countdowns.contains_key(race_id) {
            return Ok(());
        }
        let Some(race) = self.store.get_race(race_id)? else {
            return Ok(());
        };
        if race.status != RaceStatus::Waiting {
            return Ok(());
        }
        let count = self.store.participant_count(race_id)?;
        if count < self.race_config.min_players_to_start {
            return Ok(());
        }

        let delay = Duration::from_secs(self.race_config.countdown_secs);
        let events_tx = self.events_tx.clone();
        let race_id_owned = race_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx
                .send(EngineEvent::CountdownElapsed {
                    race_id: race_id_owned,
                })
                .await;
        });
        self.pending_countdowns.insert(race_id.to_string(), handle);
        info!(
            "Start countdown armed for race {} ({}s)",
            race_id, self.race_config.countdown_secs
        );
        Ok(())
    }

    /// The countdown elapsed. Both the status and the participant count may
    /// have changed while it ran, so the start condition is re-checked; a
    /// failed re-check is a quiet no-op with no retry.
    fn handle_countdown_elapsed(&mut self, race_id: &str) -> Result<(), EngineError> {
        self.pending_countdowns.remove(race_id);

        let Some(race) = self.store.get_race(race_id)? else {
            return Ok(());
        };
        if race.status != RaceStatus::Waiting {
            return Ok(());
        }
        let count = self.store.participant_count(race_id)?;
        if count < self.race_config.min_players_to_start {
            debug!(
                "Countdown for race {} lapsed with {} participant(s); not starting",
                race_id, count
            );
            return Ok(());
        }

        self.store.mark_race_started(race_id, Utc::now())?;
        info!("Race {} started with {} participants", race_id, count);

        let started = ServerMessage::RaceStarted {
            race_id: race_id.to_string(),
        }
        .to_json()?;
        self.registry.broadcast(race_id, &started, None);
        self.broadcast_snapshot(race_id)?;
        Ok(())
    }

    fn cancel_countdown(&mut self, race_id: &str) {
        if let Some(handle) = self.pending_countdowns.remove(race_id) {
            handle.abort();
            debug!("Cancelled start countdown for race {}", race_id);
        }
    }

    /// Broadcast the full (race, participants) snapshot to every member.
    fn broadcast_snapshot(&mut self, race_id: &str) -> Result<(), EngineError> {
        let Some(race) = self.store.get_race(race_id)? else {
            return Ok(());
        };
        let participants = self.store.participants_of(race_id)?;
        let frame = ServerMessage::RaceUpdate { race, participants }.to_json()?;
        self.registry.broadcast(race_id, &frame, None);
        Ok(())
    }
}

fn session_attached_to(registry: &Registry, conn: ConnectionId, race_id: &str) -> bool {
    registry
        .session(conn)
        .and_then(|s| s.race_id.as_deref())
        .is_some_and(|attached| attached == race_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
