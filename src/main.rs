// Race server entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Open store, seed the passage corpus
// 4. Ensure there are open races to join
// 5. Create the engine event channel
// 6. Spawn the room lifecycle engine
// 7. Spawn the WebSocket server
// 8. Wait for Ctrl+C, then shut down

use keysprint::api::{self, CreateRaceRequest};
use keysprint::config;
use keysprint::engine::Engine;
use keysprint::model::{Difficulty, RaceStatus};
use keysprint::passages;
use keysprint::store::Store;
use keysprint::ws;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("keysprint starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: ws_port={}, countdown={}s, min_players={}",
        config.ws_port, config.race.countdown_secs, config.race.min_players_to_start
    );

    // 3. Open store and seed passages
    let store = Store::open(&config.db_path).context("failed to open store")?;
    info!("Store opened at {}", config.db_path);
    passages::seed_defaults(&store).context("failed to seed passage corpus")?;

    // 4. Make sure a fresh server has something joinable
    ensure_open_races(&store).context("failed to create starter races")?;

    // 5. Engine event channel
    let (events_tx, events_rx) = mpsc::channel(256);

    // 6. Spawn the room lifecycle engine
    let engine = Engine::new(store, config.race.clone(), events_tx.clone());
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = engine.run(events_rx).await {
            error!("Engine loop error: {}", e);
        }
    });

    // 7. Spawn the WebSocket server
    let ws_port = config.ws_port;
    let ws_events = events_tx.clone();
    let ws_handle = tokio::spawn(async move {
        match ws::WsListener::bind(ws_port).await {
            Ok(listener) => {
                if let Err(e) = ws::run(listener, ws_events).await {
                    error!("WebSocket server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind WebSocket server on port {}: {}", ws_port, e);
            }
        }
    });

    info!("Server ready on 127.0.0.1:{}", ws_port);

    // 8. Wait for Ctrl+C
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // Stop accepting connections, then let the engine drain its channel.
    ws_handle.abort();
    drop(events_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = engine_handle.await;
    })
    .await;

    info!("keysprint shut down cleanly");
    Ok(())
}

/// Create one waiting race per difficulty when none are open, so a fresh
/// server (or one whose races have all run) is immediately joinable.
fn ensure_open_races(store: &Store) -> anyhow::Result<()> {
    let waiting = api::list_races(store, Some(RaceStatus::Waiting))?;
    if !waiting.is_empty() {
        info!("{} open race(s) available", waiting.len());
        return Ok(());
    }

    for (difficulty, name) in [
        (Difficulty::Easy, "Easy warmup"),
        (Difficulty::Medium, "Standard sprint"),
        (Difficulty::Hard, "Expert gauntlet"),
    ] {
        let race = api::create_race(
            store,
            CreateRaceRequest {
                name: name.into(),
                max_players: 4,
                difficulty,
                time_limit_secs: 180,
            },
        )?;
        info!("Created starter race {} ({})", race.id, difficulty);
    }
    Ok(())
}

/// Initialize tracing to stdout with an env-filter override
/// (`RUST_LOG=keysprint=debug` for verbose engine logs).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("keysprint=info,warn")),
        )
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
