use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use seedpace_client::ClientAdapter;
use seedpace_config::{AppConfig, ConfigService};
use seedpace_engine::{EngineDeps, LimitEngine};
use seedpace_events::EventBus;
use seedpace_qbit::QbitManager;
use seedpace_site::SiteRegistry;
use seedpace_store::{HistoryStore, StateStore};

use crate::error::AppResult;
use crate::logging;

const CONFIG_ENV: &str = "SEEDPACE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "seedpace.json";

/// Resolve the configuration file path from the environment.
fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// Entry point for the supervisor boot sequence.
///
/// # Errors
///
/// Returns an error when configuration, client construction, or engine
/// startup fails; a partially started engine is rolled back before
/// returning.
pub async fn run_app() -> AppResult<()> {
    logging::init_logging()?;

    let path = config_path();
    info!(path = %path.display(), "loading configuration");
    let config: AppConfig = seedpace_config::load(&path)?;

    let manager = Arc::new(QbitManager::from_config(&config.clients)?);
    manager.connect_all().await;
    let connected = manager
        .instances()
        .await
        .iter()
        .filter(|instance| instance.connected)
        .count();
    info!(
        configured = config.clients.len(),
        connected, "client instances ready"
    );

    // Site scraper adapters are collaborator crates; registration happens
    // here once one is linked in. An empty registry disables site assist.
    let sites = SiteRegistry::new();

    let state_dir = if config.state_dir.as_os_str().is_empty() {
        PathBuf::from("state")
    } else {
        config.state_dir.clone()
    };
    let history_limit = config.settings.history_limit;

    let events = EventBus::new();
    let deps = EngineDeps {
        client: manager,
        sites,
        config: Arc::new(ConfigService::from_file(&path)),
        store: StateStore::new(&state_dir),
        history: HistoryStore::new(&state_dir, history_limit),
        events: events.clone(),
    };
    let engine = Arc::new(LimitEngine::new(deps)?);

    let dispatcher = spawn_event_logger(events.clone());

    engine.start()?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    engine.stop().await;
    dispatcher.abort();
    let _ = dispatcher.await;

    info!("seedpace shut down cleanly");
    Ok(())
}

/// The notification dispatcher: drains the bus into the structured log.
/// Outward transports (Telegram and friends) subscribe the same way.
fn spawn_event_logger(events: EventBus) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = events.subscribe(None);
        while let Some(envelope) = stream.next().await {
            match serde_json_compact(&envelope.event) {
                Ok(payload) => info!(
                    event = envelope.event.kind(),
                    id = envelope.id,
                    %payload,
                    "notification"
                ),
                Err(event_error) => error!(error = %event_error, "notification encode failed"),
            }
        }
    })
}

fn serde_json_compact(event: &seedpace_events::Event) -> Result<String, String> {
    serde_json::to_string(event).map_err(|error| error.to_string())
}
