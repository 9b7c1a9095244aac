//! Wiring: configuration, media store, trigger table, gateway, event loop.
//!
//! Events are handled one at a time in the order the gateway delivers them,
//! so the dispatcher needs no locking.

use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::config::BotConfig;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::downloader::HttpFetcher;
use crate::events::GatewayEvent;
use crate::gateway::{self, GatewayConfig, DEFAULT_INTENTS};
use crate::http::DiscordHttpClient;
use crate::registry::{RegistryError, ResponseRegistry};
use crate::store::{MediaStore, StoreError};

/// Failures that stop the bot before it starts handling messages.
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Load the trigger table named by the config, or the built-in one.
pub fn load_registry(config: &BotConfig) -> Result<ResponseRegistry, RegistryError> {
    match &config.responses_file {
        Some(path) => {
            let registry = ResponseRegistry::from_file(path)?;
            info!(file = %path.display(), triggers = registry.len(), "loaded responses file");
            Ok(registry)
        }
        None => Ok(ResponseRegistry::builtin()),
    }
}

/// Build a dispatcher ready for the first message: directories exist and the
/// media list has been scanned once.
pub fn prepare(config: &BotConfig) -> Result<Dispatcher<HttpFetcher>, BotError> {
    let store = MediaStore::new(&config.media_root);
    store.ensure_directories()?;

    let registry = load_registry(config)?;
    let mut dispatcher = Dispatcher::new(store, registry, HttpFetcher::new());
    // A failed scan is logged inside and leaves the list empty.
    let _ = dispatcher.refresh();
    Ok(dispatcher)
}

/// Run the bot until the gateway gives up.
pub async fn start(config: BotConfig) -> Result<(), BotError> {
    let mut dispatcher = prepare(&config)?;
    let http = DiscordHttpClient::new(&config.token);

    let gw = gateway::connect(GatewayConfig {
        token: config.token.clone(),
        intents: DEFAULT_INTENTS,
    });
    info!(media_root = %config.media_root.display(), "gateway started, entering event loop");

    while let Ok(event) = gw.events.recv().await {
        match event {
            GatewayEvent::Ready(ready) => {
                info!(user = %ready.user.tag(), guilds = ready.guilds.len(), "bot is online");
                dispatcher.set_bot_user_id(ready.user.id);
            }

            GatewayEvent::MessageCreate(msg) => {
                let outcome = dispatcher.handle(&msg, &http).await;
                if outcome != Outcome::Ignored {
                    info!(message_id = %msg.id, channel_id = %msg.channel_id, ?outcome, "handled message");
                }
            }

            other => {
                if let Some(name) = other.unknown_name() {
                    trace!(event = %name, "unhandled gateway event");
                }
            }
        }
    }

    warn!("event stream ended, bot shutting down");
    if let Err(e) = gw.driver.await {
        error!(error = %e, "gateway driver panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Response;
    use crate::store::MediaKind;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(root: PathBuf, responses_file: Option<PathBuf>) -> BotConfig {
        BotConfig {
            token: "t".into(),
            media_root: root,
            responses_file,
        }
    }

    #[test]
    fn builtin_registry_without_responses_file() {
        let registry = load_registry(&config(".".into(), None)).unwrap();
        assert_eq!(registry, ResponseRegistry::builtin());
    }

    #[test]
    fn missing_responses_file_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path().into(), Some(tmp.path().join("missing.json")));
        assert!(matches!(prepare(&cfg), Err(BotError::Registry(_))));
    }

    #[test]
    fn prepare_creates_directories_and_scans() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("images")).unwrap();
        std::fs::write(tmp.path().join("images").join("image1.gif"), b"gif").unwrap();

        let dispatcher = prepare(&config(tmp.path().into(), None)).unwrap();

        assert!(dispatcher.store().dir(MediaKind::Video).is_dir());
        let elded = dispatcher
            .registry()
            .iter()
            .find(|t| t.trigger == "elded")
            .unwrap();
        match &elded.response {
            Response::Random { files, .. } => assert_eq!(files.len(), 1),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
