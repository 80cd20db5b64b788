pub mod core;
pub mod error;
pub mod http;
pub mod library;
pub mod mpv;

use playsync_proto::config::Config;
use tokio::sync::{broadcast, mpsc};
use tracing::error;

use crate::core::{HubBroadcast, HubCore, HubEvent};
use crate::http::HubState;
use crate::library::MediaLibrary;

/// An assembled but not yet running hub.
pub struct Hub {
    core: HubCore,
    event_rx: mpsc::Receiver<HubEvent>,
    state: HubState,
}

impl Hub {
    pub fn new(config: Config) -> Self {
        let (broadcast_tx, _) = broadcast::channel::<HubBroadcast>(256);
        let (event_tx, event_rx) = mpsc::channel::<HubEvent>(256);
        let library = MediaLibrary::new(config.hub.media_root.clone());
        let core = HubCore::new(config, broadcast_tx.clone(), event_tx.clone());
        let state = HubState::new(core.shared_state(), event_tx, broadcast_tx, library);
        Self {
            core,
            event_rx,
            state,
        }
    }

    pub fn state(&self) -> HubState {
        self.state.clone()
    }

    /// Drive the event loop on the current task until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        self.core.run(self.event_rx).await
    }

    /// Start the event loop in the background and hand back the shared state
    /// the HTTP layer runs on.
    pub fn spawn_core(self) -> HubState {
        let state = self.state();
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!("HubCore exited with error: {}", e);
            }
        });
        state
    }
}
