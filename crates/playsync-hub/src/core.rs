/// HubCore: single-owner event loop for the player state.
///
/// Every input (client command, play request, mpv event, timer tick) arrives
/// as a `HubEvent`.  HubCore owns the `MpvDriver` and the working copy of
/// `PlayerState`; WebSocket tasks only ever read the published snapshot.
///
/// mpv integration is observation-driven: after each (re)connect we register
/// `observe_property` for every mirrored field and mpv pushes changes.  Changes
/// to what is loaded or how it plays are published immediately; position-only
/// changes are coalesced onto the flush tick.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use playsync_proto::config::Config;
use playsync_proto::protocol::{ClientMessage, ControlCommand, PlayMode, PlayerState};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::mpv::{
    MpvDriver, MpvEvent, MpvHandle, OBS_DURATION, OBS_EOF, OBS_FILENAME, OBS_IDLE, OBS_PAUSE,
    OBS_PLAYLIST_COUNT, OBS_PLAYLIST_POS, OBS_SPEED, OBS_TIME_POS, OBS_VOLUME,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Latest published snapshot, readable by every client task.
pub type SharedPlayerState = Arc<RwLock<PlayerState>>;

/// What the hub fans out to connected clients.
#[derive(Debug, Clone)]
pub enum HubBroadcast {
    State(PlayerState),
    /// A command from client `origin` was executed; everyone else is told.
    CommandExecuted { origin: u64, message: ClientMessage },
}

#[derive(Debug)]
pub enum HubEvent {
    Command {
        origin: u64,
        command: ControlCommand,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Load resolved media paths or URLs, spawning mpv if needed.
    Launch {
        targets: Vec<String>,
        mode: PlayMode,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Mpv(MpvEvent),
    FlushTick,
    HeartbeatTick,
    Shutdown,
}

pub struct HubCore {
    config: Config,
    published: SharedPlayerState,
    /// Working copy updated from property-change events.
    obs: PlayerState,
    /// Unpublished position changes are pending.
    dirty: bool,
    mpv_driver: MpvDriver,
    mpv_handle: Option<MpvHandle>,
    event_tx: mpsc::Sender<HubEvent>,
    broadcast_tx: broadcast::Sender<HubBroadcast>,
}

impl HubCore {
    pub fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<HubBroadcast>,
        event_tx: mpsc::Sender<HubEvent>,
    ) -> Self {
        let mpv_driver = MpvDriver::new(&config.mpv);
        let initial = PlayerState {
            volume: config.mpv.default_volume.min(100),
            ..PlayerState::default()
        };
        Self {
            config,
            published: Arc::new(RwLock::new(initial.clone())),
            obs: initial,
            dirty: false,
            mpv_driver,
            mpv_handle: None,
            event_tx,
            broadcast_tx,
        }
    }

    pub fn shared_state(&self) -> SharedPlayerState {
        Arc::clone(&self.published)
    }

    /// Run until `Shutdown` or until every sender is dropped.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<HubEvent>) -> anyhow::Result<()> {
        info!("HubCore: starting event loop");

        let flush_every = Duration::from_millis(self.config.hub.state_push_interval_ms.max(50));
        spawn_ticker(self.event_tx.clone(), flush_every, || HubEvent::FlushTick);
        spawn_ticker(self.event_tx.clone(), HEARTBEAT_INTERVAL, || HubEvent::HeartbeatTick);

        // Pick up an mpv that is already serving our socket.
        self.attach_existing().await;

        while let Some(evt) = event_rx.recv().await {
            match evt {
                HubEvent::Shutdown => {
                    info!("HubCore: shutdown requested");
                    break;
                }
                HubEvent::Command {
                    origin,
                    command,
                    reply,
                } => {
                    let result = self.handle_command(origin, command).await;
                    let _ = reply.send(result);
                }
                HubEvent::Launch {
                    targets,
                    mode,
                    reply,
                } => {
                    let result = self.launch(&targets, mode).await.map_err(|e| {
                        error!("HubCore: failed to load {:?}: {}", targets, e);
                        e.to_string()
                    });
                    let _ = reply.send(result);
                }
                HubEvent::Mpv(evt) => self.handle_mpv_event(evt).await,
                HubEvent::FlushTick => {
                    if self.dirty {
                        self.publish().await;
                    }
                }
                HubEvent::HeartbeatTick => self.heartbeat().await,
            }
        }

        info!("HubCore: event loop finished");
        self.mpv_driver.kill().await;
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, origin: u64, command: ControlCommand) -> Result<(), String> {
        let Some(handle) = self.live_handle() else {
            warn!("HubCore: {} ignored, mpv is not running", command.action());
            return Err("mpv is not running".to_string());
        };

        info!("HubCore: client {} → {:?}", origin, command);
        if let Err(e) = handle.execute(&command).await {
            error!("HubCore: command {} failed: {}", command.action(), e);
            return Err(e.to_string());
        }

        if let ControlCommand::Volume { level } = command {
            self.mpv_driver.last_volume = level;
        }

        let _ = self.broadcast_tx.send(HubBroadcast::CommandExecuted {
            origin,
            message: command.to_message(),
        });
        Ok(())
    }

    async fn launch(&mut self, targets: &[String], mode: PlayMode) -> anyhow::Result<()> {
        let handle = self.ensure_mpv_handle().await?;
        info!("HubCore: {:?} {} item(s), first {:?}", mode, targets.len(), targets.first());
        handle.load(targets, mode).await
    }

    // ── mpv connection ────────────────────────────────────────────────────────

    fn live_handle(&mut self) -> Option<MpvHandle> {
        if self.mpv_handle.as_ref().is_some_and(MpvHandle::is_closed) {
            debug!("HubCore: dropping closed mpv handle");
            self.mpv_handle = None;
        }
        self.mpv_handle.clone()
    }

    /// Forward driver events into our own loop.  One forwarder per connection.
    fn event_forwarder(&self) -> mpsc::Sender<MpvEvent> {
        let (tx, mut rx) = mpsc::channel::<MpvEvent>(64);
        let core_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = rx.recv().await {
                if core_tx.send(HubEvent::Mpv(evt)).await.is_err() {
                    break;
                }
            }
        });
        tx
    }

    async fn attach_existing(&mut self) {
        let forwarder = self.event_forwarder();
        if let Some(handle) = self.mpv_driver.try_attach(forwarder).await {
            self.adopt(handle);
        }
    }

    async fn ensure_mpv_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if self.mpv_driver.owns_process() && !self.mpv_driver.process_alive() {
            warn!("HubCore: mpv process died, dropping handle");
            self.mpv_handle = None;
        }
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let forwarder = self.event_forwarder();
        let handle = match self.mpv_driver.try_attach(forwarder.clone()).await {
            Some(h) => h,
            None => self.mpv_driver.spawn_and_connect(forwarder).await?,
        };
        self.adopt(handle.clone());
        Ok(handle)
    }

    fn adopt(&mut self, handle: MpvHandle) {
        let observer = handle.clone();
        tokio::spawn(async move {
            observer.observe_all_properties().await;
        });
        self.mpv_handle = Some(handle);
    }

    async fn heartbeat(&mut self) {
        let Some(handle) = self.mpv_handle.clone() else {
            return;
        };
        let process_dead = self.mpv_driver.owns_process() && !self.mpv_driver.process_alive();
        let responsive = !process_dead
            && matches!(
                tokio::time::timeout(PING_TIMEOUT, handle.ping()).await,
                Ok(Ok(()))
            );
        if !responsive {
            warn!("HubCore: heartbeat: mpv is gone, resetting player state");
            self.mpv_handle = None;
            self.mpv_driver.kill().await;
            self.obs = PlayerState {
                volume: self.mpv_driver.last_volume,
                ..PlayerState::default()
            };
            self.publish().await;
        }
    }

    // ── mpv events ────────────────────────────────────────────────────────────

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        let significant = if let Some((obs_id, data)) = evt.as_property_change() {
            apply_property(&mut self.obs, obs_id, data)
        } else {
            match evt.event_name() {
                // Without --keep-open mpv never sets eof-reached; end-file with
                // reason=eof is the only end-of-stream signal we get.
                Some("end-file") => {
                    let reason = evt.end_file_reason().unwrap_or("unknown");
                    info!("mpv: end-file reason={}", reason);
                    if reason == "eof" && !self.obs.eof {
                        self.obs.eof = true;
                        true
                    } else {
                        false
                    }
                }
                Some("start-file") => {
                    debug!("mpv: start-file");
                    let changed = self.obs.eof;
                    self.obs.eof = false;
                    changed
                }
                _ => false,
            }
        };

        self.obs.playing = !self.obs.paused && !self.obs.idle && self.obs.filename.is_some();
        if significant {
            self.publish().await;
        } else {
            self.dirty = true;
        }
    }

    async fn publish(&mut self) {
        self.obs.last_update = Some(Utc::now());
        let snapshot = self.obs.clone();
        *self.published.write().await = snapshot.clone();
        self.dirty = false;
        let _ = self.broadcast_tx.send(HubBroadcast::State(snapshot));
    }
}

fn spawn_ticker(tx: mpsc::Sender<HubEvent>, every: Duration, make: fn() -> HubEvent) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    });
}

/// Fold one observed property into `state`.  Returns true when the change
/// must reach clients immediately rather than on the next flush tick.
pub fn apply_property(state: &mut PlayerState, obs_id: u64, data: &Value) -> bool {
    match obs_id {
        OBS_FILENAME => {
            let val = data.as_str().map(str::to_string);
            let changed = val != state.filename;
            state.filename = val;
            changed
        }
        OBS_PAUSE => {
            let val = data.as_bool().unwrap_or(false);
            let changed = val != state.paused;
            state.paused = val;
            changed
        }
        OBS_TIME_POS => {
            state.time_pos = data.as_f64().unwrap_or(0.0).max(0.0);
            false
        }
        OBS_DURATION => {
            let val = data.as_f64().unwrap_or(0.0).max(0.0);
            let changed = val != state.duration;
            state.duration = val;
            changed
        }
        OBS_VOLUME => {
            let val = data
                .as_f64()
                .map(|v| v.round().clamp(0.0, 100.0) as u8)
                .unwrap_or(state.volume);
            let changed = val != state.volume;
            state.volume = val;
            changed
        }
        OBS_SPEED => {
            let val = data.as_f64().filter(|v| *v > 0.0).unwrap_or(1.0);
            let changed = val != state.speed;
            state.speed = val;
            changed
        }
        OBS_IDLE => {
            let val = data.as_bool().unwrap_or(false);
            let changed = val != state.idle;
            state.idle = val;
            changed
        }
        OBS_EOF => {
            let val = data.as_bool().unwrap_or(false);
            let changed = val != state.eof;
            state.eof = val;
            changed
        }
        OBS_PLAYLIST_POS => {
            // -1 when nothing is selected
            let val = data.as_i64().unwrap_or(0).max(0) as u32;
            let changed = val != state.playlist_pos;
            state.playlist_pos = val;
            changed
        }
        OBS_PLAYLIST_COUNT => {
            let val = data.as_u64().unwrap_or(0) as u32;
            let changed = val != state.playlist_count;
            state.playlist_count = val;
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_updates_are_coalesced() {
        let mut state = PlayerState::default();
        assert!(!apply_property(&mut state, OBS_TIME_POS, &json!(12.5)));
        assert_eq!(state.time_pos, 12.5);
        assert!(!apply_property(&mut state, OBS_TIME_POS, &Value::Null));
        assert_eq!(state.time_pos, 0.0);
    }

    #[test]
    fn test_significant_properties() {
        let mut state = PlayerState::default();
        assert!(apply_property(&mut state, OBS_FILENAME, &json!("b.mkv")));
        assert!(!apply_property(&mut state, OBS_FILENAME, &json!("b.mkv")));
        assert!(apply_property(&mut state, OBS_EOF, &json!(true)));
        assert!(state.eof);
        assert!(apply_property(&mut state, OBS_VOLUME, &json!(72.6)));
        assert_eq!(state.volume, 73);
        assert!(apply_property(&mut state, OBS_FILENAME, &Value::Null));
        assert_eq!(state.filename, None);
    }

    #[test]
    fn test_property_sanitising() {
        let mut state = PlayerState::default();
        apply_property(&mut state, OBS_VOLUME, &json!(130.0));
        assert_eq!(state.volume, 100);
        apply_property(&mut state, OBS_SPEED, &json!(0.0));
        assert_eq!(state.speed, 1.0);
        apply_property(&mut state, OBS_PLAYLIST_POS, &json!(-1));
        assert_eq!(state.playlist_pos, 0);
        apply_property(&mut state, OBS_DURATION, &json!(-3.0));
        assert_eq!(state.duration, 0.0);
    }

    #[tokio::test]
    async fn test_command_without_mpv_is_rejected() {
        let (broadcast_tx, mut broadcast_rx) = broadcast::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let core = HubCore::new(Config::default(), broadcast_tx, event_tx.clone());
        tokio::spawn(core.run(event_rx));

        let (reply, rx) = oneshot::channel();
        event_tx
            .send(HubEvent::Command {
                origin: 1,
                command: ControlCommand::Stop,
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Err("mpv is not running".to_string()));
        assert!(broadcast_rx.try_recv().is_err());
    }
}
