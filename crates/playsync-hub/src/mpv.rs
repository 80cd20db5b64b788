/// mpv JSON IPC driver with separated reader/writer tasks.
///
/// ```text
///   MpvDriver::spawn_and_connect() / try_attach()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── reply (has request_id) → matched oneshot::Sender
///                                └── event / property-change → event channel
/// ```
///
/// Unix uses a domain socket, Windows a named pipe `\\.\pipe\<name>`.
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use playsync_proto::config::MpvConfig;
use playsync_proto::protocol::{ControlCommand, PlayMode};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

// ── observed properties ───────────────────────────────────────────────────────

pub const OBS_FILENAME: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_TIME_POS: u64 = 3;
pub const OBS_DURATION: u64 = 4;
pub const OBS_VOLUME: u64 = 5;
pub const OBS_SPEED: u64 = 6;
pub const OBS_IDLE: u64 = 7;
pub const OBS_EOF: u64 = 8;
pub const OBS_PLAYLIST_POS: u64 = 9;
pub const OBS_PLAYLIST_COUNT: u64 = 10;

const OBSERVED: [(u64, &str); 10] = [
    (OBS_FILENAME, "filename"),
    (OBS_PAUSE, "pause"),
    (OBS_TIME_POS, "time-pos"),
    (OBS_DURATION, "duration"),
    (OBS_VOLUME, "volume"),
    (OBS_SPEED, "speed"),
    (OBS_IDLE, "idle-active"),
    (OBS_EOF, "eof-reached"),
    (OBS_PLAYLIST_POS, "playlist-pos"),
    (OBS_PLAYLIST_COUNT, "playlist-count"),
];

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited line from mpv (event or property-change).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// `Some((obs_id, data))` for property-change events.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn end_file_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

/// `play` replaces the playlist with the first target and appends the rest;
/// `queue` appends everything with `append-play`.
pub fn loadfile_commands(targets: &[String], mode: PlayMode) -> Vec<Value> {
    targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            let flag = match (mode, i) {
                (PlayMode::Play, 0) => "replace",
                (PlayMode::Play, _) => "append",
                (PlayMode::Queue, _) => "append-play",
            };
            json!(["loadfile", target, flag])
        })
        .collect()
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Load `targets` (absolute paths or URLs) according to `mode`.
    pub async fn load(&self, targets: &[String], mode: PlayMode) -> anyhow::Result<()> {
        for command in loadfile_commands(targets, mode) {
            self.send(command).await?;
        }
        if mode == PlayMode::Play {
            self.send(json!(["set_property", "pause", false])).await?;
        }
        Ok(())
    }

    /// Translate a transport command into mpv IPC.
    pub async fn execute(&self, command: &ControlCommand) -> anyhow::Result<()> {
        let ipc = match command {
            ControlCommand::PlayPause => json!(["cycle", "pause"]),
            ControlCommand::Seek { seconds } => json!(["seek", seconds, "relative"]),
            ControlCommand::SeekAbsolute { position } => json!(["seek", position, "absolute"]),
            ControlCommand::Next => json!(["playlist-next"]),
            ControlCommand::Prev => json!(["playlist-prev"]),
            ControlCommand::Volume { level } => json!(["set_property", "volume", level]),
            ControlCommand::Speed { speed } => json!(["set_property", "speed", speed]),
            ControlCommand::Stop => json!(["stop"]),
        };
        self.send(ipc).await?;
        Ok(())
    }

    /// Register observe_property for everything `PlayerState` mirrors.
    /// Must run after every fresh connection; mpv answers each with an
    /// immediate property-change carrying the current value.
    pub async fn observe_all_properties(&self) {
        for (id, name) in OBSERVED {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "idle-active"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process (when we spawned it) and the IPC endpoint name.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    extra_args: Vec<String>,
    process: Option<tokio::process::Child>,
    pub last_volume: u8,
}

impl MpvDriver {
    pub fn new(config: &MpvConfig) -> Self {
        Self {
            socket_name: playsync_proto::platform::mpv_socket_name(),
            binary: config.binary.clone(),
            extra_args: config.extra_args.clone(),
            process: None,
            last_volume: config.default_volume,
        }
    }

    /// True if we spawned mpv ourselves (as opposed to attaching to one).
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process {
            Some(ref mut child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn command(&self) -> anyhow::Result<tokio::process::Command> {
        let binary = playsync_proto::platform::find_mpv_binary(self.binary.as_ref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("--idle=yes")
            .arg("--no-terminal")
            .arg(playsync_proto::platform::mpv_socket_arg())
            .arg(format!("--volume={}", self.last_volume.min(100)))
            .args(&self.extra_args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning new process");
        self.process = Some(self.command()?.spawn()?);

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        Ok(start_io_tasks(stream, event_tx))
    }

    /// Attach to an mpv that is already serving our socket (e.g. started by
    /// hand, or left over from a previous hub run).
    #[cfg(unix)]
    pub async fn try_attach(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let socket_path = PathBuf::from(&self.socket_name);
        if !socket_path.exists() {
            return None;
        }
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!("mpv: attached to existing IPC socket");
                Some(start_io_tasks(stream, event_tx))
            }
            Err(e) => {
                debug!("mpv: stale socket {:?}: {}", socket_path, e);
                None
            }
        }
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        info!("mpv: spawning new process");
        self.process = Some(self.command()?.spawn()?);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks_split(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }

    #[cfg(windows)]
    pub async fn try_attach(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        match ClientOptions::new().open(&pipe_path) {
            Ok(client) => {
                info!("mpv: attached to existing named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                Some(start_io_tasks_split(read_half, write_half, event_tx))
            }
            Err(e) => {
                debug!("mpv: no existing named pipe: {}", e);
                None
            }
        }
    }
}

#[cfg(unix)]
fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle {
    let (read_half, write_half) = stream.into_split();
    start_io_tasks_split(read_half, write_half, event_tx)
}

fn start_io_tasks_split<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

/// One decoded line from the IPC stream.
#[derive(Debug)]
enum Inbound {
    Reply { req_id: u64, result: anyhow::Result<Value> },
    Event(MpvEvent),
}

fn classify_line(line: &str) -> Option<Inbound> {
    let val: Value = serde_json::from_str(line)
        .map_err(|e| debug!("mpv reader: skipping undecodable line '{}': {}", line, e))
        .ok()?;
    let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
        return Some(Inbound::Event(MpvEvent { raw: val }));
    };
    let result = match val.get("error").and_then(Value::as_str) {
        Some("success") => Ok(val),
        Some(other) => Err(anyhow::anyhow!("mpv error: {}", other)),
        None => Err(anyhow::anyhow!("mpv reply without status")),
    };
    Some(Inbound::Reply { req_id, result })
}

async fn reader_task<R>(reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "mpv IPC connection closed",
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                break "mpv IPC read error";
            }
        };
        match classify_line(line.trim()) {
            Some(Inbound::Reply { req_id, result }) => {
                match pending.lock().await.remove(&req_id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("mpv reader: reply for unknown req={}", req_id),
                }
            }
            Some(Inbound::Event(evt)) => {
                if event_tx.send(evt).await.is_err() {
                    debug!("mpv reader: event receiver gone");
                    return;
                }
            }
            None => {}
        }
    };
    debug!("mpv reader: {}", reason);
    fail_pending(&pending, reason).await;
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
