use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors produced while turning wire frames into typed messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },
}

/// Snapshot of what the external player is doing.  Always replaced wholesale,
/// never patched field-by-field on the client side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    #[serde(default)]
    pub playing: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub time_pos: f64,
    /// 0.0 while the duration is unknown.
    #[serde(default)]
    pub duration: f64,
    /// `None` while the player is idle.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub playlist_pos: u32,
    #[serde(default)]
    pub playlist_count: u32,
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Set while the player sits at end-of-stream for the loaded item.
    #[serde(default)]
    pub eof: bool,
    #[serde(default)]
    pub idle: bool,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

fn default_volume() -> u8 {
    100
}

fn default_speed() -> f64 {
    1.0
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            playing: false,
            paused: true,
            time_pos: 0.0,
            duration: 0.0,
            filename: None,
            playlist_pos: 0,
            playlist_count: 0,
            volume: default_volume(),
            speed: default_speed(),
            eof: false,
            idle: true,
            last_update: None,
        }
    }
}

impl PlayerState {
    pub fn is_idle(&self) -> bool {
        self.filename.is_none()
    }

    /// Playback progress in `0.0..=1.0`, or `None` while the duration is unknown.
    pub fn progress(&self) -> Option<f64> {
        if self.duration > 0.0 {
            Some((self.time_pos / self.duration).clamp(0.0, 1.0))
        } else {
            None
        }
    }
}

/// A playable item in the media library, addressed by its path relative to
/// the hub's media root (always `/`-separated on the wire).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ItemRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            title: None,
        }
    }

    /// Last path component; this is what mpv reports as `filename`.
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.path.as_str())
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or_else(|| self.file_name())
    }

    /// True when the player's reported `filename` refers to this item.
    pub fn matches_filename(&self, filename: &str) -> bool {
        let reported = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
        reported == self.file_name()
    }
}

/// Page of items returned by the hub's media listing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaPage {
    pub items: Vec<ItemRef>,
    pub total: usize,
}

/// How a play request treats what the player already has loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    /// Replace the player's playlist.
    #[default]
    Play,
    /// Append to the player's playlist; starts playback if it is idle.
    Queue,
}

/// Body of `POST /play`.
///
/// Accepts `{"items": [ItemRef, ...], "mode": ...}` as well as a bare
/// `ItemRef` with an optional `mode`, which is what single-item callers send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "PlayBody")]
pub struct PlayRequest {
    pub items: Vec<ItemRef>,
    pub mode: PlayMode,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlayBody {
    Batch {
        items: Vec<ItemRef>,
        #[serde(default)]
        mode: PlayMode,
    },
    Single {
        path: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        mode: PlayMode,
    },
}

impl From<PlayBody> for PlayRequest {
    fn from(body: PlayBody) -> Self {
        match body {
            PlayBody::Batch { items, mode } => Self { items, mode },
            PlayBody::Single { path, title, mode } => Self {
                items: vec![ItemRef { path, title }],
                mode,
            },
        }
    }
}

impl PlayRequest {
    pub fn new(items: Vec<ItemRef>, mode: PlayMode) -> Self {
        Self { items, mode }
    }

    pub fn single(item: ItemRef) -> Self {
        Self::new(vec![item], PlayMode::Play)
    }
}

/// Body of `POST /cast/url`: a stream or remote URL handed straight to mpv.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CastRequest {
    pub url: String,
    #[serde(default)]
    pub mode: PlayMode,
}

/// Transport commands understood by the control hub.  These act on whatever
/// the player already has loaded; loading a specific item goes through the
/// separate play-item request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    PlayPause,
    /// Relative seek in seconds (negative rewinds).
    Seek { seconds: f64 },
    SeekAbsolute { position: f64 },
    Next,
    Prev,
    Volume { level: u8 },
    Speed { speed: f64 },
    Stop,
}

impl ControlCommand {
    pub fn action(&self) -> &'static str {
        match self {
            ControlCommand::PlayPause => "play_pause",
            ControlCommand::Seek { .. } => "seek",
            ControlCommand::SeekAbsolute { .. } => "seek_absolute",
            ControlCommand::Next => "next",
            ControlCommand::Prev => "prev",
            ControlCommand::Volume { .. } => "volume",
            ControlCommand::Speed { .. } => "speed",
            ControlCommand::Stop => "stop",
        }
    }

    pub fn params(&self) -> Map<String, Value> {
        let value = match self {
            ControlCommand::Seek { seconds } => json!({ "seconds": seconds }),
            ControlCommand::SeekAbsolute { position } => json!({ "position": position }),
            ControlCommand::Volume { level } => json!({ "level": level }),
            ControlCommand::Speed { speed } => json!({ "speed": speed }),
            _ => json!({}),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub fn to_message(&self) -> ClientMessage {
        ClientMessage {
            action: self.action().to_string(),
            params: self.params(),
        }
    }
}

/// Raw client → hub frame: `{ "action": ..., "params": { ... } }`.
///
/// Kept untyped on the wire so that an unknown action can be answered with an
/// error instead of failing the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMessage {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl TryFrom<&ClientMessage> for ControlCommand {
    type Error = ProtocolError;

    fn try_from(msg: &ClientMessage) -> Result<Self, Self::Error> {
        let number = |name: &'static str, default: f64| -> Result<f64, ProtocolError> {
            match msg.params.get(name) {
                None | Some(Value::Null) => Ok(default),
                Some(v) => v.as_f64().ok_or_else(|| ProtocolError::InvalidParam {
                    name,
                    reason: format!("expected a number, got {}", v),
                }),
            }
        };

        let cmd = match msg.action.as_str() {
            "play_pause" => ControlCommand::PlayPause,
            "seek" => ControlCommand::Seek {
                seconds: number("seconds", 0.0)?,
            },
            "seek_absolute" => {
                let position = number("position", 0.0)?;
                if position < 0.0 {
                    return Err(ProtocolError::InvalidParam {
                        name: "position",
                        reason: "must not be negative".to_string(),
                    });
                }
                ControlCommand::SeekAbsolute { position }
            }
            "next" => ControlCommand::Next,
            "prev" => ControlCommand::Prev,
            "volume" => {
                let level = number("level", 100.0)?;
                ControlCommand::Volume {
                    level: level.round().clamp(0.0, 100.0) as u8,
                }
            }
            "speed" => {
                let speed = number("speed", 1.0)?;
                if !(speed > 0.0) || !speed.is_finite() {
                    return Err(ProtocolError::InvalidParam {
                        name: "speed",
                        reason: format!("must be positive, got {}", speed),
                    });
                }
                ControlCommand::Speed { speed }
            }
            "stop" => ControlCommand::Stop,
            other => return Err(ProtocolError::UnknownAction(other.to_string())),
        };
        Ok(cmd)
    }
}

/// Hub → client frames, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full authoritative snapshot.
    State { data: PlayerState },
    Error { message: String },
    /// Another client's command was executed by the hub.
    CommandExecuted {
        action: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
