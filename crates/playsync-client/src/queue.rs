use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use playsync_proto::config::QueueConfig;
use playsync_proto::protocol::ItemRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The locally owned play queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueState {
    pub items: Vec<ItemRef>,
    pub current_index: usize,
    #[serde(default)]
    pub loop_one: bool,
    #[serde(default)]
    pub shuffle: bool,
    pub saved_at: DateTime<Utc>,
}

impl QueueState {
    pub fn new(items: Vec<ItemRef>, start_index: usize) -> Self {
        let current_index = start_index.min(items.len().saturating_sub(1));
        Self {
            items,
            current_index,
            loop_one: false,
            shuffle: false,
            saved_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current(&self) -> Option<&ItemRef> {
        self.items.get(self.current_index)
    }
}

/// Holds the queue and writes it through to disk on every mutation.
pub struct QueueStore {
    state: Option<QueueState>,
    state_file: Option<PathBuf>,
    ttl: chrono::Duration,
}

impl QueueStore {
    /// Restore the queue from `state_file`.  Missing, corrupt, empty or
    /// expired queues all load as "no queue".
    pub fn load(state_file: Option<PathBuf>, ttl: chrono::Duration) -> Self {
        let state = state_file
            .as_ref()
            .and_then(|path| Self::load_persistent(path, ttl));
        Self {
            state,
            state_file,
            ttl,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::load(Some(config.state_file.clone()), config.ttl())
    }

    /// A queue that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: None,
            state_file: None,
            ttl: chrono::Duration::hours(24),
        }
    }

    fn load_persistent(path: &Path, ttl: chrono::Duration) -> Option<QueueState> {
        let content = std::fs::read_to_string(path).ok()?;
        let mut state: QueueState = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!("queue: ignoring unreadable {:?}: {}", path, e);
                return None;
            }
        };
        if Utc::now() - state.saved_at > ttl {
            info!("queue: saved queue from {} has expired", state.saved_at);
            return None;
        }
        if state.items.is_empty() {
            return None;
        }
        state.current_index = state.current_index.min(state.items.len() - 1);
        debug!(
            "queue: restored {} items at index {}",
            state.items.len(),
            state.current_index
        );
        Some(state)
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn state(&self) -> Option<&QueueState> {
        self.state.as_ref()
    }

    /// Start a new queue ("play from here").  An empty list closes the queue.
    pub async fn replace(&mut self, items: Vec<ItemRef>, start_index: usize) -> anyhow::Result<()> {
        if items.is_empty() {
            return self.close().await;
        }
        // Loop/shuffle preferences carry over to the new queue.
        let (loop_one, shuffle) = self
            .state
            .as_ref()
            .map(|s| (s.loop_one, s.shuffle))
            .unwrap_or((false, false));
        let mut state = QueueState::new(items, start_index);
        state.loop_one = loop_one;
        state.shuffle = shuffle;
        self.state = Some(state);
        self.save().await
    }

    pub async fn set_index(&mut self, index: usize) -> anyhow::Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if index >= state.items.len() {
            anyhow::bail!("index {} out of range for {} items", index, state.items.len());
        }
        state.current_index = index;
        self.save().await
    }

    pub async fn toggle_loop(&mut self) -> anyhow::Result<bool> {
        let Some(state) = self.state.as_mut() else {
            return Ok(false);
        };
        state.loop_one = !state.loop_one;
        let value = state.loop_one;
        self.save().await?;
        Ok(value)
    }

    pub async fn toggle_shuffle(&mut self) -> anyhow::Result<bool> {
        let Some(state) = self.state.as_mut() else {
            return Ok(false);
        };
        state.shuffle = !state.shuffle;
        let value = state.shuffle;
        self.save().await?;
        Ok(value)
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.state = None;
        if let Some(path) = &self.state_file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn save(&mut self) -> anyhow::Result<()> {
        let (Some(state), Some(path)) = (self.state.as_mut(), self.state_file.as_ref()) else {
            return Ok(());
        };
        state.saved_at = Utc::now();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&*state)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
