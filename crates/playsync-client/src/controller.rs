use std::future::Future;

use playsync_proto::config::ClientConfig;
use playsync_proto::protocol::{ItemRef, PlayerState};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::queue::{QueueState, QueueStore};
use crate::sequencer::{EofGate, Sequencer};

/// Single-shot "load this item" request to the external player.
pub trait ItemLauncher: Send + Sync {
    fn launch(&self, item: &ItemRef) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Owns the local queue and drives it from player state and user controls.
///
/// Every index change follows the same order: the play request is issued
/// first, and only once it succeeds is `current_index` committed.
pub struct PlaybackController<L, R = StdRng> {
    queue: QueueStore,
    sequencer: Sequencer<R>,
    gate: EofGate,
    launcher: L,
    auto_advance: bool,
    reconcile_identity: bool,
}

impl<L: ItemLauncher> PlaybackController<L, StdRng> {
    pub fn new(queue: QueueStore, launcher: L, config: &ClientConfig) -> Self {
        Self::with_sequencer(queue, launcher, Sequencer::new(), config)
    }
}

impl<L: ItemLauncher, R: Rng> PlaybackController<L, R> {
    pub fn with_sequencer(
        queue: QueueStore,
        launcher: L,
        sequencer: Sequencer<R>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            queue,
            sequencer,
            gate: EofGate::new(),
            launcher,
            auto_advance: config.auto_advance,
            reconcile_identity: config.reconcile_identity,
        }
    }

    pub fn queue(&self) -> Option<&QueueState> {
        self.queue.state()
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// React to an authoritative push.  Returns the index that was started
    /// when an eof edge advanced the queue.
    pub async fn on_player_state(&mut self, state: &PlayerState) -> anyhow::Result<Option<usize>> {
        if !self.gate.observe(state) {
            return Ok(None);
        }
        if !self.auto_advance {
            debug!("controller: eof observed, auto-advance disabled");
            return Ok(None);
        }
        let Some(queue) = self.queue.state() else {
            debug!("controller: eof with no queue, ignoring");
            return Ok(None);
        };
        if self.reconcile_identity {
            let reported = state.filename.as_deref().unwrap_or_default();
            let expected = queue.current();
            if !expected.is_some_and(|item| item.matches_filename(reported)) {
                info!(
                    "controller: eof for {:?} but queue expects {:?}, not advancing",
                    reported,
                    expected.map(ItemRef::file_name)
                );
                return Ok(None);
            }
        }

        let Some(next) = self.sequencer.on_eof(queue) else {
            return Ok(None);
        };
        info!("controller: eof, advancing {} → {}", queue.current_index, next);
        if let Err(e) = self.play_index(next).await {
            self.gate.release();
            return Err(e);
        }
        Ok(Some(next))
    }

    pub async fn next(&mut self) -> anyhow::Result<Option<usize>> {
        let Some(next) = self.queue.state().and_then(|q| self.sequencer.next(q)) else {
            warn!("controller: next with an empty queue");
            return Ok(None);
        };
        self.play_index(next).await?;
        Ok(Some(next))
    }

    pub async fn prev(&mut self) -> anyhow::Result<Option<usize>> {
        let Some(prev) = self.queue.state().and_then(|q| self.sequencer.prev(q)) else {
            warn!("controller: prev with an empty queue");
            return Ok(None);
        };
        self.play_index(prev).await?;
        Ok(Some(prev))
    }

    /// Replace the queue with `items` and start playing at `index`.
    pub async fn play_from_here(&mut self, items: Vec<ItemRef>, index: usize) -> anyhow::Result<()> {
        if items.is_empty() {
            return self.close().await;
        }
        let index = index.min(items.len() - 1);
        self.launcher.launch(&items[index]).await?;
        self.gate.mark_play_issued();
        self.queue.replace(items, index).await
    }

    pub async fn toggle_loop(&mut self) -> anyhow::Result<bool> {
        self.queue.toggle_loop().await
    }

    pub async fn toggle_shuffle(&mut self) -> anyhow::Result<bool> {
        self.queue.toggle_shuffle().await
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.queue.close().await
    }

    async fn play_index(&mut self, index: usize) -> anyhow::Result<()> {
        let Some(item) = self.queue.state().and_then(|q| q.items.get(index)).cloned() else {
            anyhow::bail!("no queue item at index {}", index);
        };
        self.launcher.launch(&item).await?;
        self.gate.mark_play_issued();
        self.queue.set_index(index).await
    }
}
