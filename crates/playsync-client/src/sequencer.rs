//! Next-item selection over the local queue.
//!
//! Pure decisions only: the controller performs the play request and then
//! commits the chosen index.

use playsync_proto::protocol::PlayerState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::queue::QueueState;

pub struct Sequencer<R = StdRng> {
    rng: R,
}

impl Sequencer<StdRng> {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for Sequencer<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> Sequencer<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Index to play after the current item finished.  `None` for an empty queue.
    pub fn on_eof(&mut self, queue: &QueueState) -> Option<usize> {
        if queue.is_empty() {
            return None;
        }
        if queue.loop_one {
            return Some(current(queue));
        }
        self.next(queue)
    }

    /// Explicit "next": ignores `loop_one`, wraps past the end.
    pub fn next(&mut self, queue: &QueueState) -> Option<usize> {
        let len = queue.len();
        if len == 0 {
            return None;
        }
        let cur = current(queue);
        if queue.shuffle {
            return Some(self.pick_other(len, cur));
        }
        Some((cur + 1) % len)
    }

    /// Explicit "prev": ignores `loop_one`, wraps to the last item from 0.
    pub fn prev(&mut self, queue: &QueueState) -> Option<usize> {
        let len = queue.len();
        if len == 0 {
            return None;
        }
        let cur = current(queue);
        if queue.shuffle {
            return Some(self.pick_other(len, cur));
        }
        Some(if cur == 0 { len - 1 } else { cur - 1 })
    }

    /// Uniform over `0..len` minus `exclude`, in one draw.
    fn pick_other(&mut self, len: usize, exclude: usize) -> usize {
        if len <= 1 {
            return exclude.min(len.saturating_sub(1));
        }
        let r = self.rng.gen_range(0..len - 1);
        if r >= exclude {
            r + 1
        } else {
            r
        }
    }
}

fn current(queue: &QueueState) -> usize {
    queue.current_index.min(queue.len().saturating_sub(1))
}

/// Turns the player's `eof` flag into one edge per finished playback.
///
/// The first `eof = true` for a file latches it; further eof reports for the
/// same file are swallowed until a play has been issued and the player has
/// moved past eof, or until a different file shows up.
#[derive(Debug, Default)]
pub struct EofGate {
    latched: Option<String>,
    play_issued: bool,
}

impl EofGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly when `state` carries a fresh eof edge.
    pub fn observe(&mut self, state: &PlayerState) -> bool {
        // Nothing loaded means nothing just ended.
        let Some(filename) = state.filename.as_deref() else {
            return false;
        };

        if !state.eof {
            let moved_on = self
                .latched
                .as_deref()
                .is_some_and(|latched| self.play_issued || latched != filename);
            if moved_on {
                self.latched = None;
                self.play_issued = false;
            }
            return false;
        }

        if self.latched.as_deref() == Some(filename) {
            return false;
        }
        self.latched = Some(filename.to_string());
        self.play_issued = false;
        true
    }

    /// Record that a new play was requested after the latched eof.
    pub fn mark_play_issued(&mut self) {
        self.play_issued = true;
    }

    /// Forget the latched eof so the next report for it is an edge again.
    /// Used when the advance it triggered could not be carried out.
    pub fn release(&mut self) {
        self.latched = None;
        self.play_issued = false;
    }

    pub fn is_latched(&self) -> bool {
        self.latched.is_some()
    }
}
