//! Short-lived local predictions layered over the authoritative player state.
//!
//! When the user toggles pause we send the command and keep showing the
//! intended value until a state push confirms it.  A push that disagrees does
//! not cancel the prediction; only the deadline does, after which whatever
//! the hub reports wins.
//!
//! ```text
//!  Confirmed(T)     no local intent; show the pushed value
//!  Pending { .. }   command sent; show `intended` until confirmed or expired
//! ```

use std::time::Duration;

use playsync_proto::protocol::PlayerState;
use tokio::time::Instant;

pub const PREDICTION_TTL: Duration = Duration::from_millis(3000);

/// How close a reported position must be to a predicted seek target.
const SEEK_TOLERANCE: f64 = 1.5;

#[derive(Debug, Clone)]
pub enum Predicted<T: Clone + PartialEq> {
    Confirmed(T),
    Pending {
        intended: T,
        confirmed: T,
        since: Instant,
    },
}

impl<T: Clone + PartialEq> Predicted<T> {
    pub fn new(value: T) -> Self {
        Self::Confirmed(value)
    }

    pub fn confirmed(&self) -> &T {
        match self {
            Self::Confirmed(v) => v,
            Self::Pending { confirmed, .. } => confirmed,
        }
    }

    fn expired(&self) -> bool {
        matches!(self, Self::Pending { since, .. } if since.elapsed() >= PREDICTION_TTL)
    }

    /// True while a prediction is outstanding and inside its deadline.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. }) && !self.expired()
    }

    /// The value to display.
    pub fn value(&self) -> &T {
        match self {
            Self::Pending { intended, .. } if !self.expired() => intended,
            _ => self.confirmed(),
        }
    }

    pub fn intend(&mut self, intended: T) {
        let confirmed = self.confirmed().clone();
        *self = if intended == confirmed {
            Self::Confirmed(intended)
        } else {
            Self::Pending {
                intended,
                confirmed,
                since: Instant::now(),
            }
        };
    }

    pub fn confirm(&mut self, value: T) {
        self.confirm_by(value, |a, b| a == b);
    }

    /// Fold in an authoritative value; `matches` decides whether it satisfies
    /// the outstanding intent.
    pub fn confirm_by(&mut self, value: T, matches: impl Fn(&T, &T) -> bool) {
        let expired = self.expired();
        match self {
            Self::Pending { intended, confirmed, .. } => {
                if expired || matches(&value, intended) {
                    *self = Self::Confirmed(value);
                } else {
                    *confirmed = value;
                }
            }
            Self::Confirmed(v) => *v = value,
        }
    }
}

/// Display-side view of the player: the last push plus any outstanding
/// predictions.  Never feeds back into the authoritative state.
#[derive(Debug, Clone)]
pub struct PlaybackView {
    state: PlayerState,
    paused: Predicted<bool>,
    volume: Predicted<u8>,
    speed: Predicted<f64>,
    position: Predicted<f64>,
}

impl Default for PlaybackView {
    fn default() -> Self {
        Self::new(PlayerState::default())
    }
}

impl PlaybackView {
    pub fn new(state: PlayerState) -> Self {
        Self {
            paused: Predicted::new(state.paused),
            volume: Predicted::new(state.volume),
            speed: Predicted::new(state.speed),
            position: Predicted::new(state.time_pos),
            state,
        }
    }

    pub fn apply(&mut self, state: &PlayerState) {
        self.paused.confirm(state.paused);
        self.volume.confirm(state.volume);
        self.speed.confirm(state.speed);
        self.position
            .confirm_by(state.time_pos, |got, want| (got - want).abs() <= SEEK_TOLERANCE);
        self.state = state.clone();
    }

    pub fn predict_pause_toggle(&mut self) {
        let next = !*self.paused.value();
        self.paused.intend(next);
    }

    pub fn predict_volume(&mut self, level: u8) {
        self.volume.intend(level.min(100));
    }

    pub fn predict_speed(&mut self, speed: f64) {
        self.speed.intend(speed);
    }

    pub fn predict_seek(&mut self, position: f64) {
        self.position.intend(position.max(0.0));
    }

    pub fn predict_relative_seek(&mut self, seconds: f64) {
        let target = *self.position.value() + seconds;
        self.predict_seek(target);
    }

    pub fn has_pending(&self) -> bool {
        self.paused.is_pending()
            || self.volume.is_pending()
            || self.speed.is_pending()
            || self.position.is_pending()
    }

    /// The authoritative state with predictions overlaid.
    pub fn display(&self) -> PlayerState {
        let mut shown = self.state.clone();
        shown.paused = *self.paused.value();
        shown.playing = !shown.paused && shown.filename.is_some() && !shown.idle;
        shown.volume = *self.volume.value();
        shown.speed = *self.speed.value();
        shown.time_pos = *self.position.value();
        shown
    }

    pub fn authoritative(&self) -> &PlayerState {
        &self.state
    }
}
