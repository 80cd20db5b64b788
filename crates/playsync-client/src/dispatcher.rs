use std::sync::{Arc, Mutex};

use playsync_proto::protocol::{ClientMessage, ControlCommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cloneable handle that turns user intents into control-channel frames.
///
/// While no channel is open every command is dropped with a warning.  Nothing
/// is queued for delivery after a reconnect.
#[derive(Clone, Default)]
pub struct CommandDispatcher {
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<ClientMessage>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(tx);
        }
    }

    pub(crate) fn detach(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    pub fn send(&self, command: ControlCommand) {
        let message = command.to_message();
        let sent = match self.outbound.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|tx| tx.send(message).is_ok()),
            Err(_) => false,
        };
        if sent {
            debug!("dispatcher: sent {:?}", command);
        } else {
            warn!("dispatcher: not connected, dropping {}", command.action());
        }
    }

    pub fn play_pause(&self) {
        self.send(ControlCommand::PlayPause);
    }

    pub fn seek(&self, seconds: f64) {
        self.send(ControlCommand::Seek { seconds });
    }

    pub fn seek_absolute(&self, position: f64) {
        self.send(ControlCommand::SeekAbsolute { position });
    }

    pub fn next(&self) {
        self.send(ControlCommand::Next);
    }

    pub fn prev(&self) {
        self.send(ControlCommand::Prev);
    }

    pub fn volume(&self, level: u8) {
        self.send(ControlCommand::Volume {
            level: level.min(100),
        });
    }

    pub fn speed(&self, speed: f64) {
        self.send(ControlCommand::Speed { speed });
    }

    pub fn stop(&self) {
        self.send(ControlCommand::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_commands_are_dropped_not_queued() {
        let dispatcher = CommandDispatcher::new();
        assert!(!dispatcher.is_connected());
        dispatcher.seek(10.0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.attach(tx);
        assert!(dispatcher.is_connected());
        assert!(rx.try_recv().is_err());

        dispatcher.volume(140);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.action, "volume");
        assert_eq!(msg.params["level"], 100);
    }

    #[test]
    fn test_clones_share_the_channel() {
        let dispatcher = CommandDispatcher::new();
        let clone = dispatcher.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.attach(tx);

        clone.seek_absolute(42.0);
        assert_eq!(rx.try_recv().unwrap().action, "seek_absolute");

        dispatcher.detach();
        clone.stop();
        assert!(rx.try_recv().is_err());
    }
}
