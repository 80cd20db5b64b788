use playsync_proto::protocol::{PlayerState, ServerMessage};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::connection::ClientEvent;

/// Decodes hub frames and republishes them.
///
/// Every message is forwarded to the ordered event channel.  State snapshots
/// additionally replace the latest-value mirror wholesale.
pub struct StateReceiver {
    mirror: watch::Sender<PlayerState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl StateReceiver {
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>) -> (Self, watch::Receiver<PlayerState>) {
        let (mirror, rx) = watch::channel(PlayerState::default());
        (Self { mirror, events }, rx)
    }

    pub fn handle_frame(&self, text: &str) {
        let msg = match ServerMessage::decode(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("receiver: discarding malformed frame: {} ({:.120})", e, text);
                return;
            }
        };

        let event = match msg {
            ServerMessage::State { data } => {
                self.mirror.send_replace(data.clone());
                ClientEvent::State(data)
            }
            ServerMessage::Error { message } => {
                warn!("receiver: hub reported: {}", message);
                ClientEvent::ServerError(message)
            }
            ServerMessage::CommandExecuted { action, params } => {
                debug!("receiver: {} executed by another client", action);
                ClientEvent::CommandExecuted { action, params }
            }
        };
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(filename: &str, time_pos: f64) -> PlayerState {
        PlayerState {
            playing: true,
            paused: false,
            filename: Some(filename.to_string()),
            time_pos,
            duration: 100.0,
            idle: false,
            ..PlayerState::default()
        }
    }

    fn frame(data: &PlayerState) -> String {
        ServerMessage::State { data: data.clone() }.encode().unwrap()
    }

    #[test]
    fn test_mirror_equals_last_push() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (receiver, mirror) = StateReceiver::new(tx);

        let pushes = [state("a.mkv", 1.0), state("a.mkv", 2.0), state("b.mkv", 0.0)];
        for push in &pushes {
            receiver.handle_frame(&frame(push));
        }
        assert_eq!(*mirror.borrow(), pushes[2]);

        // Delivered in order, none coalesced.
        for push in &pushes {
            match rx.try_recv().unwrap() {
                ClientEvent::State(s) => assert_eq!(&s, push),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_snapshot_replaces_rather_than_merges() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (receiver, mirror) = StateReceiver::new(tx);

        receiver.handle_frame(&frame(&state("a.mkv", 5.0)));
        receiver.handle_frame(r#"{"type":"state","data":{"volume":40}}"#);

        let current = mirror.borrow().clone();
        assert_eq!(current.volume, 40);
        assert_eq!(current.filename, None);
        assert_eq!(current.time_pos, 0.0);
    }

    #[test]
    fn test_malformed_and_error_frames_leave_state_alone() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (receiver, mirror) = StateReceiver::new(tx);
        let pushed = state("a.mkv", 5.0);
        receiver.handle_frame(&frame(&pushed));
        let _ = rx.try_recv();

        receiver.handle_frame("{not json");
        receiver.handle_frame(r#"{"type":"telemetry","value":1}"#);
        assert!(rx.try_recv().is_err());

        receiver.handle_frame(r#"{"type":"error","message":"Unknown action: warp"}"#);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::ServerError(m) if m == "Unknown action: warp"
        ));
        assert_eq!(*mirror.borrow(), pushed);
    }
}
