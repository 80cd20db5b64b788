use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use playsync_client::connection::{Backoff, ClientEvent, ConnectionManager};
use playsync_client::transport::{memory_channel, Channel, ChannelError, Connector, HealthProbe, MemoryPeer};
use playsync_proto::protocol::{PlayerState, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Clone)]
struct ScriptedProbe {
    healthy: Arc<Mutex<VecDeque<bool>>>,
    calls: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedProbe {
    /// Answers from `script`, then healthy forever.
    fn new(script: &[bool]) -> Self {
        Self {
            healthy: Arc::new(Mutex::new(script.iter().copied().collect())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn always_down() -> Self {
        Self::new(&[false; 64])
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

impl HealthProbe for ScriptedProbe {
    fn check(&self) -> impl Future<Output = bool> + Send {
        self.calls.lock().unwrap().push(Instant::now());
        let healthy = self.healthy.lock().unwrap().pop_front().unwrap_or(true);
        async move { healthy }
    }
}

#[derive(Clone, Default)]
struct QueuedConnector {
    channels: Arc<Mutex<VecDeque<Channel>>>,
    attempts: Arc<AtomicUsize>,
}

impl QueuedConnector {
    fn push(&self) -> MemoryPeer {
        let (channel, peer) = memory_channel(16);
        self.push_channel(channel);
        peer
    }

    fn push_channel(&self, channel: Channel) {
        self.channels.lock().unwrap().push_back(channel);
    }
}

/// A sink whose peer never reads: every send and close stays pending.
struct StalledSink;

impl Sink<String> for StalledSink {
    type Error = ChannelError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), ChannelError>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: String) -> Result<(), ChannelError> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), ChannelError>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), ChannelError>> {
        Poll::Pending
    }
}

fn stalled_channel() -> Channel {
    Channel {
        sink: Box::pin(StalledSink),
        stream: Box::pin(futures_util::stream::pending::<Result<String, ChannelError>>()),
    }
}

impl Connector for QueuedConnector {
    fn connect(&self) -> impl Future<Output = Result<Channel, ChannelError>> + Send {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.channels.lock().unwrap().pop_front();
        async move { next.ok_or_else(|| ChannelError::Connect("connection refused".to_string())) }
    }
}

fn backoff() -> Backoff {
    Backoff::new(Duration::from_millis(500), Duration::from_millis(15_000))
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("no event")
        .expect("event channel closed")
}

fn state_frame(filename: &str) -> String {
    let data = PlayerState {
        playing: true,
        paused: false,
        filename: Some(filename.to_string()),
        idle: false,
        duration: 90.0,
        ..PlayerState::default()
    };
    ServerMessage::State { data }.encode().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_hub_backs_off_without_connecting() {
    let probe = ScriptedProbe::always_down();
    let connector = QueuedConnector::default();
    let manager = ConnectionManager::new(
        connector.clone(),
        probe.clone(),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();

    let mut delays = Vec::new();
    while delays.len() < 3 {
        if let ClientEvent::RetryScheduled { delay, .. } = next_event(&mut events).await {
            delays.push(delay.as_millis() as u64);
        }
    }
    assert_eq!(delays, vec![500, 1000, 2000]);

    // Let the fourth probe happen.
    tokio::time::sleep(Duration::from_millis(2001)).await;
    let calls = probe.call_times();
    assert!(calls.len() >= 4);
    let gaps: Vec<u64> = calls
        .windows(2)
        .take(3)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![500, 1000, 2000]);

    assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    let session = handle.session();
    assert!(!session.connected);
    assert_eq!(session.last_error.as_deref(), Some("hub unreachable"));
    assert!(session.reconnect_attempt >= 3);

    handle.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_probe_counts_as_failure() {
    struct HangingProbe;
    impl HealthProbe for HangingProbe {
        fn check(&self) -> impl Future<Output = bool> + Send {
            std::future::pending()
        }
    }

    let connector = QueuedConnector::default();
    let manager = ConnectionManager::new(
        connector.clone(),
        HangingProbe,
        backoff(),
        Duration::from_secs(2),
    );
    let start = Instant::now();
    let (handle, mut events) = manager.spawn();

    match next_event(&mut events).await {
        ClientEvent::RetryScheduled { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(500));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    handle.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_round_trip_and_reconnect() {
    let probe = ScriptedProbe::new(&[]);
    let connector = QueuedConnector::default();
    let mut first = connector.push();
    let manager = ConnectionManager::new(
        connector.clone(),
        probe.clone(),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();
    let dispatcher = handle.dispatcher();

    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    assert!(handle.session().connected);

    dispatcher.seek(10.0);
    let frame = first.outbound.recv().await.unwrap();
    assert_eq!(frame, r#"{"action":"seek","params":{"seconds":10.0}}"#);

    first.inbound.send(Ok(state_frame("a.mkv"))).await.unwrap();
    first.inbound.send(Ok("garbage".to_string())).await.unwrap();
    first.inbound.send(Ok(state_frame("b.mkv"))).await.unwrap();
    for expected in ["a.mkv", "b.mkv"] {
        match next_event(&mut events).await {
            ClientEvent::State(s) => assert_eq!(s.filename.as_deref(), Some(expected)),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(handle.player_state().filename.as_deref(), Some("b.mkv"));

    // Hub goes away: the session closes and a retry is scheduled.
    let mut second = connector.push();
    drop(first);
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Disconnected { reason: Some(_) }
    ));
    assert!(!handle.session().connected);
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::RetryScheduled {
            attempt: 1,
            delay: Duration::from_millis(500)
        }
    );

    // Commands issued while down are not replayed after reconnect.
    dispatcher.stop();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    dispatcher.play_pause();
    let frame = second.outbound.recv().await.unwrap();
    assert_eq!(frame, r#"{"action":"play_pause","params":{}}"#);
    assert!(second.outbound.try_recv().is_err());
    assert_eq!(handle.session().reconnect_attempt, 0);

    // A second drop starts the backoff over from the base delay.
    drop(second.inbound);
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Disconnected { .. }
    ));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::RetryScheduled {
            attempt: 1,
            delay: Duration::from_millis(500)
        }
    );

    handle.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_channel_and_stops_retrying() {
    let probe = ScriptedProbe::new(&[]);
    let connector = QueuedConnector::default();
    let mut peer = connector.push();
    let manager = ConnectionManager::new(
        connector.clone(),
        probe.clone(),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    let dispatcher = handle.dispatcher();
    handle.disconnect().await;

    assert_eq!(peer.outbound.recv().await, None);
    assert!(!dispatcher.is_connected());
    dispatcher.seek(10.0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(probe.call_times().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_cancels_pending_retry() {
    let probe = ScriptedProbe::always_down();
    let connector = QueuedConnector::default();
    let manager = ConnectionManager::new(
        connector.clone(),
        probe.clone(),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::RetryScheduled { .. }
    ));

    drop(handle);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.call_times().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_is_recorded_without_closing() {
    let probe = ScriptedProbe::new(&[]);
    let connector = QueuedConnector::default();
    let peer = connector.push();
    let manager = ConnectionManager::new(
        connector.clone(),
        probe.clone(),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    peer.inbound
        .send(Err(ChannelError::Transport("frame too large".to_string())))
        .await
        .unwrap();
    peer.inbound.send(Ok(state_frame("still-here.mkv"))).await.unwrap();

    match next_event(&mut events).await {
        ClientEvent::State(s) => assert_eq!(s.filename.as_deref(), Some("still-here.mkv")),
        other => panic!("unexpected {:?}", other),
    }
    let session = handle.session();
    assert!(session.connected);
    assert_eq!(
        session.last_error.as_deref(),
        Some("transport error: frame too large")
    );
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert!(handle.dispatcher().is_connected());

    handle.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_hang_on_stalled_close() {
    let connector = QueuedConnector::default();
    connector.push_channel(stalled_channel());
    let manager = ConnectionManager::new(
        connector.clone(),
        ScriptedProbe::new(&[]),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    tokio::time::timeout(Duration::from_secs(5), handle.disconnect())
        .await
        .expect("disconnect hung on the close handshake");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_hang_on_stalled_send() {
    let connector = QueuedConnector::default();
    connector.push_channel(stalled_channel());
    let manager = ConnectionManager::new(
        connector.clone(),
        ScriptedProbe::new(&[]),
        backoff(),
        Duration::from_secs(2),
    );
    let (handle, mut events) = manager.spawn();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

    handle.dispatcher().seek(10.0);
    // Let the session pick the command up and block on the sink.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), handle.disconnect())
        .await
        .expect("disconnect hung behind a pending send");
    assert!(started.elapsed() < Duration::from_secs(1));
}
