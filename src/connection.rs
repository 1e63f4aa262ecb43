//! Connection state machine and auto-reconnect
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──Connected──> Connected
//!      ▲                          │                        │
//!      │                     Error/Disconnected ◄──────────┘
//!      │                          │
//!      └──exhausted/disabled──────┤
//!                                 └──backoff──> Connecting
//! ```
//!
//! One task per logical session drives the transport, applies the
//! reconnect policy and forwards capture responses. A generation counter
//! keeps a cancelled task from touching state after `connect()` or
//! `disconnect()` has moved on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::control::{ControlClient, ControlEvent, Transport};
use crate::protocol::{parse_capture_response, CaptureResponse, RobotCommand};
use crate::settings::RobotSettings;

/// Delay before the first automatic retry
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound on any retry delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

/// Captures held for the receiver; newer ones are dropped once it is full
pub const CAPTURE_QUEUE: usize = 8;

/// State of the control channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Failure or backoff countdown, with a human-readable message
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short status label for display
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Error(_) => "Error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(message) => write!(f, "Error: {}", message),
            other => f.write_str(other.label()),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(enabled: bool, max_attempts: u32) -> Self {
        Self {
            enabled,
            max_attempts,
            base_delay: BASE_RECONNECT_DELAY,
            cap_delay: MAX_RECONNECT_DELAY,
            attempts: 0,
        }
    }

    pub fn from_settings(settings: &RobotSettings) -> Self {
        Self::new(settings.reconnect_enabled, settings.max_reconnect_attempts)
    }

    /// Retries scheduled since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Use up every remaining attempt
    pub fn exhaust(&mut self) {
        self.attempts = self.max_attempts;
    }

    /// `min(base * 2^(attempt-1), cap)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.cap_delay)
    }

    /// Count a retry and return its delay, or `None` when retrying is over
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.enabled || self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for_attempt(self.attempts))
    }

    fn apply_settings(&mut self, settings: &RobotSettings) {
        self.enabled = settings.reconnect_enabled;
        self.max_attempts = settings.max_reconnect_attempts;
    }
}

struct Inner<T> {
    transport: T,
    state: watch::Sender<ConnectionState>,
    policy: Mutex<ReconnectPolicy>,
    generation: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    captures: mpsc::Sender<CaptureResponse>,
}

impl<T> Inner<T> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            applied = true;
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        applied
    }

    fn lock_policy(&self) -> MutexGuard<'_, ReconnectPolicy> {
        self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the policy unless `generation` has been superseded
    fn with_policy<R>(&self, generation: u64, f: impl FnOnce(&mut ReconnectPolicy) -> R) -> Option<R> {
        let mut policy = self.lock_policy();
        self.is_current(generation).then(|| f(&mut policy))
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Invalidate and cancel the running session task
    fn cancel(&self, task: &mut Option<JoinHandle<()>>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(handle) = task.take() {
            handle.abort();
        }
        generation
    }
}

/// Control channel session with automatic reconnection
pub struct ConnectionManager<T: Transport = ControlClient> {
    inner: Arc<Inner<T>>,
    capture_rx: Mutex<Option<mpsc::Receiver<CaptureResponse>>>,
}

impl ConnectionManager<ControlClient> {
    pub fn new(settings: &RobotSettings) -> Self {
        Self::with_transport(ControlClient::new(), settings)
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn with_transport(transport: T, settings: &RobotSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (captures, capture_rx) = mpsc::channel(CAPTURE_QUEUE);
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                policy: Mutex::new(ReconnectPolicy::from_settings(settings)),
                generation: AtomicU64::new(0),
                task: Mutex::new(None),
                captures,
            }),
            capture_rx: Mutex::new(Some(capture_rx)),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Retries scheduled since the last reset
    pub fn attempts(&self) -> u32 {
        self.inner.lock_policy().attempts()
    }

    /// Successful capture responses, in arrival order. Can be taken once.
    /// At most [`CAPTURE_QUEUE`] are held until it is read.
    pub fn take_capture_receiver(&self) -> Option<mpsc::Receiver<CaptureResponse>> {
        self.capture_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Open the control channel; no-op while connected or connecting
    pub fn connect(&self, url: &str) {
        let mut task = self.inner.lock_task();
        if matches!(
            *self.inner.state.borrow(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!("connect({}) ignored, already {}", url, self.state());
            return;
        }

        let generation = self.inner.cancel(&mut task);
        self.inner.lock_policy().reset();
        self.inner.set_state(generation, ConnectionState::Connecting);
        info!("🔌 Connecting to {}", url);

        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        *task = Some(tokio::spawn(run_session(inner, url, generation)));
    }

    /// Close the channel and suppress any pending reconnect
    pub fn disconnect(&self) {
        let mut task = self.inner.lock_task();
        self.inner.lock_policy().exhaust();
        // Close before cancelling so the close frame is queued first
        self.inner.transport.disconnect();
        let generation = self.inner.cancel(&mut task);
        self.inner.set_state(generation, ConnectionState::Disconnected);
        info!("🔌 Disconnected");
    }

    /// Send a command while connected; dropped otherwise
    pub fn send_command(&self, command: &RobotCommand) -> bool {
        if !self.inner.state.borrow().is_connected() {
            debug!("Dropping {} command, not connected", command.name());
            return false;
        }
        match command.to_json() {
            Ok(json) => self.inner.transport.send(&json),
            Err(e) => {
                warn!("⚠️ Failed to encode {} command: {}", command.name(), e);
                false
            }
        }
    }

    /// Pick up new reconnect settings; the attempt count is kept
    pub fn update_settings(&self, settings: &RobotSettings) {
        self.inner.lock_policy().apply_settings(settings);
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        let mut task = self.inner.lock_task();
        self.inner.transport.disconnect();
        self.inner.cancel(&mut task);
    }
}

async fn run_session<T: Transport>(inner: Arc<Inner<T>>, url: String, generation: u64) {
    loop {
        let mut events = inner.transport.connect(&url);
        let outcome = loop {
            match events.recv().await {
                Some(ControlEvent::Connected) => {
                    if inner.with_policy(generation, ReconnectPolicy::reset).is_none() {
                        return;
                    }
                    if inner.set_state(generation, ConnectionState::Connected) {
                        info!("✅ Connected to {}", url);
                    }
                }
                Some(ControlEvent::MessageReceived(text)) => {
                    if let Some(capture) = parse_capture_response(&text) {
                        if !inner.is_current(generation) {
                            return;
                        }
                        debug!("📷 Capture received ({}x{})", capture.width, capture.height);
                        if inner.captures.try_send(capture).is_err() {
                            debug!("Capture dropped, nobody is reading");
                        }
                    }
                }
                Some(ControlEvent::Error(reason)) => {
                    warn!("❌ Control channel error: {}", reason);
                    break ConnectionState::Error(reason);
                }
                Some(ControlEvent::Disconnected) | None => break ConnectionState::Disconnected,
            }
        };
        // Releases this attempt before anything else happens
        drop(events);

        if !inner.set_state(generation, outcome) {
            return;
        }

        let retry = inner.with_policy(generation, |policy| {
            policy
                .next_delay()
                .map(|delay| (delay, policy.attempts(), policy.max_attempts))
        });
        let Some((delay, attempt, max_attempts)) = retry.flatten() else {
            debug!("No reconnect scheduled");
            return;
        };

        let countdown = format!(
            "Reconnecting in {}s (attempt {}/{})",
            delay.as_secs(),
            attempt,
            max_attempts
        );
        info!("🔄 {}", countdown);
        if !inner.set_state(generation, ConnectionState::Error(countdown)) {
            return;
        }

        tokio::time::sleep(delay).await;

        if inner.state.borrow().is_connected() {
            return;
        }
        if !inner.set_state(generation, ConnectionState::Connecting) {
            return;
        }
        info!("🔌 Reconnecting to {}", url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    fn settings(max_attempts: u32) -> RobotSettings {
        RobotSettings {
            max_reconnect_attempts: max_attempts,
            ..RobotSettings::default()
        }
    }

    fn offsets(transport: &FakeTransport) -> Vec<u64> {
        let times = transport.connect_times();
        times
            .iter()
            .map(|t| (*t - times[0]).as_millis() as u64)
            .collect()
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy::new(true, 10);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(16000));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(30000));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(30000));
    }

    #[test]
    fn test_policy_is_bounded() {
        let mut policy = ReconnectPolicy::new(true, 2);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 2);

        policy.reset();
        policy.enabled = false;
        assert_eq!(policy.next_delay(), None);

        policy.enabled = true;
        policy.exhaust();
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting...");
        assert_eq!(
            ConnectionState::Error("refused".into()).to_string(),
            "Error: refused"
        );
        assert!(ConnectionState::Connected.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_double_then_stop() {
        let manager = ConnectionManager::with_transport(FakeTransport::new(), &settings(3));
        manager.connect("ws://robot:8765");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(offsets(manager.transport()), vec![0, 1000, 3000, 7000]);
        assert_eq!(
            manager.state(),
            ConnectionState::Error("connection refused".into())
        );

        // A manual connect starts over and can succeed
        manager.transport().push_success();
        manager.connect("ws://robot:8765");
        let mut states = manager.subscribe();
        states.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(manager.transport().connect_count(), 5);
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_message() {
        let manager = ConnectionManager::with_transport(FakeTransport::new(), &settings(5));
        manager.connect("ws://robot:8765");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            manager.state(),
            ConnectionState::Error("Reconnecting in 1s (attempt 1/5)".into())
        );

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(
            manager.state(),
            ConnectionState::Error("Reconnecting in 2s (attempt 2/5)".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_stops_retries() {
        let manager = ConnectionManager::with_transport(FakeTransport::new(), &settings(5));
        manager.connect("ws://robot:8765");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(manager.state(), ConnectionState::Error(_)));

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(manager.transport().connect_count(), 1);
        assert_eq!(manager.transport().disconnects(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_disabled() {
        let mut config = settings(5);
        config.set_reconnect_enabled(false);
        let manager = ConnectionManager::with_transport(FakeTransport::new(), &config);
        manager.connect("ws://robot:8765");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.transport().connect_count(), 1);
        assert_eq!(
            manager.state(),
            ConnectionState::Error("connection refused".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_event_resets_attempts() {
        let transport = FakeTransport::new();
        transport.push_failure("refused");
        transport.push_session(Vec::new());
        let manager = ConnectionManager::with_transport(transport, &settings(3));
        manager.connect("ws://robot:8765");
        tokio::time::sleep(Duration::from_secs(60)).await;

        // fail, 1s, connect-then-drop, 1s again, fail, 2s, fail, 4s, fail
        assert_eq!(offsets(manager.transport()), vec![0, 1000, 2000, 4000, 8000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_reconnects() {
        let transport = FakeTransport::new();
        transport.push_success();
        transport.push_success();
        let manager = ConnectionManager::with_transport(transport, &settings(3));
        let mut states = manager.subscribe();
        manager.connect("ws://robot:8765");
        states.wait_for(|s| s.is_connected()).await.unwrap();

        manager.transport().drop_link();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(manager.state().is_connected());
        assert_eq!(offsets(manager.transport()), vec![0, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_while_connected() {
        let transport = FakeTransport::new();
        transport.push_success();
        let manager = ConnectionManager::with_transport(transport, &settings(3));
        let mut states = manager.subscribe();
        manager.connect("ws://robot:8765");
        manager.connect("ws://robot:8765");
        states.wait_for(|s| s.is_connected()).await.unwrap();
        manager.connect("ws://robot:8765");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.transport().connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_while_connected() {
        let transport = FakeTransport::new();
        transport.push_success();
        let manager = ConnectionManager::with_transport(transport, &settings(3));

        assert!(!manager.send_command(&RobotCommand::Forward));
        assert!(manager.transport().sent().is_empty());

        let mut states = manager.subscribe();
        manager.connect("ws://robot:8765");
        states.wait_for(|s| s.is_connected()).await.unwrap();

        let commands = [
            RobotCommand::Forward,
            RobotCommand::Backward,
            RobotCommand::Left,
            RobotCommand::Right,
            RobotCommand::Stop,
            RobotCommand::speed(40),
            RobotCommand::joystick(0.5, -0.5),
            RobotCommand::Capture {
                width: 320,
                height: 240,
            },
        ];
        for command in &commands {
            assert!(manager.send_command(command));
        }
        let sent = manager.transport().sent();
        assert_eq!(sent.len(), commands.len());
        assert_eq!(sent[0], r#"{"command":"forward"}"#);

        manager.disconnect();
        assert!(!manager.send_command(&RobotCommand::Stop));
        assert_eq!(manager.transport().sent().len(), commands.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_successful_captures_are_delivered() {
        let transport = FakeTransport::new();
        transport.push_success();
        let manager = ConnectionManager::with_transport(transport, &settings(3));
        let mut captures = manager.take_capture_receiver().unwrap();
        assert!(manager.take_capture_receiver().is_none());

        let mut states = manager.subscribe();
        manager.connect("ws://robot:8765");
        states.wait_for(|s| s.is_connected()).await.unwrap();

        let fake = manager.transport();
        for message in [
            r#"{"status":"error","command":"capture","message":"camera busy"}"#,
            r#"{"status":"ok","command":"other"}"#,
            "not json",
            r#"{"status":"ok","command":"capture","image":"AAEC","width":2,"height":1,"extra":true}"#,
        ] {
            assert!(fake.inject(ControlEvent::MessageReceived(message.to_string())));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let capture = captures.try_recv().unwrap();
        assert_eq!((capture.width, capture.height), (2, 1));
        assert_eq!(capture.image, "AAEC");
        assert!(captures.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_captures_are_bounded() {
        let transport = FakeTransport::new();
        transport.push_success();
        let manager = ConnectionManager::with_transport(transport, &settings(3));

        let mut states = manager.subscribe();
        manager.connect("ws://robot:8765");
        states.wait_for(|s| s.is_connected()).await.unwrap();

        let fake = manager.transport();
        for width in 1..=20 {
            let reply = format!(
                r#"{{"status":"ok","command":"capture","image":"AAEC","width":{},"height":1}}"#,
                width
            );
            assert!(fake.inject(ControlEvent::MessageReceived(reply)));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.state().is_connected());

        // Oldest kept, the overflow dropped
        let mut captures = manager.take_capture_receiver().unwrap();
        let mut widths = Vec::new();
        while let Ok(capture) = captures.try_recv() {
            widths.push(capture.width);
        }
        assert_eq!(widths, (1..=CAPTURE_QUEUE as u32).collect::<Vec<_>>());
    }
}
