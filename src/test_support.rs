//! Scripted transport for state machine tests

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::control::{ControlEvent, Transport};

/// What one connection attempt does
enum Script {
    /// Deliver the events, then end the event stream
    Close(Vec<ControlEvent>),
    /// Deliver the events and keep the stream open
    StayOpen(Vec<ControlEvent>),
}

#[derive(Default)]
struct FakeState {
    scripts: VecDeque<Script>,
    connects: Vec<(String, Instant)>,
    sent: Vec<String>,
    disconnects: usize,
    open: bool,
    live: Option<mpsc::Sender<ControlEvent>>,
}

/// Transport whose attempts follow a queued script.
///
/// Attempts beyond the script fail with a refused connection.
#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next attempt fails straight away
    pub fn push_failure(&self, reason: &str) {
        self.lock()
            .scripts
            .push_back(Script::Close(vec![ControlEvent::Error(reason.to_string())]));
    }

    /// Next attempt connects and stays connected
    pub fn push_success(&self) {
        self.lock()
            .scripts
            .push_back(Script::StayOpen(vec![ControlEvent::Connected]));
    }

    /// Next attempt connects, delivers `events`, then drops
    pub fn push_session(&self, events: Vec<ControlEvent>) {
        let mut script = vec![ControlEvent::Connected];
        script.extend(events);
        self.lock().scripts.push_back(Script::Close(script));
    }

    /// Feed an event into the open attempt
    pub fn inject(&self, event: ControlEvent) -> bool {
        let state = self.lock();
        state
            .live
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }

    /// Drop the open attempt as if the robot went away
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.open = false;
        state.live = None;
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.lock().connects.iter().map(|(_, at)| *at).collect()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

impl Transport for FakeTransport {
    fn connect(&self, url: &str) -> mpsc::Receiver<ControlEvent> {
        let mut state = self.lock();
        state.connects.push((url.to_string(), Instant::now()));
        let script = state.scripts.pop_front().unwrap_or_else(|| {
            Script::Close(vec![ControlEvent::Error("connection refused".into())])
        });

        let (tx, rx) = mpsc::channel(32);
        let (events, stay_open) = match script {
            Script::Close(events) => (events, false),
            Script::StayOpen(events) => (events, true),
        };
        state.open = events.contains(&ControlEvent::Connected) && stay_open;
        for event in events {
            let _ = tx.try_send(event);
        }
        state.live = stay_open.then_some(tx);
        rx
    }

    fn send(&self, message: &str) -> bool {
        let mut state = self.lock();
        state.sent.push(message.to_string());
        state.open
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        state.disconnects += 1;
        state.open = false;
        state.live = None;
    }
}
