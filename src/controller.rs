//! Robot controller
//!
//! Per-session view state tying the control channel and the video stream
//! together: speed, test mode, the single capture slot and stick input.
//! Two background watchers follow the connection (to start and stop the
//! stream) and the capture feed. A third task samples an on-screen drag
//! while one is in progress. All of them stop when the controller is
//! dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::control::{ControlClient, Transport};
use crate::joystick::{DragTracker, StickFilter, SEND_INTERVAL};
use crate::protocol::{CaptureResponse, RobotCommand, MAX_SPEED};
use crate::settings::RobotSettings;
use crate::stream::{StreamSession, StreamingState, VideoFrame};

/// Speed the robot starts with
pub const INITIAL_SPEED: u8 = 50;

#[derive(Debug)]
struct ViewState {
    speed: u8,
    test_mode: bool,
    moving: bool,
    capturing: bool,
    captured: Option<CaptureResponse>,
    stick: StickFilter,
    drag: DragTracker,
}

struct Shared<T: Transport> {
    connection: ConnectionManager<T>,
    stream: StreamSession,
    settings: Mutex<RobotSettings>,
    view: Mutex<ViewState>,
}

impl<T: Transport> Shared<T> {
    fn view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> RobotSettings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn start_camera(&self) {
        let settings = self.settings();
        self.stream
            .start_stream(&settings.server_url, settings.stream_port, &settings.stream_path);
    }

    fn send_command(&self, command: RobotCommand) -> bool {
        {
            let mut view = self.view();
            if view.test_mode {
                debug!("Test mode, dropping {} command", command.name());
                return false;
            }
            match command {
                RobotCommand::Stop => view.moving = false,
                RobotCommand::Speed { .. } | RobotCommand::Capture { .. } => {}
                other => view.moving = other.is_movement(),
            }
        }
        self.connection.send_command(&command)
    }
}

/// Remote control session for one robot
pub struct RobotController<T: Transport = ControlClient> {
    shared: Arc<Shared<T>>,
    watchers: Vec<JoinHandle<()>>,
    drag_task: Mutex<Option<JoinHandle<()>>>,
}

impl RobotController<ControlClient> {
    pub fn new(settings: RobotSettings) -> Self {
        let connection = ConnectionManager::new(&settings);
        Self::with_parts(connection, StreamSession::new(), settings)
    }
}

impl<T: Transport> RobotController<T> {
    /// Assemble from prepared parts. Must run inside a tokio runtime.
    pub fn with_parts(
        connection: ConnectionManager<T>,
        stream: StreamSession,
        settings: RobotSettings,
    ) -> Self {
        let captures = connection.take_capture_receiver();
        let states = connection.subscribe();
        let shared = Arc::new(Shared {
            connection,
            stream,
            settings: Mutex::new(settings),
            view: Mutex::new(ViewState {
                speed: INITIAL_SPEED,
                test_mode: false,
                moving: false,
                capturing: false,
                captured: None,
                stick: StickFilter::new(),
                drag: DragTracker::new(),
            }),
        });

        let mut watchers = vec![tokio::spawn(follow_connection(Arc::clone(&shared), states))];
        if let Some(mut captures) = captures {
            let shared = Arc::clone(&shared);
            watchers.push(tokio::spawn(async move {
                while let Some(capture) = captures.recv().await {
                    info!("📷 Captured {}x{} image", capture.width, capture.height);
                    let mut view = shared.view();
                    view.capturing = false;
                    view.captured = Some(capture);
                }
            }));
        }

        Self {
            shared,
            watchers,
            drag_task: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.shared.connection
    }

    pub fn stream(&self) -> &StreamSession {
        &self.shared.stream
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    pub fn streaming_state(&self) -> StreamingState {
        self.shared.stream.state()
    }

    pub fn subscribe_streaming(&self) -> watch::Receiver<StreamingState> {
        self.shared.stream.subscribe_state()
    }

    pub fn current_frame(&self) -> Option<Arc<VideoFrame>> {
        self.shared.stream.current_frame()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.shared.stream.subscribe_frames()
    }

    pub fn settings(&self) -> RobotSettings {
        self.shared.settings()
    }

    /// Replace the settings; reconnect policy changes apply immediately
    pub fn update_settings(&self, settings: RobotSettings) {
        self.shared.connection.update_settings(&settings);
        *self
            .shared
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Connect to the configured server
    pub fn connect(&self) {
        let url = self.shared.settings().server_url;
        self.shared.connection.connect(&url);
    }

    pub fn disconnect(&self) {
        self.shared.view().moving = false;
        self.shared.connection.disconnect();
    }

    /// Send a command; dropped in test mode or while not connected
    pub fn send_command(&self, command: RobotCommand) -> bool {
        self.shared.send_command(command)
    }

    pub fn speed(&self) -> u8 {
        self.shared.view().speed
    }

    /// Clamp to `0..=100`; a changed value is sent to the robot
    pub fn set_speed(&self, value: i32) {
        let speed = value.clamp(0, i32::from(MAX_SPEED)) as u8;
        {
            let mut view = self.shared.view();
            if view.speed == speed {
                return;
            }
            view.speed = speed;
        }
        debug!("Speed set to {}", speed);
        self.shared.send_command(RobotCommand::Speed { value: speed });
    }

    pub fn adjust_speed(&self, delta: i32) {
        let current = i32::from(self.speed());
        self.set_speed(current.saturating_add(delta));
    }

    /// Whether the last movement command left the robot moving
    pub fn is_moving(&self) -> bool {
        self.shared.view().moving
    }

    pub fn test_mode(&self) -> bool {
        self.shared.view().test_mode
    }

    /// Flip test mode and return the new value.
    ///
    /// Entering test mode swaps the video for mock frames. Leaving it goes
    /// back to the camera if connected and streaming is enabled.
    pub fn toggle_test_mode(&self) -> bool {
        let enabled = {
            let mut view = self.shared.view();
            view.test_mode = !view.test_mode;
            view.test_mode
        };

        if enabled {
            info!("🧪 Test mode on");
            self.shared.stream.start_mock_stream();
        } else {
            info!("🧪 Test mode off");
            self.shared.stream.stop_stream();
            if self.connection_state().is_connected() && self.shared.settings().streaming_enabled {
                self.shared.start_camera();
            }
        }
        enabled
    }

    /// Ask the robot for a still image
    pub fn capture_image(&self, width: u32, height: u32) -> bool {
        self.shared.view().capturing = true;
        self.shared
            .send_command(RobotCommand::Capture { width, height })
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.view().capturing
    }

    /// Most recent captured image, if not dismissed
    pub fn captured_image(&self) -> Option<CaptureResponse> {
        self.shared.view().captured.clone()
    }

    pub fn dismiss_captured_image(&self) {
        self.shared.view().captured = None;
    }

    /// Feed a raw analog stick reading
    pub fn handle_stick(&self, raw_x: f32, raw_y: f32) {
        let command = self
            .shared
            .view()
            .stick
            .update(raw_x, raw_y, Instant::now());
        if let Some(command) = command {
            self.shared.send_command(command);
        }
    }

    /// Filtered stick position, for display
    pub fn stick_position(&self) -> (f32, f32) {
        self.shared.view().stick.position()
    }

    /// Start an on-screen drag; the knob position is re-sent every tick
    /// it has moved
    pub fn begin_drag(&self) {
        let mut task = self.lock_drag_task();
        if let Some(handle) = task.take() {
            handle.abort();
        }
        self.shared.view().drag.reset();

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SEND_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let command = shared.view().drag.poll();
                if let Some(command) = command {
                    shared.send_command(command);
                }
            }
        }));
        debug!("Drag started");
    }

    /// Move the knob, Y up, both axes in `-1.0..=1.0`
    pub fn update_drag(&self, x: f32, y: f32) {
        self.shared.view().drag.update(x, y);
    }

    pub fn is_dragging(&self) -> bool {
        self.lock_drag_task().is_some()
    }

    /// Knob position of the current drag
    pub fn drag_position(&self) -> (f32, f32) {
        self.shared.view().drag.position()
    }

    /// Release the knob: stop sampling and send centre once
    pub fn end_drag(&self) {
        let Some(handle) = self.lock_drag_task().take() else {
            return;
        };
        handle.abort();
        self.shared.view().drag.reset();
        debug!("Drag released");
        self.shared.send_command(RobotCommand::joystick(0.0, 0.0));
    }

    fn lock_drag_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.drag_task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Transport> Drop for RobotController<T> {
    fn drop(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(handle) = self.lock_drag_task().take() {
            handle.abort();
        }
        self.shared.stream.stop_stream();
    }
}

/// Start the camera when the link comes up, stop it when it goes down
async fn follow_connection<T: Transport>(
    shared: Arc<Shared<T>>,
    mut states: watch::Receiver<ConnectionState>,
) {
    let mut was_connected = states.borrow_and_update().is_connected();

    while states.changed().await.is_ok() {
        let connected = states.borrow_and_update().is_connected();
        if connected && !was_connected {
            let test_mode = shared.view().test_mode;
            if shared.settings().streaming_enabled && !test_mode {
                shared.start_camera();
            }
        } else if !connected && was_connected {
            let test_mode = shared.view().test_mode;
            if !test_mode {
                shared.stream.stop_stream();
            }
        }
        was_connected = connected;
    }
}
