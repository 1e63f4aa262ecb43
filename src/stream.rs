//! Video stream session
//!
//! Owns at most one running stream (camera or mock), maps its progress to
//! a [`StreamingState`] and keeps only the most recent frame. A new frame
//! replaces the previous one; nothing queues up behind a slow reader.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use image::DynamicImage;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::mjpeg::MjpegClient;
use crate::mock::MockFrameGenerator;

/// State of the video stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamingState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Error(String),
}

impl StreamingState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl fmt::Display for StreamingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

/// A decoded video frame
#[derive(Debug)]
pub struct VideoFrame {
    /// Position in the current stream, starting at 0
    pub sequence: u64,
    pub image: DynamicImage,
}

/// Derive the camera URL from the control channel URL.
///
/// Keeps the host, swaps in `http`, the stream port and the stream path.
pub fn build_stream_url(control_url: &str, stream_port: u16, stream_path: &str) -> Option<String> {
    let url = Url::parse(control_url).ok()?;
    let host = url.host_str().filter(|h| !h.is_empty())?;
    let path = if stream_path.starts_with('/') {
        stream_path.to_string()
    } else {
        format!("/{}", stream_path)
    };
    Some(format!("http://{}:{}{}", host, stream_port, path))
}

/// State shared with the running stream task
struct Shared {
    state: watch::Sender<StreamingState>,
    frame: watch::Sender<Option<Arc<VideoFrame>>>,
    /// Bumped whenever a stream is started or stopped; stale tasks stop writing
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, next: StreamingState) -> bool {
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

    fn publish(&self, generation: u64, frame: VideoFrame) -> bool {
        if !self.set_state(generation, StreamingState::Streaming) {
            return false;
        }
        let frame = Arc::new(frame);
        self.frame.send_if_modified(|slot| {
            if !self.is_current(generation) {
                return false;
            }
            // The replaced frame is dropped here
            *slot = Some(Arc::clone(&frame));
            true
        })
    }
}

/// Controller for one logical video stream
pub struct StreamSession {
    shared: Arc<Shared>,
    client: MjpegClient,
    mock: MockFrameGenerator,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::with_client(MjpegClient::new())
    }

    /// Use a custom camera client
    pub fn with_client(client: MjpegClient) -> Self {
        let (state, _) = watch::channel(StreamingState::Idle);
        let (frame, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state,
                frame,
                generation: AtomicU64::new(0),
            }),
            client,
            mock: MockFrameGenerator::new(),
            task: Mutex::new(None),
        }
    }

    /// Use a custom mock generator for test mode
    pub fn with_mock(mut self, mock: MockFrameGenerator) -> Self {
        self.mock = mock;
        self
    }

    /// Current streaming state
    pub fn state(&self) -> StreamingState {
        self.shared.state.borrow().clone()
    }

    /// Watch streaming state changes
    pub fn subscribe_state(&self) -> watch::Receiver<StreamingState> {
        self.shared.state.subscribe()
    }

    /// Most recent frame, if any
    pub fn current_frame(&self) -> Option<Arc<VideoFrame>> {
        self.shared.frame.borrow().clone()
    }

    /// Watch the latest-frame slot
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.shared.frame.subscribe()
    }

    /// Start streaming from the camera that serves the control channel host
    pub fn start_stream(&self, control_url: &str, stream_port: u16, stream_path: &str) {
        let Some(url) = build_stream_url(control_url, stream_port, stream_path) else {
            self.stop_stream();
            warn!("Cannot derive stream URL from {}", control_url);
            self.shared
                .state
                .send_replace(StreamingState::Error("Invalid control channel URL".into()));
            return;
        };
        self.start_stream_url(url);
    }

    /// Start streaming from an explicit camera URL
    pub fn start_stream_url(&self, url: String) {
        let mut task = self.lock_task();
        let generation = self.restart(&mut task);
        self.shared.set_state(generation, StreamingState::Connecting);
        info!("📹 Starting stream from {}", url);

        let shared = Arc::clone(&self.shared);
        let client = self.client.clone();
        *task = Some(tokio::spawn(async move {
            run_camera(shared, client, url, generation).await;
        }));
    }

    /// Start the synthetic frame source used in test mode
    pub fn start_mock_stream(&self) {
        let mut task = self.lock_task();
        let generation = self.restart(&mut task);
        self.shared.set_state(generation, StreamingState::Streaming);
        info!("🧪 Starting mock stream");

        let shared = Arc::clone(&self.shared);
        let mock = self.mock.clone();
        *task = Some(tokio::spawn(async move {
            run_mock(shared, mock, generation).await;
        }));
    }

    /// Cancel the running stream, drop the held frame and go back to idle
    pub fn stop_stream(&self) {
        let mut task = self.lock_task();
        let had_task = task.is_some();
        let generation = self.restart(&mut task);
        self.shared.set_state(generation, StreamingState::Idle);
        if had_task {
            info!("⏹️ Stream stopped");
        }
    }

    /// Invalidate the running task and release its frame
    fn restart(&self, task: &mut Option<JoinHandle<()>>) -> u64 {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(handle) = task.take() {
            handle.abort();
        }
        self.shared.frame.send_replace(None);
        generation
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
        }
    }
}

async fn run_camera(shared: Arc<Shared>, client: MjpegClient, url: String, generation: u64) {
    let result = async {
        let mut stream = client.connect(&url).await?;
        let mut sequence = 0;
        while let Some(image) = stream.next_frame().await? {
            if !shared.publish(generation, VideoFrame { sequence, image }) {
                return Ok(());
            }
            sequence += 1;
        }
        debug!(
            "Stream ended after {} frames ({} skipped)",
            stream.frames_decoded(),
            stream.frames_skipped()
        );
        Ok::<_, crate::error::RobotError>(())
    };

    match result.await {
        Ok(()) => {
            if shared.set_state(generation, StreamingState::Idle) {
                info!("📹 Stream ended");
            }
        }
        Err(e) => {
            warn!("⚠️ Stream error: {}", e);
            shared.set_state(generation, StreamingState::Error(e.to_string()));
        }
    }
}

async fn run_mock(shared: Arc<Shared>, mock: MockFrameGenerator, generation: u64) {
    let mut ticker = tokio::time::interval(mock.interval);
    let mut sequence = 0;
    loop {
        ticker.tick().await;
        let image = mock.render(sequence);
        if !shared.publish(generation, VideoFrame { sequence, image }) {
            return;
        }
        sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_stream_url() {
        assert_eq!(
            build_stream_url("ws://192.168.1.100:8765", 8080, "/stream").as_deref(),
            Some("http://192.168.1.100:8080/stream")
        );
        assert_eq!(
            build_stream_url("ws://robot.local:8765/ws", 81, "video").as_deref(),
            Some("http://robot.local:81/video")
        );
        assert_eq!(build_stream_url("not a url", 8080, "/stream"), None);
        assert_eq!(build_stream_url("unix:/tmp/socket", 8080, "/stream"), None);
    }

    #[test]
    fn test_streaming_state_display() {
        assert_eq!(StreamingState::Idle.to_string(), "Idle");
        assert_eq!(StreamingState::Error("boom".into()).to_string(), "Error: boom");
        assert!(StreamingState::Streaming.is_streaming());
        assert!(!StreamingState::Connecting.is_streaming());
    }

    #[tokio::test]
    async fn test_invalid_url_reports_error() {
        let session = StreamSession::new();
        session.start_stream("::nonsense::", 8080, "/stream");
        assert_eq!(
            session.state(),
            StreamingState::Error("Invalid control channel URL".into())
        );
        assert!(session.current_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_stream_replaces_frames() {
        let session = StreamSession::new().with_mock(MockFrameGenerator {
            width: 32,
            height: 24,
            interval: Duration::from_millis(100),
        });
        session.start_mock_stream();
        assert_eq!(session.state(), StreamingState::Streaming);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let frame = session.current_frame().expect("mock frame");
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.image.width(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_stream_is_idempotent() {
        let session = StreamSession::new();
        session.start_mock_stream();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session.current_frame().is_some());

        session.stop_stream();
        session.stop_stream();
        assert_eq!(session.state(), StreamingState::Idle);
        assert!(session.current_frame().is_none());

        // Nothing from the cancelled task shows up afterwards
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.state(), StreamingState::Idle);
        assert!(session.current_frame().is_none());
    }

    #[tokio::test]
    async fn test_refused_camera_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = StreamSession::new();
        let mut states = session.subscribe_state();
        session.start_stream("ws://127.0.0.1:8765", port, "/stream");

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, StreamingState::Error(_))),
        )
        .await
        .expect("error state in time")
        .unwrap()
        .clone();
        assert!(matches!(state, StreamingState::Error(_)));
    }
}
