//! Robot Remote: control channel and video client for a mobile robot
//!
//! Commands travel over a WebSocket as JSON text frames; video arrives as
//! an MJPEG `multipart/x-mixed-replace` HTTP stream. The connection
//! reconnects with bounded backoff and the video keeps only the newest
//! frame.

pub mod connection;
pub mod control;
pub mod controller;
pub mod error;
pub mod frame;
pub mod joystick;
pub mod mjpeg;
pub mod mock;
pub mod protocol;
pub mod settings;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use control::{ControlClient, ControlEvent, Transport};
pub use controller::RobotController;
pub use error::{Result, RobotError};
pub use protocol::{CaptureResponse, RobotCommand};
pub use settings::RobotSettings;
pub use stream::{StreamSession, StreamingState, VideoFrame};
