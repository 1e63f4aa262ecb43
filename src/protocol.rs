//! Control channel wire protocol
//!
//! Commands go out as one JSON object per text frame, tagged by a
//! `command` field. The robot answers captures with a JSON object carrying
//! a base64 encoded image; every other inbound shape is ignored.

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use log::debug;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Result;

/// Upper bound of the speed setting
pub const MAX_SPEED: u8 = 100;

/// A command understood by the robot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum RobotCommand {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Speed {
        value: u8,
    },
    Joystick {
        #[serde(serialize_with = "two_decimals")]
        x: f32,
        #[serde(serialize_with = "two_decimals")]
        y: f32,
    },
    Capture {
        width: u32,
        height: u32,
    },
}

impl RobotCommand {
    /// Speed command, clamped to `0..=100`
    pub fn speed(value: i32) -> Self {
        Self::Speed {
            value: value.clamp(0, MAX_SPEED as i32) as u8,
        }
    }

    /// Joystick command, both axes clamped to `-1.0..=1.0`
    pub fn joystick(x: f32, y: f32) -> Self {
        Self::Joystick {
            x: x.clamp(-1.0, 1.0),
            y: y.clamp(-1.0, 1.0),
        }
    }

    /// Wire name of this command
    pub fn name(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::Left => "left",
            Self::Right => "right",
            Self::Stop => "stop",
            Self::Speed { .. } => "speed",
            Self::Joystick { .. } => "joystick",
            Self::Capture { .. } => "capture",
        }
    }

    /// True for commands that put the robot in motion
    pub fn is_movement(&self) -> bool {
        match self {
            Self::Forward | Self::Backward | Self::Left | Self::Right => true,
            Self::Joystick { x, y } => (x * x + y * y).sqrt() > 0.1,
            _ => false,
        }
    }

    /// Encode as a single JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame produced by [`RobotCommand::to_json`]
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// Joystick axes travel with exactly two decimals.
fn two_decimals<S: Serializer>(value: &f32, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64((f64::from(*value) * 100.0).round() / 100.0)
}

/// Image returned by the robot in answer to a capture command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub status: String,
    pub command: String,
    /// Base64 encoded image bytes
    pub image: String,
    pub width: u32,
    pub height: u32,
}

impl CaptureResponse {
    /// Whether this is a successful capture answer
    pub fn is_capture_ok(&self) -> bool {
        self.command == "capture" && self.status == "ok"
    }

    /// Raw image bytes carried in the response
    pub fn decode_image(&self) -> Result<Vec<u8>> {
        Ok(BASE64_ENGINE.decode(self.image.trim())?)
    }

    /// Decode the carried image
    pub fn to_image(&self) -> Result<image::DynamicImage> {
        let bytes = self.decode_image()?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

/// Parse an inbound text frame, keeping only successful capture answers.
///
/// Answers are matched by `(command, status)` alone, so two captures in
/// flight cannot be told apart.
pub fn parse_capture_response(text: &str) -> Option<CaptureResponse> {
    match serde_json::from_str::<CaptureResponse>(text) {
        Ok(response) if response.is_capture_ok() => Some(response),
        Ok(response) => {
            debug!(
                "Ignoring response command={} status={}",
                response.command, response.status
            );
            None
        }
        Err(e) => {
            debug!("Ignoring unparsable message: {}", e);
            None
        }
    }
}
