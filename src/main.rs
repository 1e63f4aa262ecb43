//! Robot Remote: command-line remote control
//!
//! Connects to the robot's control channel, follows its video stream and
//! reads commands from stdin, one per line.
//!
//! Usage: robot-remote [OPTIONS]
//!   --url <URL>      Control channel URL (ws://host:port)
//!   --mock           Start in test mode with synthetic video
//!   --debug          Enable debug logging

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use robot_remote::protocol::RobotCommand;
use robot_remote::settings::{self, RobotSettings};
use robot_remote::RobotController;

/// Robot Remote: command-line remote control
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (defaults to $ROBOT_REMOTE_CONFIG or ~/.config/robot-remote/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control channel URL
    #[arg(short, long)]
    url: Option<String>,

    /// Camera HTTP port
    #[arg(long)]
    stream_port: Option<u16>,

    /// Camera stream path
    #[arg(long)]
    stream_path: Option<String>,

    /// Do not start the video stream on connect
    #[arg(long)]
    no_stream: bool,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Maximum automatic reconnection attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_config: bool,

    /// Start in test mode with synthetic video
    #[arg(short, long)]
    mock: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply(&self, settings: &mut RobotSettings) {
        if let Some(url) = &self.url {
            settings.set_server_url(url.clone());
        }
        if let Some(port) = self.stream_port {
            settings.stream_port = port;
        }
        if let Some(path) = &self.stream_path {
            settings.stream_path = path.clone();
        }
        if self.no_stream {
            settings.streaming_enabled = false;
        }
        if self.no_reconnect {
            settings.set_reconnect_enabled(false);
        }
        if let Some(attempts) = self.max_attempts {
            settings.set_max_reconnect_attempts(attempts);
        }
    }
}

const HELP: &str = "commands: w/s/a/d/x  speed N  +/-  joy X Y  drag X Y  release  capture W H  {json}  mock  connect  disconnect  status  quit";

/// Handle one stdin line; `false` ends the session
fn handle_line(controller: &RobotController, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return true;
    };
    if word.starts_with('{') {
        match RobotCommand::from_json(line.trim()) {
            Ok(command) => send(controller, command),
            Err(e) => warn!("⚠️ Not a command: {}", e),
        }
        return true;
    }
    let args: Vec<&str> = words.collect();

    match (word, args.as_slice()) {
        ("w", []) => send(controller, RobotCommand::Forward),
        ("s", []) => send(controller, RobotCommand::Backward),
        ("a", []) => send(controller, RobotCommand::Left),
        ("d", []) => send(controller, RobotCommand::Right),
        ("x", []) => send(controller, RobotCommand::Stop),
        ("+", []) => controller.adjust_speed(10),
        ("-", []) => controller.adjust_speed(-10),
        ("speed", [value]) => match value.parse::<i32>() {
            Ok(value) => controller.set_speed(value),
            Err(_) => warn!("⚠️ Not a speed: {}", value),
        },
        ("joy", [x, y]) => match (x.parse::<f32>(), y.parse::<f32>()) {
            (Ok(x), Ok(y)) => controller.handle_stick(x, y),
            _ => warn!("⚠️ Not a stick position: {} {}", x, y),
        },
        ("drag", [x, y]) => match (x.parse::<f32>(), y.parse::<f32>()) {
            (Ok(x), Ok(y)) => {
                if !controller.is_dragging() {
                    controller.begin_drag();
                }
                controller.update_drag(x, y);
            }
            _ => warn!("⚠️ Not a drag position: {} {}", x, y),
        },
        ("release", []) => controller.end_drag(),
        ("capture", [width, height]) => match (width.parse::<u32>(), height.parse::<u32>()) {
            (Ok(width), Ok(height)) => {
                if !controller.capture_image(width, height) {
                    warn!("⚠️ Capture request not sent");
                }
            }
            _ => warn!("⚠️ Not a capture size: {} {}", width, height),
        },
        ("mock", []) => {
            controller.toggle_test_mode();
        }
        ("connect", []) => controller.connect(),
        ("disconnect", []) => controller.disconnect(),
        ("status", []) => print_status(controller),
        ("quit", []) | ("q", []) => return false,
        ("help", []) | ("?", []) => println!("{}", HELP),
        _ => warn!("⚠️ Unknown command '{}' ({})", line.trim(), HELP),
    }
    true
}

fn send(controller: &RobotController, command: RobotCommand) {
    if !controller.send_command(command) {
        debug!("{} not sent", command.name());
    }
}

fn print_status(controller: &RobotController) {
    let frame = controller
        .current_frame()
        .filter(|_| controller.streaming_state().is_streaming())
        .map(|f| format!("#{} {}x{}", f.sequence, f.image.width(), f.image.height()))
        .unwrap_or_else(|| "none".into());
    let captured = controller
        .captured_image()
        .map(|c| format!("{}x{}", c.width, c.height))
        .unwrap_or_else(|| "none".into());

    println!("  connection : {}", controller.connection_state());
    println!("  video      : {}", controller.streaming_state());
    println!("  frame      : {}", frame);
    println!("  speed      : {}", controller.speed());
    println!("  test mode  : {}", controller.test_mode());
    println!(
        "  capture    : {}{}",
        captured,
        if controller.is_capturing() { " (capturing)" } else { "" }
    );
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    if args.debug {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("debug")
        ).init();
    } else {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info")
        ).init();
    }

    println!();
    println!("  ╔═══════════════════════════════════════════════════╗");
    println!("  ║       🤖 Robot Remote                             ║");
    println!("  ║       Control channel + MJPEG video client        ║");
    println!("  ╚═══════════════════════════════════════════════════╝");
    println!();

    let config_path = args.config.clone().unwrap_or_else(settings::config_path);
    let mut robot_settings = RobotSettings::load(&config_path)?;
    args.apply(&mut robot_settings);
    robot_settings.validate()?;

    if args.save_config {
        robot_settings.save(&config_path)?;
        info!("💾 Settings saved to {}", config_path.display());
    }

    info!("🚀 Starting Robot Remote");
    info!("📡 Control channel: {}", robot_settings.server_url);
    if robot_settings.streaming_enabled {
        info!(
            "📹 Video: port {} path {}",
            robot_settings.stream_port, robot_settings.stream_path
        );
    }

    let controller = RobotController::new(robot_settings);
    if args.mock {
        controller.toggle_test_mode();
    }
    controller.connect();

    let mut connection_states = controller.subscribe_connection();
    let mut stream_states = controller.subscribe_streaming();
    let mut frames = controller.subscribe_frames();
    let mut frame_count: u64 = 0;
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("  {}", HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&controller, &line) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("❌ Failed to read stdin: {}", e);
                    break;
                }
            },

            Ok(()) = connection_states.changed() => {
                let state = connection_states.borrow_and_update().clone();
                info!("🔗 Connection: {}", state);
            }

            Ok(()) = stream_states.changed() => {
                let state = stream_states.borrow_and_update().clone();
                info!("📹 Video: {}", state);
            }

            Ok(()) = frames.changed() => {
                if frames.borrow_and_update().is_some() {
                    frame_count += 1;
                }
            }

            _ = report.tick() => {
                if frame_count > 0 {
                    info!("🎞️ {} frames in the last 5s", frame_count);
                    frame_count = 0;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    controller.disconnect();
    controller.stream().stop_stream();
    info!("👋 Bye");
    Ok(())
}
