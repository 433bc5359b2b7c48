// Keyboard teleop for the biped
//
// Modes: I idle, W walk, M manual, C scan. S stand, E/D torque on/off.
// 1-6 select a servo, +/- nudge its target, P print status, Q quit.
// With --sim the robot runs in-process over a memory link instead of Zenoh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tracing::{info, warn};

use biped_zenoh_runtime::config::{NUM_SERVOS, RobotConfig};
use biped_zenoh_runtime::kinematics::{JointPositions, LegKinematics};
use biped_zenoh_runtime::messages::Mode;
use biped_zenoh_runtime::runtime::{self, Runtime};
use biped_zenoh_runtime::sync::channel::memory;
use biped_zenoh_runtime::sync::{Link, Role, SyncClient, ZenohTransport, client};
use biped_zenoh_runtime::task::TaskSet;

const NUDGE_DEGREES: f64 = 5.0;
const STATUS_PERIOD: Duration = Duration::from_secs(2);
const SERVO_NAMES: [&str; NUM_SERVOS] = [
    "L hip", "R hip", "L knee", "R knee", "L ankle", "R ankle",
];

#[derive(Parser, Debug)]
#[command(about = "Keyboard teleop for the biped")]
struct Args {
    /// JSON config file shared with the robot
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a simulated robot in this process instead of connecting over Zenoh
    #[arg(long)]
    sim: bool,

    /// Zenoh endpoint to connect to (repeatable)
    #[arg(long = "connect")]
    endpoints: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RobotConfig::load(path)?,
        None => RobotConfig::default(),
    };
    if !args.endpoints.is_empty() {
        config.sync.endpoints = args.endpoints.clone();
    }
    let config = Arc::new(config);
    let kinematics = LegKinematics::new(config.leg);
    let mut tasks = TaskSet::new();

    info!("Controls: I/W/M/C=mode, S=stand, E/D=torque, 1-6=servo, +/-=nudge, P=status, Q=quit");

    enable_raw_mode()?;
    let result = if args.sim {
        info!("Starting simulated robot");
        let (controller, robot) = memory::pair(64);
        runtime::start(Arc::new(Runtime::new(config.clone())), robot, None, &mut tasks);
        let client = client::spawn(controller, config.clone(), &mut tasks);
        run_teleop(&client, &kinematics).await
    } else {
        let transport = ZenohTransport::new(Role::Controller, config.sync.clone());
        let client = client::spawn(transport, config.clone(), &mut tasks);
        run_teleop(&client, &kinematics).await
    };
    disable_raw_mode()?;

    tasks.shutdown(config.join_timeout).await;
    result
}

async fn run_teleop<L: Link>(
    client: &SyncClient<L>,
    kinematics: &LegKinematics,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut selected: usize = 0;
    let mut last_status = Instant::now();
    let mut was_connected = false;

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                let sent = match code {
                    KeyCode::Char('i') if pressed => Some(client.set_mode(Mode::Idle).await),
                    KeyCode::Char('w') if pressed => Some(client.set_mode(Mode::Walk).await),
                    KeyCode::Char('m') if pressed => Some(client.set_mode(Mode::Manual).await),
                    KeyCode::Char('c') if pressed => Some(client.set_mode(Mode::Scan).await),
                    KeyCode::Char('s') if pressed => Some(client.stand().await),
                    KeyCode::Char('e') if pressed => Some(client.enable_servos().await),
                    KeyCode::Char('d') if pressed => Some(client.disable_servos().await),

                    KeyCode::Char(c @ '1'..='6') if pressed => {
                        selected = c as usize - '1' as usize;
                        info!("Selected servo {} ({})", selected, SERVO_NAMES[selected]);
                        None
                    }
                    KeyCode::Char('+') | KeyCode::Char('=') | KeyCode::Up if pressed => {
                        Some(nudge(client, selected, NUDGE_DEGREES).await)
                    }
                    KeyCode::Char('-') | KeyCode::Down if pressed => {
                        Some(nudge(client, selected, -NUDGE_DEGREES).await)
                    }

                    KeyCode::Char('p') if pressed => {
                        print_status(client, kinematics);
                        None
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => None,
                };

                if sent == Some(false) {
                    warn!("Command not sent (robot disconnected)");
                }
            }
        }

        let connected = client.is_connected();
        if connected != was_connected {
            info!("Robot {}", if connected { "connected" } else { "disconnected" });
            was_connected = connected;
        }
        if connected && last_status.elapsed() > STATUS_PERIOD {
            print_status(client, kinematics);
            last_status = Instant::now();
        }
    }

    Ok(())
}

/// Move one servo's target relative to the last known target
async fn nudge<L: Link>(client: &SyncClient<L>, id: usize, delta: f64) -> bool {
    let target = client.state().servos[id].target + delta;
    client.set_servo(id, target).await
}

fn print_status<L: Link>(client: &SyncClient<L>, kinematics: &LegKinematics) {
    let state = client.state();
    let angles = state.current_angles();
    let joints = kinematics.calculate_joint_positions(&angles);
    info!(
        "mode={} torque={} connected={} angles={:.1?}",
        state.mode, state.servos_enabled, state.connected, angles
    );
    info!("{}", describe_feet(&joints));
}

/// Feet in the sagittal plane as (x, z); y is always 0 for this leg model
fn describe_feet(joints: &JointPositions) -> String {
    format!(
        "feet L=({:.0}, {:.0}) R=({:.0}, {:.0})",
        joints.left_foot[0], joints.left_foot[2], joints.right_foot[0], joints.right_foot[2]
    )
}
