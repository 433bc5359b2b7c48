// Robot side: fixed-rate tick loop, command server and state publisher
//
// The tick loop owns the gait clock and advances the simulated servos. The
// command server applies inbound commands through the mode state machine and
// answers with full state, after every command and on a fixed period.
// Servo bus writes happen on their own blocking thread, never under the lock.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::actuator::{ServoFault, step_all};
use crate::config::{NUM_SERVOS, RobotConfig};
use crate::gait::GaitGenerator;
use crate::kinematics::LegKinematics;
use crate::messages::{Command, Mode};
use crate::mode::{CommandError, apply_command};
use crate::motor::{FeetechError, ServoDriver};
use crate::state::{RobotState, SharedState};
use crate::sync::channel::{ChannelError, Link, Transport};
use crate::sync::zenoh_link::{Role, ZenohTransport};
use crate::task::{Shutdown, TaskSet};

/// How often the servo output thread wakes up to check for shutdown
const OUTPUT_POLL: Duration = Duration::from_millis(100);

pub struct Runtime {
    config: Arc<RobotConfig>,
    kinematics: LegKinematics,
    state: SharedState,
}

/// Outcome of one tick, copied out from under the lock
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub mode: Mode,
    pub angles: [f64; NUM_SERVOS],
    pub servos_enabled: bool,
    pub faults: Vec<(usize, ServoFault)>,
}

/// What the servo bus should be doing right now
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoFrame {
    pub angles: [f64; NUM_SERVOS],
    pub torque: bool,
}

impl Runtime {
    pub fn new(config: Arc<RobotConfig>) -> Self {
        Self {
            kinematics: LegKinematics::new(config.leg),
            state: SharedState::new(RobotState::new(&config.servo)),
            config,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn kinematics(&self) -> &LegKinematics {
        &self.kinematics
    }

    /// Start current and target angles from measured positions so the legs do not jump
    pub fn seed_angles(&self, angles: &[f64; NUM_SERVOS]) {
        let limits = &self.config.servo;
        self.state.update(|state| {
            for (servo, &angle) in state.servos.iter_mut().zip(angles) {
                let angle = limits.clamp(angle);
                servo.current = angle;
                servo.target = angle;
            }
        });
    }

    pub fn on_command(&self, cmd: &Command) -> Result<(), CommandError> {
        let result = self
            .state
            .update(|state| apply_command(state, cmd, &self.kinematics, &self.config));
        match &result {
            Ok(()) => debug!("Applied {}", cmd.name()),
            Err(e) => warn!("Rejected {} command: {}", cmd.name(), e),
        }
        result
    }

    /// Decode and apply one inbound payload. Malformed payloads are dropped.
    pub fn on_payload(&self, payload: &[u8]) {
        match serde_json::from_slice::<Command>(payload) {
            Ok(cmd) => {
                let _ = self.on_command(&cmd);
            }
            Err(e) => warn!("Failed to parse command: {}", e),
        }
    }

    /// One control tick: gait overwrites the targets while walking, then every
    /// servo takes one PID step.
    pub fn tick(&self, gait: &mut GaitGenerator) -> TickReport {
        let limits = &self.config.servo;
        let dt = self.config.dt();
        self.state.update(|state| {
            if let Some(targets) = gait.update(state.mode == Mode::Walk) {
                state.set_targets(&targets, limits);
            }
            let faults = step_all(&mut state.servos, dt, limits);
            TickReport {
                mode: state.mode,
                angles: state.current_angles(),
                servos_enabled: state.servos_enabled,
                faults,
            }
        })
    }

    fn state_payload(&self) -> Result<Vec<u8>, ChannelError> {
        let update = self.state.snapshot().to_update();
        serde_json::to_vec(&update).map_err(|e| ChannelError::Send(e.to_string()))
    }
}

/// Warn when a servo starts faulting, note when it recovers
fn log_faults(faults: &[(usize, ServoFault)], faulted: &mut [bool; NUM_SERVOS]) {
    for (id, flag) in faulted.iter_mut().enumerate() {
        let fault = faults.iter().find(|(i, _)| *i == id).map(|(_, f)| f);
        match (fault, *flag) {
            (Some(fault), false) => {
                warn!("Servo {} fault, holding position: {}", id, fault);
                *flag = true;
            }
            (None, true) => {
                info!("Servo {} recovered", id);
                *flag = false;
            }
            _ => {}
        }
    }
}

/// Fixed-rate loop. A late tick is not made up for; the next one starts a full period later.
pub async fn tick_loop(
    runtime: Arc<Runtime>,
    frames: Option<SyncSender<ServoFrame>>,
    mut shutdown: Shutdown,
) {
    let period = runtime.config.tick_period;
    let mut gait = GaitGenerator::new(runtime.config.gait);
    let mut faulted = [false; NUM_SERVOS];
    let mut last_mode = None;

    info!("Tick loop started: {:?} period", period);

    while !shutdown.is_triggered() {
        let started = Instant::now();

        let report = runtime.tick(&mut gait);
        log_faults(&report.faults, &mut faulted);
        if last_mode != Some(report.mode) {
            debug!("Ticking in {} mode", report.mode);
            last_mode = Some(report.mode);
        }

        if let Some(frames) = &frames {
            // Full means the previous frame is still being written; skip this one
            let _ = frames.try_send(ServoFrame {
                angles: report.angles,
                torque: report.servos_enabled,
            });
        }

        match period.checked_sub(started.elapsed()) {
            Some(rest) => {
                if shutdown.sleep(rest).await {
                    break;
                }
            }
            None => {
                debug!("Tick overran by {:?}", started.elapsed() - period);
                tokio::task::yield_now().await;
            }
        }
    }

    info!("Tick loop stopped");
}

fn apply_frame(driver: &mut ServoDriver, frame: &ServoFrame) -> Result<(), FeetechError> {
    if frame.torque != driver.torque_enabled() {
        driver.set_torque(frame.torque)?;
    }
    if frame.torque {
        driver.write_angles(&frame.angles)?;
    }
    Ok(())
}

/// Blocking loop: mirror the simulated angles onto the bus. Bus errors are logged
/// once per failure streak and never stop the loop.
fn servo_output_loop(mut driver: ServoDriver, frames: Receiver<ServoFrame>, shutdown: Shutdown) {
    let mut failing = false;
    while !shutdown.is_triggered() {
        let frame = match frames.recv_timeout(OUTPUT_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match apply_frame(&mut driver, &frame) {
            Err(e) if !failing => {
                warn!("Servo bus write failed: {}", e);
                failing = true;
            }
            Ok(()) if failing => {
                info!("Servo bus recovered");
                failing = false;
            }
            _ => {}
        }
    }
    debug!("Servo output stopped");
    // Dropping the driver releases torque
}

async fn publish_state<L: Link>(runtime: &Runtime, link: &L) -> Result<(), ChannelError> {
    let payload = runtime.state_payload()?;
    let send_timeout = runtime.config.sync.send_timeout;
    timeout(send_timeout, link.send(payload))
        .await
        .map_err(|_| ChannelError::Timeout(send_timeout))?
}

/// Serve one link until it fails or shutdown
async fn serve_link<L: Link>(runtime: &Runtime, link: &L, shutdown: &mut Shutdown) {
    let mut publish = tokio::time::interval(runtime.config.sync.state_publish_period);
    publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let received = tokio::select! {
            _ = shutdown.triggered() => return,
            _ = publish.tick() => None,
            received = link.recv() => Some(received),
        };

        match received {
            None => {}
            Some(Ok(Some(payload))) => runtime.on_payload(&payload),
            Some(Ok(None)) => {
                warn!("Command link closed by peer");
                return;
            }
            Some(Err(e)) => {
                warn!("Command link error: {}", e);
                return;
            }
        }

        if let Err(e) = publish_state(runtime, link).await {
            warn!("Failed to publish state: {}", e);
            return;
        }
    }
}

/// Accept commands and publish state, reconnecting with a fixed backoff
pub async fn serve<T: Transport>(runtime: Arc<Runtime>, transport: T, mut shutdown: Shutdown) {
    let backoff = runtime.config.sync.retry_backoff;
    let mut failures: u64 = 0;

    while !shutdown.is_triggered() {
        let connected = tokio::select! {
            _ = shutdown.triggered() => break,
            result = transport.connect() => result,
        };

        match connected {
            Ok(link) => {
                failures = 0;
                runtime.state.set_connected(true);
                info!("Command link up");
                serve_link(&runtime, &link, &mut shutdown).await;
                runtime.state.set_connected(false);
                if !shutdown.is_triggered() {
                    warn!("Command link down, retrying every {:?}", backoff);
                }
            }
            Err(e) => {
                if failures == 0 {
                    warn!("Command link connect failed: {}", e);
                } else {
                    debug!("Command link connect attempt {} failed: {}", failures + 1, e);
                }
                failures += 1;
            }
        }

        if shutdown.sleep(backoff).await {
            break;
        }
    }

    debug!("Command server stopped");
}

/// Spawn the robot's loops onto `tasks`
pub fn start<T: Transport>(
    runtime: Arc<Runtime>,
    transport: T,
    driver: Option<ServoDriver>,
    tasks: &mut TaskSet,
) {
    let frames = driver.map(|driver| {
        let (tx, rx) = mpsc::sync_channel(1);
        let shutdown = tasks.shutdown_signal();
        tasks.spawn("servo-output", async move {
            let output = tokio::task::spawn_blocking(move || servo_output_loop(driver, rx, shutdown));
            if let Err(e) = output.await {
                warn!("Servo output thread ended abnormally: {}", e);
            }
        });
        tx
    });

    let shutdown = tasks.shutdown_signal();
    tasks.spawn("tick", tick_loop(runtime.clone(), frames, shutdown));
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("command-server", serve(runtime, transport, shutdown));
}

fn open_servos(runtime: &Runtime) -> Result<Option<ServoDriver>, FeetechError> {
    let hardware = &runtime.config.hardware;
    if !hardware.enabled {
        info!("Servo output disabled, simulating only");
        return Ok(None);
    }

    let mut driver = ServoDriver::open(hardware)?;
    driver.initialize()?;
    match driver.read_angles() {
        Ok(angles) => {
            info!("Present servo angles {:?}", angles);
            runtime.seed_angles(&angles);
        }
        Err(e) => warn!("Could not read present positions, starting from defaults: {}", e),
    }
    Ok(Some(driver))
}

/// Run the robot until Ctrl-C
pub async fn run(config: RobotConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config.validate()?;
    let config = Arc::new(config);
    let runtime = Arc::new(Runtime::new(config.clone()));
    let driver = open_servos(&runtime)?;

    let transport = ZenohTransport::new(Role::Robot, config.sync.clone());
    let mut tasks = TaskSet::new();
    start(runtime, transport, driver, &mut tasks);

    info!(
        "Runtime started: {:?} tick, commands on {}, state on {} every {:?}",
        config.tick_period,
        config.sync.cmd_topic,
        config.sync.state_topic,
        config.sync.state_publish_period
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    tasks.shutdown(config.join_timeout).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StateUpdate;
    use crate::sync::channel::memory::pair;
    use crate::sync::client;

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(RobotConfig::default()))
    }

    fn fast_config() -> Arc<RobotConfig> {
        let mut config = RobotConfig::default();
        config.tick_period = Duration::from_millis(10);
        config.sync.retry_backoff = Duration::from_millis(20);
        config.sync.recv_poll_timeout = Duration::from_millis(10);
        config.sync.state_publish_period = Duration::from_millis(20);
        config.sync.send_timeout = Duration::from_millis(200);
        Arc::new(config)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_walk_overrides_manual_targets() {
        let rt = runtime();
        let mut gait = GaitGenerator::new(rt.config.gait);
        rt.on_command(&Command::set_mode(Mode::Walk)).unwrap();
        rt.on_command(&Command::SetServo { id: 0, angle: 10.0 }).unwrap();

        let report = rt.tick(&mut gait);
        assert_eq!(report.mode, Mode::Walk);

        let targets = rt.state.snapshot().target_angles();
        assert!(targets[0] > 60.0, "gait replaced the explicit target");
        for pair in targets.chunks(2) {
            assert!((pair[0] + pair[1] - 180.0).abs() < 1e-9);
        }
    }

    /// Proportional-only gains; the defaults bounce between the start angle and
    /// start + max_change and never travel towards the target.
    fn p_only(id: usize) -> Command {
        Command::SetPid {
            id,
            kp: 0.5,
            ki: 0.0,
            kd: 0.0,
        }
    }

    #[test]
    fn test_default_gains_bounce_at_start_angle() {
        let rt = runtime();
        let mut gait = GaitGenerator::new(rt.config.gait);
        rt.on_command(&Command::SetServo { id: 0, angle: 120.0 }).unwrap();

        let angles: Vec<f64> = (0..6).map(|_| rt.tick(&mut gait).angles[0]).collect();
        assert_eq!(angles, vec![95.0, 90.0, 95.0, 90.0, 95.0, 90.0]);
    }

    #[test]
    fn test_manual_targets_survive_ticks() {
        let rt = runtime();
        let mut gait = GaitGenerator::new(rt.config.gait);
        rt.on_command(&Command::set_mode(Mode::Manual)).unwrap();
        rt.on_command(&p_only(3)).unwrap();
        rt.on_command(&Command::SetServo { id: 3, angle: 120.0 }).unwrap();

        let mut previous = 90.0;
        for _ in 0..10 {
            let report = rt.tick(&mut gait);
            assert!((report.angles[3] - previous).abs() <= rt.config.servo.max_change + 1e-9);
            previous = report.angles[3];
        }
        let state = rt.state.snapshot();
        assert_eq!(state.servos[3].target, 120.0);
        assert!(state.servos[3].current > 90.0);
        assert_eq!(state.servos[0].current, 90.0);
    }

    #[test]
    fn test_disabled_servos_keep_simulating() {
        let rt = runtime();
        let mut gait = GaitGenerator::new(rt.config.gait);
        rt.on_command(&Command::DisableServos).unwrap();
        rt.on_command(&Command::SetServo { id: 0, angle: 150.0 }).unwrap();

        let report = rt.tick(&mut gait);
        assert!(!report.servos_enabled);
        assert_eq!(report.angles[0], 95.0);
        assert_eq!(rt.state.snapshot().servos[0].current, 95.0);
    }

    #[test]
    fn test_pid_memory_kept_across_mode_change() {
        let rt = runtime();
        let mut gait = GaitGenerator::new(rt.config.gait);
        rt.on_command(&Command::SetServo { id: 1, angle: 150.0 }).unwrap();
        rt.tick(&mut gait);
        let before = rt.state.snapshot().servos[1];
        assert!(before.integral > 0.0);

        rt.on_command(&Command::set_mode(Mode::Scan)).unwrap();
        assert_eq!(rt.state.snapshot().servos[1], before);
    }

    #[test]
    fn test_malformed_command_is_dropped() {
        let rt = runtime();
        let before = rt.state.snapshot();
        rt.on_payload(b"{\"cmd\":\"dance\"}");
        rt.on_payload(b"\xff\xfe");
        rt.on_payload(br#"{"cmd":"set_all_servos","angles":[1,2,3]}"#);
        assert_eq!(rt.state.snapshot(), before);

        rt.on_payload(br#"{"cmd":"set_mode","mode":"scan"}"#);
        assert_eq!(rt.state.mode(), Mode::Scan);
    }

    #[test]
    fn test_seed_angles_clamps_and_holds() {
        let rt = runtime();
        rt.seed_angles(&[45.0, 200.0, 90.0, 90.0, 90.0, -3.0]);
        let state = rt.state.snapshot();
        assert_eq!(state.current_angles(), [45.0, 180.0, 90.0, 90.0, 90.0, 0.0]);
        assert_eq!(state.target_angles(), state.current_angles());
    }

    #[test]
    fn test_fault_log_is_edge_triggered() {
        let mut faulted = [false; NUM_SERVOS];
        let fault = ServoFault::NonFinite {
            output: f64::NAN,
            current: 90.0,
            target: 90.0,
        };
        log_faults(&[(2, fault)], &mut faulted);
        assert!(faulted[2]);
        log_faults(&[], &mut faulted);
        assert!(!faulted[2]);
    }

    #[tokio::test]
    async fn test_publishes_state_on_connect() {
        let (controller, robot) = pair(16);
        let rt = Arc::new(Runtime::new(fast_config()));
        let mut tasks = TaskSet::new();
        start(rt, robot, None, &mut tasks);

        let link = controller.connect().await.unwrap();
        let payload = timeout(Duration::from_secs(1), link.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let update: StateUpdate = serde_json::from_slice(&payload).unwrap();
        assert_eq!(update.mode, Some(Mode::Idle));
        assert_eq!(update.servos.map(|s| s.len()), Some(NUM_SERVOS));
        assert_eq!(update.servos_enabled, Some(true));

        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_controller_drives_simulated_robot() {
        let config = fast_config();
        let (controller, robot) = pair(64);
        let rt = Arc::new(Runtime::new(config.clone()));
        let mut tasks = TaskSet::new();
        start(rt.clone(), robot, None, &mut tasks);
        let client = client::spawn(controller, config, &mut tasks);

        wait_until(|| client.is_connected()).await;
        assert!(client.set_mode(Mode::Manual).await);
        assert!(client.set_pid(0, 0.5, 0.0, 0.0).await);
        assert!(
            client
                .set_all_servos(&[100.0, 80.0, 100.0, 80.0, 100.0, 80.0])
                .await
        );
        wait_until(|| {
            let state = client.state();
            state.mode == Mode::Manual && state.target_angles()[0] == 100.0
        })
        .await;

        // The mirror follows the robot as the servos move
        wait_until(|| client.state().current_angles()[0] > 95.0).await;
        assert_eq!(rt.state.mode(), Mode::Manual);
        assert_eq!(rt.state.snapshot().servos[0].gains.kd, 0.0);

        // Rejected on the robot, the mirror keeps its mode
        assert!(client.send(&Command::SetMode { mode: "flying".into() }).await);
        assert!(client.disable_servos().await);
        wait_until(|| !client.state().servos_enabled).await;
        assert_eq!(client.state().mode, Mode::Manual);

        tasks.shutdown(Duration::from_secs(1)).await;
    }
}
