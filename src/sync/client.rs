// Controller side of the link: cached robot state, fire-and-forget commands,
// and a receive loop that reconnects forever with a fixed backoff.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::channel::{Link, Transport};
use crate::config::{NUM_SERVOS, RobotConfig};
use crate::messages::{Command, Mode, StateUpdate};
use crate::state::{RobotState, SharedState};
use crate::task::Shutdown;

/// Handle used by the UI / scripts. Cheap to clone.
pub struct SyncClient<L: Link> {
    config: Arc<RobotConfig>,
    state: SharedState,
    link: Arc<Mutex<Option<Arc<L>>>>,
}

impl<L: Link> Clone for SyncClient<L> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
            link: self.link.clone(),
        }
    }
}

impl<L: Link> SyncClient<L> {
    pub fn new(config: Arc<RobotConfig>) -> Self {
        let state = SharedState::new(RobotState::new(&config.servo));
        Self {
            config,
            state,
            link: Arc::new(Mutex::new(None)),
        }
    }

    /// Last known robot state. Check `connected` before trusting it.
    pub fn state(&self) -> RobotState {
        self.state.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn current_link(&self) -> Option<Arc<L>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach(&self, link: Arc<L>) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        self.state.set_connected(true);
    }

    fn detach(&self) {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.state.set_connected(false);
    }

    /// Drop `failed` if it is still the active link; the receive loop then reconnects
    fn mark_lost(&self, failed: &Arc<L>) {
        let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|l| Arc::ptr_eq(l, failed)) {
            slot.take();
            drop(slot);
            if self.state.set_connected(false) {
                warn!("Link marked down after a failed send");
            }
        }
    }

    /// Send one command. `true` means the channel accepted it, nothing more:
    /// there is no acknowledgement from the robot.
    pub async fn send(&self, cmd: &Command) -> bool {
        let Some(link) = self.current_link() else {
            debug!("Not connected, dropping {}", cmd.name());
            return false;
        };
        let payload = match serde_json::to_vec(cmd) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {}: {}", cmd.name(), e);
                return false;
            }
        };

        let send_timeout = self.config.sync.send_timeout;
        match timeout(send_timeout, link.send(payload)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Error sending {}: {}", cmd.name(), e);
                self.mark_lost(&link);
                false
            }
            Err(_) => {
                warn!("Sending {} timed out after {:?}", cmd.name(), send_timeout);
                self.mark_lost(&link);
                false
            }
        }
    }

    pub async fn set_mode(&self, mode: Mode) -> bool {
        self.send(&Command::set_mode(mode)).await
    }

    pub async fn stand(&self) -> bool {
        self.send(&Command::Stand).await
    }

    pub async fn set_servo(&self, id: usize, angle: f64) -> bool {
        let angle = self.config.servo.clamp(angle);
        self.send(&Command::SetServo { id, angle }).await
    }

    /// Rejected locally (returns false) unless there is exactly one angle per servo
    pub async fn set_all_servos(&self, angles: &[f64]) -> bool {
        if angles.len() != NUM_SERVOS {
            warn!("Expected {} angles, got {}", NUM_SERVOS, angles.len());
            return false;
        }
        self.send(&Command::SetAllServos {
            angles: angles.to_vec(),
        })
        .await
    }

    pub async fn enable_servos(&self) -> bool {
        self.send(&Command::EnableServos).await
    }

    pub async fn disable_servos(&self) -> bool {
        self.send(&Command::DisableServos).await
    }

    pub async fn request_status(&self) -> bool {
        self.send(&Command::GetStatus).await
    }

    pub async fn set_pid(&self, id: usize, kp: f64, ki: f64, kd: f64) -> bool {
        self.send(&Command::SetPid { id, kp, ki, kd }).await
    }

    /// Fold one inbound payload into the cache. Undecodable payloads are dropped.
    fn on_payload(&self, payload: &[u8]) {
        match serde_json::from_slice::<StateUpdate>(payload) {
            Ok(update) => {
                let limits = self.config.servo;
                self.state.update(|state| {
                    if let Some(mode) = update.mode.filter(|m| *m != state.mode) {
                        info!("Robot mode: {}", mode);
                    }
                    state.merge(update, &limits);
                });
            }
            Err(e) => warn!("Dropping malformed state message: {}", e),
        }
    }

    /// Pump one link until it fails, goes silent, is marked down, or shutdown
    async fn receive(&self, link: &L, shutdown: &mut Shutdown) {
        let sync = &self.config.sync;
        let mut last_heard = Instant::now();

        loop {
            if shutdown.is_triggered() || !self.state.is_connected() {
                return;
            }
            match timeout(sync.recv_poll_timeout, link.recv()).await {
                Ok(Ok(Some(payload))) => {
                    last_heard = Instant::now();
                    self.on_payload(&payload);
                }
                Ok(Ok(None)) => {
                    warn!("Link closed by the robot");
                    return;
                }
                Ok(Err(e)) => {
                    warn!("Link error: {}", e);
                    return;
                }
                Err(_) => {
                    if let Some(limit) = sync.state_watchdog {
                        if last_heard.elapsed() > limit {
                            warn!("No state for {:?}, treating link as dead", last_heard.elapsed());
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Start the connect/receive/retry loop as a background task.
pub fn spawn<T: Transport>(
    transport: T,
    config: Arc<RobotConfig>,
    tasks: &mut crate::task::TaskSet,
) -> SyncClient<T::Link> {
    let client = SyncClient::new(config);
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("sync-client", run(transport, client.clone(), shutdown));
    client
}

/// Connect, resync with `get_status`, receive until the link dies, back off, repeat.
pub async fn run<T: Transport>(transport: T, client: SyncClient<T::Link>, mut shutdown: Shutdown) {
    let backoff = client.config.sync.retry_backoff;
    let mut failures: u64 = 0;

    while !shutdown.is_triggered() {
        let connected = tokio::select! {
            _ = shutdown.triggered() => break,
            result = transport.connect() => result,
        };

        match connected {
            Ok(link) => {
                failures = 0;
                let link = Arc::new(link);
                client.attach(link.clone());
                info!("Link connected");

                if !client.request_status().await {
                    warn!("Could not request status after connecting");
                }
                client.receive(&link, &mut shutdown).await;
                client.detach();
                if !shutdown.is_triggered() {
                    warn!("Link lost, retrying every {:?}", backoff);
                }
            }
            Err(e) => {
                // Log the first failure of a streak loudly, the rest quietly
                if failures == 0 {
                    warn!("Connect failed: {}", e);
                } else {
                    debug!("Connect attempt {} failed: {}", failures + 1, e);
                }
                failures += 1;
            }
        }

        if shutdown.sleep(backoff).await {
            break;
        }
    }

    client.detach();
    debug!("Sync client stopped");
}
