// Background task bookkeeping: a shared stop signal plus a bounded, best-effort join

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Receiving side of the stop signal, one clone per loop
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Checked once per loop iteration
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised (immediately if it already was)
    pub async fn triggered(&mut self) {
        // Err means every sender is gone, which also means stop
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown comes first. Returns true if woken by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.triggered() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Owns the background loops of one process
#[derive(Debug)]
pub struct TaskSet {
    stop: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: Vec::new(),
        }
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown {
            rx: self.stop.subscribe(),
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Spawning task {}", name);
        self.tasks.push((name, tokio::spawn(fut)));
    }

    /// Raise the stop signal and wait for every task, for at most `timeout` in total.
    /// Tasks still running after that are left detached.
    pub async fn shutdown(self, timeout: Duration) {
        self.stop.send_replace(true);
        let deadline = Instant::now() + timeout;

        for (name, handle) in self.tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!("Task {} stopped", name),
                Ok(Err(e)) => warn!("Task {} ended abnormally: {}", name, e),
                Err(_) => warn!("Task {} did not stop within {:?}, moving on", name, timeout),
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}
