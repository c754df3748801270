//! Top-level launcher state machine.
//!
//! ```text
//! Init -> LockAcquired -> ServiceStarting -> ServiceReady | ReadyTimeout
//!      -> UiPresented -> ShuttingDown -> Terminated
//! ```
//!
//! "Already running" goes straight from `Init` to `Terminated` with exit
//! code 0. Any error or panic along the way jumps to `ShuttingDown` and
//! exits 1. An interrupt during the readiness wait or the UI session is a
//! normal shutdown and exits 0.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{LauncherConfig, ReadinessConfig};
use crate::error::{LauncherError, Result};
use crate::instance_lock::InstanceLock;
use crate::presenter::PresentationChain;
use crate::readiness::ReadinessProbe;
use crate::shutdown::{ShutdownCoordinator, StopService};
use crate::supervisor::{ServiceEntrypoint, ServiceState, ServiceSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    Init,
    LockAcquired,
    ServiceStarting,
    ServiceReady,
    /// Readiness never confirmed; proceeds exactly like `ServiceReady`.
    ReadyTimeout,
    UiPresented,
    ShuttingDown,
    Terminated,
}

/// How a launcher run ended.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub final_state: LauncherState,
    /// Every state entered, in order.
    pub history: Vec<LauncherState>,
    pub service_state: ServiceState,
}

/// Non-error ways for the session to end.
enum Exit {
    WindowClosed,
    Interrupted,
    AlreadyRunning,
}

pub struct LauncherController {
    app_name: String,
    lock: InstanceLock,
    supervisor: ServiceSupervisor,
    entrypoint: ServiceEntrypoint,
    bind: SocketAddr,
    base_url: String,
    health_url: String,
    readiness: ReadinessConfig,
    presentation: PresentationChain,
    shutdown: Arc<ShutdownCoordinator>,
    interrupt: CancellationToken,
    history: Vec<LauncherState>,
}

impl LauncherController {
    pub fn new(
        config: &LauncherConfig,
        entrypoint: ServiceEntrypoint,
        presentation: PresentationChain,
        shutdown: Arc<ShutdownCoordinator>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            app_name: config.app.name.clone(),
            lock: InstanceLock::new(config.lock.endpoint()),
            supervisor: ServiceSupervisor::new(config.service.stop_grace()),
            entrypoint,
            bind: config.service.bind_address(),
            base_url: config.service.base_url(),
            health_url: config.service.health_url(),
            readiness: config.readiness.clone(),
            presentation,
            shutdown,
            interrupt,
            history: vec![LauncherState::Init],
        }
    }

    fn state(&self) -> LauncherState {
        self.history
            .last()
            .copied()
            .unwrap_or(LauncherState::Init)
    }

    fn enter(&mut self, next: LauncherState) {
        debug!("Launcher state {:?} -> {:?}", self.state(), next);
        self.history.push(next);
    }

    /// Drive the launcher to `Terminated` and report the exit code.
    pub async fn run(mut self) -> LaunchOutcome {
        let result = AssertUnwindSafe(self.drive()).catch_unwind().await;

        let exit_code = match result {
            Ok(Ok(Exit::AlreadyRunning)) => {
                info!("Another instance of {} is already running.", self.app_name);
                info!("Only one instance can be opened at a time.");
                self.enter(LauncherState::Terminated);
                return self.outcome(0);
            }
            Ok(Ok(Exit::WindowClosed)) => 0,
            Ok(Ok(Exit::Interrupted)) => {
                info!("Shutting down {}...", self.app_name);
                0
            }
            Ok(Err(e)) => {
                error!(
                    "Error starting {} in state {:?}: {:?}",
                    self.app_name,
                    self.state(),
                    anyhow::Error::from(e)
                );
                1
            }
            Err(panic) => {
                error!(
                    "{} aborted in state {:?}: {}",
                    self.app_name,
                    self.state(),
                    panic_message(panic.as_ref())
                );
                1
            }
        };

        self.enter(LauncherState::ShuttingDown);
        self.cleanup().await;
        self.enter(LauncherState::Terminated);
        self.outcome(exit_code)
    }

    /// Stopping the service waits out its grace period; keep that off the
    /// async workers.
    async fn cleanup(&self) {
        let shutdown = self.shutdown.clone();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let stopped = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || shutdown.cleanup())
        })
        .await;
        if let Err(e) = stopped {
            warn!("Cleanup task failed: {}", e);
            self.shutdown.cleanup();
        }
    }

    fn outcome(&self, exit_code: i32) -> LaunchOutcome {
        LaunchOutcome {
            exit_code,
            final_state: self.state(),
            history: self.history.clone(),
            service_state: self.supervisor.state(),
        }
    }

    async fn drive(&mut self) -> Result<Exit> {
        let lock = match self.lock.acquire() {
            Ok(handle) => handle,
            Err(e) if e.is_expected() => return Ok(Exit::AlreadyRunning),
            Err(e) => return Err(e),
        };
        self.shutdown.register(Box::new(lock));
        self.enter(LauncherState::LockAcquired);

        let base_url = parse_url(&self.base_url)?;
        let health_url = parse_url(&self.health_url)?;
        let probe = ReadinessProbe::new(Duration::from_millis(self.readiness.attempt_timeout_ms))
            .map_err(|e| LauncherError::Config(format!("{:#}", e)))?;

        let handle = self.supervisor.start(&self.entrypoint, self.bind)?;
        self.shutdown
            .register(Box::new(StopService::new(handle, self.supervisor.grace())));
        self.enter(LauncherState::ServiceStarting);

        info!("Waiting for server to start...");
        let timeout = Duration::from_millis(self.readiness.timeout_ms);
        let interval = Duration::from_millis(self.readiness.interval_ms);
        let ready = tokio::select! {
            ready = probe.wait_ready(&health_url, timeout, interval) => ready,
            _ = self.interrupt.cancelled() => return Ok(Exit::Interrupted),
        };

        if ready {
            self.supervisor.mark_ready();
            self.enter(LauncherState::ServiceReady);
        } else {
            self.supervisor.mark_failed();
            warn!(
                "Service did not become ready within {:?}; opening the UI anyway",
                timeout
            );
            self.enter(LauncherState::ReadyTimeout);
        }

        self.enter(LauncherState::UiPresented);
        tokio::select! {
            _ = self.presentation.present(&base_url) => {
                info!("Window closed");
                Ok(Exit::WindowClosed)
            }
            _ = self.interrupt.cancelled() => Ok(Exit::Interrupted),
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| LauncherError::Config(format!("invalid URL '{}': {}", raw, e)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
