//! HeartMuLa Studio launcher.
//!
//! Enforces a single running instance, starts the local HTTP service in the
//! background, waits until it answers its health endpoint, shows the UI and
//! tears everything down exactly once on exit.

pub mod config;
pub mod controller;
pub mod error;
pub mod instance_lock;
pub mod presenter;
pub mod readiness;
pub mod services;
pub mod shutdown;
pub mod supervisor;

#[cfg(test)]
mod test_support;

use std::backtrace::Backtrace;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::paths::AppPaths;
use crate::controller::LauncherController;
use crate::presenter::PresentationChain;
use crate::shutdown::{ShutdownCoordinator, ShutdownGuard};
use crate::supervisor::ServiceEntrypoint;

/// Run the launcher to completion and return the process exit code.
pub async fn run() -> i32 {
    let paths = AppPaths::resolve();
    let created = paths.ensure_created();

    let log_file = services::logger::init(&paths.logs_dir);
    install_panic_hook();
    if let Err(e) = created {
        warn!("Could not create data directories: {:#}", e);
    }

    let config = config::load(&paths.config_path());
    info!("Starting {}", config.app.name);
    info!("App support: {}", paths.app_support_dir.display());
    info!("Models: {}", paths.models_dir.display());
    info!("Database: {}", paths.db_path.display());
    if let Some(log_file) = &log_file {
        info!("Log file: {}", log_file.display());
    }

    let interrupt = CancellationToken::new();
    spawn_interrupt_listener(interrupt.clone());

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let _exit_guard = ShutdownGuard::new(shutdown.clone());

    let entrypoint = ServiceEntrypoint::new(config.service.program.clone())
        .args(config.service.args.clone())
        .envs(paths.service_env())
        .working_dir(paths.app_dir.clone());
    let presentation = PresentationChain::standard(&config.app.name, &config.window);

    let outcome = LauncherController::new(&config, entrypoint, presentation, shutdown, interrupt)
        .run()
        .await;
    info!(
        "Launcher finished in {:?} with exit code {}",
        outcome.final_state, outcome.exit_code
    );
    outcome.exit_code
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!("Panic: {}\n{}", info, backtrace);
    }));
}

/// Cancel `token` on Ctrl-C, or SIGTERM on Unix.
fn spawn_interrupt_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        info!("Interrupt received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = wait_for_ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            wait_for_ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
