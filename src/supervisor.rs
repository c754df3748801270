//! Background service supervision.
//!
//! The service runs as a child process in its own execution context: one
//! watcher thread notices crashes and one reader thread per output stream
//! re-emits every line through `tracing`, so service output lands on the
//! console and in the log file with a timestamp. Nothing here blocks the
//! caller, and nothing reports service failures back synchronously; the
//! controller only learns about readiness through the health probe.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LauncherError, Result};
use crate::services::logger::SERVICE_TARGET;

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of the background service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// What to run. The setup collaborator's environment is forwarded as-is.
#[derive(Debug, Clone)]
pub struct ServiceEntrypoint {
    pub program: PathBuf,
    /// `{host}` and `{port}` are replaced with the bind address.
    pub args: Vec<String>,
    pub env: Vec<(String, OsString)>,
    pub working_dir: Option<PathBuf>,
}

impl ServiceEntrypoint {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: Vec<(String, OsString)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn resolved_args(&self, bind: SocketAddr) -> Vec<String> {
        let host = bind.ip().to_string();
        let port = bind.port().to_string();
        self.args
            .iter()
            .map(|a| a.replace("{host}", &host).replace("{port}", &port))
            .collect()
    }
}

struct Inner {
    context_id: Uuid,
    pid: Option<u32>,
    state: Mutex<ServiceState>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
}

/// Shared view of one execution context. Cloning does not start anything.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("context_id", &self.inner.context_id)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ServiceHandle {
    fn new(pid: Option<u32>, child: Option<Child>, state: ServiceState) -> Self {
        Self {
            inner: Arc::new(Inner {
                context_id: Uuid::new_v4(),
                pid,
                state: Mutex::new(state),
                child: Mutex::new(child),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.inner.context_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ServiceState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Move `from -> to` only if currently in `from`.
    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Terminate the service: ask politely, wait up to `grace`, then kill.
    /// A no-op once the context has been cancelled.
    pub fn stop(&self, grace: Duration) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        let mut guard = self.inner.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut child) = guard.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("Service already exited ({})", status),
                Ok(None) => terminate(&mut child, grace),
                Err(e) => warn!("Cannot query service process state: {}", e),
            }
        }
        drop(guard);

        self.set_state(ServiceState::Stopped);
        info!(context = %self.inner.context_id, "Service stopped");
    }
}

/// Ask the child to exit, escalate to a kill after `grace`, and reap it.
fn terminate(child: &mut Child, grace: Duration) {
    request_terminate(child);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Service exited after terminate request ({})", status);
                return;
            }
            Ok(None) => std::thread::sleep(STOP_POLL_INTERVAL),
            Err(e) => {
                warn!("Cannot query service process state: {}", e);
                break;
            }
        }
    }

    warn!("Service did not exit within {:?}, killing it", grace);
    if let Err(e) = child.kill() {
        warn!("Failed to kill service process, abandoning it: {}", e);
        return;
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    let pid = child.id().to_string();
    match Command::new("kill")
        .args(["-TERM", &pid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("kill -TERM {} exited with {}", pid, status),
        Err(e) => debug!("kill -TERM {} failed: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    // No polite terminate signal for a console-less child.
    let _ = child.kill();
}

/// Owns the service's execution context for the launcher's lifetime.
pub struct ServiceSupervisor {
    handle: Option<ServiceHandle>,
    grace: Duration,
}

impl ServiceSupervisor {
    /// `grace` bounds how long `stop` waits for a polite exit.
    pub fn new(grace: Duration) -> Self {
        Self {
            handle: None,
            grace,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.handle
            .as_ref()
            .map(ServiceHandle::state)
            .unwrap_or(ServiceState::NotStarted)
    }

    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Launch the service and return immediately in `Starting`.
    ///
    /// Fails with `ServiceStart` only when the process cannot be spawned;
    /// everything after that is observed through the health probe.
    pub fn start(&mut self, entrypoint: &ServiceEntrypoint, bind: SocketAddr) -> Result<ServiceHandle> {
        if let Some(handle) = &self.handle {
            if matches!(handle.state(), ServiceState::Starting | ServiceState::Ready) {
                debug!("Service already started, reusing context {}", handle.context_id());
                return Ok(handle.clone());
            }
        }

        let args = entrypoint.resolved_args(bind);
        info!(
            "Starting service: {} {}",
            entrypoint.program.display(),
            args.join(" ")
        );

        let mut cmd = Command::new(&entrypoint.program);
        cmd.args(&args)
            .envs(entrypoint.env.iter().map(|(k, v)| (k, v)))
            .env("HEARTMULA_HOST", bind.ip().to_string())
            .env("HEARTMULA_PORT", bind.port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &entrypoint.working_dir {
            cmd.current_dir(dir);
        }

        // On Windows, prevent console window from flashing
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.handle = Some(ServiceHandle::new(None, None, ServiceState::Failed));
                return Err(LauncherError::ServiceStart {
                    program: entrypoint.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let handle = ServiceHandle::new(Some(pid), Some(child), ServiceState::Starting);
        info!(pid, context = %handle.context_id(), "Service process spawned");

        // Carry the caller's subscriber into the context's threads.
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        if let Some(stdout) = stdout {
            spawn_line_pump("stdout", stdout, dispatch.clone());
        }
        if let Some(stderr) = stderr {
            spawn_line_pump("stderr", stderr, dispatch.clone());
        }
        spawn_watcher(handle.clone(), dispatch);

        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Record the first successful health probe.
    pub fn mark_ready(&self) {
        if let Some(handle) = &self.handle {
            if !handle.transition(ServiceState::Starting, ServiceState::Ready) {
                debug!("mark_ready ignored in state {:?}", handle.state());
            }
        }
    }

    /// Record that readiness was never confirmed.
    pub fn mark_failed(&self) {
        if let Some(handle) = &self.handle {
            handle.transition(ServiceState::Starting, ServiceState::Failed);
        }
    }

    /// Best-effort stop. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = &self.handle {
            handle.stop(self.grace);
        }
    }
}

/// Re-emit each line of `stream` as a log event until EOF.
fn spawn_line_pump<R>(stream: &'static str, source: R, dispatch: tracing::Dispatch) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || {
            let mut reader = BufReader::new(source);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        info!(target: SERVICE_TARGET, stream, "{}", line);
                    }
                    Err(e) => {
                        debug!("Service {} read error: {}", stream, e);
                        break;
                    }
                }
            }
        })
    })
}

/// Watch for the child exiting on its own. Exits once the context is cancelled.
fn spawn_watcher(handle: ServiceHandle, dispatch: tracing::Dispatch) -> JoinHandle<()> {
    std::thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || loop {
            if handle.inner.cancel.is_cancelled() {
                break;
            }
            let exited = {
                let mut guard = handle.inner.child.lock().unwrap_or_else(|e| e.into_inner());
                match guard.as_mut().map(Child::try_wait) {
                    Some(Ok(Some(status))) => Some(status.to_string()),
                    Some(Ok(None)) => None,
                    Some(Err(e)) => Some(format!("unknown status ({})", e)),
                    None => break,
                }
            };
            if let Some(status) = exited {
                if !handle.inner.cancel.is_cancelled() {
                    warn!(context = %handle.context_id(), "Service process exited unexpectedly: {}", status);
                    handle.set_state(ServiceState::Stopped);
                }
                break;
            }
            std::thread::sleep(WATCH_INTERVAL);
        })
    })
}
