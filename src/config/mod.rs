//! Launcher configuration and data directory paths.
//!
//! `launcher.json` in the app support directory may override any field;
//! missing fields fall back to the defaults below. A handful of
//! `HEARTMULA_*` environment variables take precedence over the file.

pub mod paths;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
        }
    }
}

/// How the background service is started and where it listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_service_port")]
    pub port: u16,
    #[serde(default = "default_python")]
    pub program: PathBuf,
    /// `{host}` and `{port}` are substituted with the bind address.
    #[serde(default = "default_service_args")]
    pub args: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_service_port(),
            program: default_python(),
            args: default_service_args(),
            health_path: default_health_path(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Base URL used for both the health probe and the UI.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.bind_address())
    }

    pub fn health_url(&self) -> String {
        let path = self.health_path.trim_start_matches('/');
        format!("{}/{}", self.base_url(), path)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Readiness polling parameters, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    #[serde(default = "default_ready_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ready_timeout_ms(),
            interval_ms: default_interval_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_lock_port")]
    pub port: u16,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_lock_port(),
        }
    }
}

impl LockConfig {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// GUI shell window settings, forwarded to the shell program as flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowConfig {
    /// Shell program; when unset, `heartmula-shell` next to the launcher.
    #[serde(default)]
    pub shell_program: Option<PathBuf>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_min_width")]
    pub min_width: u32,
    #[serde(default = "default_min_height")]
    pub min_height: u32,
    #[serde(default = "default_true")]
    pub resizable: bool,
    #[serde(default)]
    pub fullscreen: bool,
    #[serde(default = "default_background")]
    pub background_color: String,
    #[serde(default = "default_true")]
    pub text_select: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            shell_program: None,
            width: default_width(),
            height: default_height(),
            min_width: default_min_width(),
            min_height: default_min_height(),
            resizable: true,
            fullscreen: false,
            background_color: default_background(),
            text_select: true,
        }
    }
}

fn default_app_name() -> String {
    "HeartMuLa Studio".into()
}
fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_service_port() -> u16 {
    8000
}
fn default_lock_port() -> u16 {
    58765
}
fn default_python() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("python")
    } else {
        PathBuf::from("python3")
    }
}
fn default_service_args() -> Vec<String> {
    [
        "-m",
        "uvicorn",
        "backend.app.main:app",
        "--host",
        "{host}",
        "--port",
        "{port}",
        "--log-level",
        "info",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_health_path() -> String {
    "/health".into()
}
fn default_stop_grace_ms() -> u64 {
    5000
}
fn default_ready_timeout_ms() -> u64 {
    30_000
}
fn default_interval_ms() -> u64 {
    500
}
fn default_attempt_timeout_ms() -> u64 {
    1000
}
fn default_width() -> u32 {
    1400
}
fn default_height() -> u32 {
    900
}
fn default_min_width() -> u32 {
    800
}
fn default_min_height() -> u32 {
    600
}
fn default_background() -> String {
    "#1a1a1a".into()
}
fn default_true() -> bool {
    true
}

/// Read the config file (if any) and apply environment overrides.
pub fn load(path: &Path) -> LauncherConfig {
    let mut config: LauncherConfig = read_json_file(path).unwrap_or_default();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Apply `HEARTMULA_*` overrides. `lookup` returns the raw variable value.
pub fn apply_env_overrides<F>(config: &mut LauncherConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = parse_env(&lookup, "HEARTMULA_SERVICE_PORT") {
        config.service.port = port;
    }
    if let Some(port) = parse_env(&lookup, "HEARTMULA_LOCK_PORT") {
        config.lock.port = port;
    }
    if let Some(ms) = parse_env(&lookup, "HEARTMULA_READY_TIMEOUT_MS") {
        config.readiness.timeout_ms = ms;
    }
    if let Some(program) = non_empty(&lookup, "HEARTMULA_PYTHON") {
        config.service.program = PathBuf::from(program);
    }
    if let Some(program) = non_empty(&lookup, "HEARTMULA_SHELL") {
        config.window.shell_program = Some(PathBuf::from(program));
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = non_empty(lookup, key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}: '{}' is not a valid value", key, raw);
            None
        }
    }
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
