//! Platform-specific data directory paths.
//!
//!   macOS:   ~/Library/Application Support/HeartMuLa (logs in ~/Library/Logs/HeartMuLa)
//!   Windows: %APPDATA%/HeartMuLa
//!   Linux:   $XDG_DATA_HOME/HeartMuLa (default ~/.local/share)
//!
//! Everything the service writes lives under these directories, never
//! inside the application bundle.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "HeartMuLa";

/// Resolved directory layout handed to the service at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub app_support_dir: PathBuf,
    pub models_dir: PathBuf,
    pub generated_audio_dir: PathBuf,
    pub ref_audio_dir: PathBuf,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
    /// Working directory of the service process (frontend assets, backend package).
    pub app_dir: PathBuf,
}

impl AppPaths {
    /// Resolve the platform layout for the current user.
    pub fn resolve() -> Self {
        let app_support_dir = get_data_base().join(APP_DIR_NAME);
        let logs_dir = get_logs_dir(&app_support_dir);
        Self::with_dirs(app_support_dir, logs_dir, get_app_dir())
    }

    /// Build the layout below an explicit base directory.
    pub fn under(base: &Path) -> Self {
        let app_support_dir = base.join(APP_DIR_NAME);
        let logs_dir = app_support_dir.join("logs");
        Self::with_dirs(app_support_dir, logs_dir, base.to_path_buf())
    }

    fn with_dirs(app_support_dir: PathBuf, logs_dir: PathBuf, app_dir: PathBuf) -> Self {
        Self {
            models_dir: app_support_dir.join("models"),
            generated_audio_dir: app_support_dir.join("generated_audio"),
            ref_audio_dir: app_support_dir.join("ref_audio"),
            db_path: app_support_dir.join("jobs.db"),
            app_support_dir,
            logs_dir,
            app_dir,
        }
    }

    /// Create every data directory. Safe to call repeatedly.
    pub fn ensure_created(&self) -> Result<()> {
        for dir in [
            &self.app_support_dir,
            &self.models_dir,
            &self.generated_audio_dir,
            &self.ref_audio_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Environment bindings forwarded verbatim to the service process.
    pub fn service_env(&self) -> Vec<(String, OsString)> {
        vec![
            ("HEARTMULA_MODEL_DIR".into(), self.models_dir.clone().into()),
            ("HEARTMULA_DB_PATH".into(), self.db_path.clone().into()),
            (
                "HEARTMULA_GENERATED_AUDIO_DIR".into(),
                self.generated_audio_dir.clone().into(),
            ),
            (
                "HEARTMULA_REF_AUDIO_DIR".into(),
                self.ref_audio_dir.clone().into(),
            ),
            // Metal fallback for ops the MPS backend does not implement.
            ("PYTORCH_ENABLE_MPS_FALLBACK".into(), "1".into()),
        ]
    }

    pub fn config_path(&self) -> PathBuf {
        self.app_support_dir.join("launcher.json")
    }
}

/// Get the platform-appropriate base data directory.
fn get_data_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AppData")
                .join("Roaming")
        })
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("share")
    }
}

fn get_logs_dir(app_support_dir: &Path) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        let _ = app_support_dir;
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Logs")
            .join(APP_DIR_NAME)
    }

    #[cfg(not(target_os = "macos"))]
    {
        app_support_dir.join("logs")
    }
}

/// `HEARTMULA_APP_DIR` if set, otherwise the directory holding the launcher binary.
fn get_app_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("HEARTMULA_APP_DIR") {
        return PathBuf::from(dir);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
