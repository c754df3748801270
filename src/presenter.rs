//! UI presentation strategies.
//!
//! The launcher first tries the GUI shell window, then the system browser,
//! and finally parks in a keep-alive loop so the service stays reachable.
//! Each strategy fails on its own; the chain moves on with a warning.

use std::convert::Infallible;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::config::WindowConfig;
use crate::error::{LauncherError, Result};

/// How a strategy finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// The user closed the window; shut down.
    Closed,
    /// The UI lives outside the launcher now; stay alive.
    Detached,
}

#[async_trait]
pub trait PresentationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Show the UI at `url`. May block for the whole interactive session.
    async fn present(&self, url: &Url) -> Result<Presentation>;
}

/// The GUI shell: an external window host pointed at the service URL.
pub struct ShellWindow {
    program: PathBuf,
    title: String,
    window: WindowConfig,
    init_window: Duration,
}

impl ShellWindow {
    const DEFAULT_INIT_WINDOW: Duration = Duration::from_secs(2);

    pub fn new(program: impl Into<PathBuf>, title: impl Into<String>, window: WindowConfig) -> Self {
        Self {
            program: program.into(),
            title: title.into(),
            window,
            init_window: Self::DEFAULT_INIT_WINDOW,
        }
    }

    /// A failing exit within this window counts as "shell failed to initialize".
    pub fn with_init_window(mut self, init_window: Duration) -> Self {
        self.init_window = init_window;
        self
    }

    /// Configured shell, else `heartmula-shell` beside the launcher binary.
    pub fn resolve_program(window: &WindowConfig) -> PathBuf {
        if let Some(program) = &window.shell_program {
            return program.clone();
        }
        let name = if cfg!(windows) {
            "heartmula-shell.exe"
        } else {
            "heartmula-shell"
        };
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    fn args(&self, url: &Url) -> Vec<String> {
        let w = &self.window;
        let mut args = vec![
            "--url".to_string(),
            url.to_string(),
            "--title".to_string(),
            self.title.clone(),
            "--width".to_string(),
            w.width.to_string(),
            "--height".to_string(),
            w.height.to_string(),
            "--min-width".to_string(),
            w.min_width.to_string(),
            "--min-height".to_string(),
            w.min_height.to_string(),
            "--background".to_string(),
            w.background_color.clone(),
        ];
        if w.resizable {
            args.push("--resizable".to_string());
        }
        if w.fullscreen {
            args.push("--fullscreen".to_string());
        }
        if w.text_select {
            args.push("--text-select".to_string());
        }
        args
    }
}

#[async_trait]
impl PresentationStrategy for ShellWindow {
    fn name(&self) -> &str {
        "shell window"
    }

    async fn present(&self, url: &Url) -> Result<Presentation> {
        info!("Opening {} window", self.title);
        let mut child = tokio::process::Command::new(&self.program)
            .args(self.args(url))
            .stdin(Stdio::null())
            // Abandoning the presentation (interrupt) takes the window down too.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LauncherError::Presentation(format!("{}: {}", self.program.display(), e))
            })?;

        match tokio::time::timeout(self.init_window, child.wait()).await {
            Ok(Ok(status)) if !status.success() => Err(LauncherError::Presentation(format!(
                "shell exited during startup ({})",
                status
            ))),
            Ok(Ok(_)) => Ok(Presentation::Closed),
            Ok(Err(e)) => Err(LauncherError::Presentation(format!(
                "cannot wait on shell: {}",
                e
            ))),
            Err(_) => {
                // Past initialization: any exit is the window closing.
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        warn!("Shell window exited with {}", status)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Lost track of shell window: {}", e),
                }
                Ok(Presentation::Closed)
            }
        }
    }
}

/// Opens the URL with the platform's default browser.
pub struct SystemBrowser {
    program: PathBuf,
    args: Vec<String>,
}

impl SystemBrowser {
    pub fn platform_default() -> Self {
        #[cfg(target_os = "macos")]
        {
            Self::with_opener("open", Vec::new())
        }

        #[cfg(target_os = "windows")]
        {
            Self::with_opener("cmd", vec!["/C".into(), "start".into(), "".into()])
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            Self::with_opener("xdg-open", Vec::new())
        }
    }

    /// `program args... <url>`
    pub fn with_opener(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PresentationStrategy for SystemBrowser {
    fn name(&self) -> &str {
        "system browser"
    }

    async fn present(&self, url: &Url) -> Result<Presentation> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                LauncherError::Presentation(format!("{}: {}", self.program.display(), e))
            })?;
        if !status.success() {
            return Err(LauncherError::Presentation(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )));
        }
        info!("Opened {} in the default browser", url);
        Ok(Presentation::Detached)
    }
}

/// Terminal state when no window owns the session.
pub struct KeepAlive {
    tick: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

impl KeepAlive {
    pub fn with_tick(tick: Duration) -> Self {
        Self { tick }
    }

    /// Never returns; only an interrupt ends it.
    pub async fn hold(&self) -> Infallible {
        info!("Keeping the service alive; press Ctrl-C to quit");
        loop {
            tokio::time::sleep(self.tick).await;
        }
    }
}

/// Ordered list of strategies ending in [`KeepAlive`].
pub struct PresentationChain {
    strategies: Vec<Box<dyn PresentationStrategy>>,
    keep_alive: KeepAlive,
}

impl PresentationChain {
    pub fn new(strategies: Vec<Box<dyn PresentationStrategy>>) -> Self {
        Self {
            strategies,
            keep_alive: KeepAlive::default(),
        }
    }

    /// Shell window first, then the browser.
    pub fn standard(title: &str, window: &WindowConfig) -> Self {
        let shell = ShellWindow::new(ShellWindow::resolve_program(window), title, window.clone());
        Self::new(vec![
            Box::new(shell),
            Box::new(SystemBrowser::platform_default()),
        ])
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns only when a window was closed; otherwise holds forever.
    pub async fn present(&self, url: &Url) {
        for strategy in &self.strategies {
            match strategy.present(url).await {
                Ok(Presentation::Closed) => return,
                Ok(Presentation::Detached) => break,
                Err(e) => warn!("{} failed, trying next: {}", strategy.name(), e),
            }
        }
        self.keep_alive.hold().await;
    }
}
