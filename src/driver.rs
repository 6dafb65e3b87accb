//! chromedriver process lifecycle.
//!
//! Ensures only one chromedriver runs at a time, shared across all sessions.
//!
//! # Architecture
//!
//! Uses a process-wide `OnceLock<Arc<ChromeDriver>>` singleton holding a
//! `tokio::sync::Mutex<Option<Child>>`:
//! - Thread-safe lazy initialization via the `OnceLock`
//! - `start()` is idempotent while the process is alive
//! - Shared access from any number of `ChromeSession` instances
//! - `stop()` kills and reaps the child
//!
//! # Async Lock Requirements
//!
//! Must use `tokio::sync::Mutex` here: starting the driver awaits both the
//! spawned process and the readiness probe, so a sync lock cannot be held
//! across those points.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CrawlerError, Result};

/// Port chromedriver listens on. Not configurable; sessions are always
/// created against [`DRIVER_ENDPOINT`].
pub const DRIVER_PORT: u16 = 9515;

/// Host chromedriver is reached on. The readiness probe resolves the same
/// name the sessions do, so both sides agree on the address family when
/// `localhost` maps to `::1` only.
const DRIVER_HOST: &str = "localhost";

/// WebDriver endpoint served by the managed chromedriver process. Must stay
/// in sync with [`DRIVER_HOST`] and [`DRIVER_PORT`].
pub const DRIVER_ENDPOINT: &str = "http://localhost:9515";

/// How long `start()` waits for chromedriver to accept TCP connections.
const READINESS_WINDOW: Duration = Duration::from_secs(5);

/// Interval between readiness probes.
const READINESS_POLL: Duration = Duration::from_millis(100);

// Global singleton instance
static GLOBAL_DRIVER: OnceLock<Arc<ChromeDriver>> = OnceLock::new();

/// Driver process lifecycle as seen by a session.
///
/// `ChromeDriver` is the production implementation; tests substitute fakes
/// to observe start/stop ordering without spawning a real process.
#[async_trait]
pub trait DriverLifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Process-wide manager for the local chromedriver process.
///
/// Sessions share one driver process: `start()` before any session is
/// created, `stop()` only after the sessions using it are closed. The
/// split between this process-level lifecycle and per-session creation
/// lives in [`crate::ChromeSession`].
pub struct ChromeDriver {
    child: Mutex<Option<Child>>,
}

impl ChromeDriver {
    /// Get the global singleton `ChromeDriver` instance.
    ///
    /// This ensures only one chromedriver process runs process-wide.
    /// Sessions should use this rather than constructing their own manager.
    #[must_use]
    pub fn global() -> Arc<ChromeDriver> {
        GLOBAL_DRIVER
            .get_or_init(|| Arc::new(ChromeDriver::new()))
            .clone()
    }

    fn new() -> Self {
        Self {
            child: Mutex::new(None),
        }
    }

    /// Start chromedriver on [`DRIVER_PORT`] if it is not already running.
    ///
    /// Locates the binary, spawns it with stdio discarded, then polls the
    /// port until it accepts a connection. A process that never becomes
    /// ready is killed before the error is returned.
    ///
    /// # Errors
    /// [`CrawlerError::DriverNotFound`] if no executable could be located,
    /// [`CrawlerError::DriverSpawn`] if the spawn itself failed, and
    /// [`CrawlerError::DriverUnavailable`] if the port never opened.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            debug!("chromedriver already running, start is a no-op");
            return Ok(());
        }

        let path = find_chromedriver()?;
        info!(path = %path.display(), port = DRIVER_PORT, "starting chromedriver");

        let mut child = Command::new(&path)
            .arg(format!("--port={DRIVER_PORT}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(CrawlerError::DriverSpawn)?;

        if let Err(e) = wait_until_ready(DRIVER_HOST, DRIVER_PORT, READINESS_WINDOW).await {
            warn!(port = DRIVER_PORT, "chromedriver never became ready, killing it");
            let _ = child.kill().await;
            return Err(e);
        }

        *guard = Some(child);
        Ok(())
    }

    /// Stop chromedriver if it is running.
    ///
    /// Kills and reaps the child. A no-op when nothing was started.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            info!("stopping chromedriver");
            child.kill().await.map_err(CrawlerError::DriverStop)?;
            let _ = child.wait().await;
        }
        Ok(())
    }

    /// Whether a chromedriver child is currently held by this manager.
    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }
}

#[async_trait]
impl DriverLifecycle for ChromeDriver {
    async fn start(&self) -> Result<()> {
        ChromeDriver::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        ChromeDriver::stop(self).await
    }
}

/// Find the chromedriver executable with platform-specific search paths.
pub fn find_chromedriver() -> Result<PathBuf> {
    // Environment variable overrides all other methods
    if let Ok(path) = std::env::var("CHROMEDRIVER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!(
                "using chromedriver from CHROMEDRIVER_PATH environment variable: {}",
                path.display()
            );
            return Ok(path);
        }
        warn!(
            "CHROMEDRIVER_PATH environment variable points to non-existent file: {}",
            path.display()
        );
    }

    // Common chromedriver installation paths by platform
    let paths = if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chromedriver.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chromedriver.exe",
            r"C:\tools\chromedriver\chromedriver.exe",
        ]
    } else if cfg!(target_os = "macos") {
        vec![
            "/opt/homebrew/bin/chromedriver",
            "/usr/local/bin/chromedriver",
        ]
    } else {
        // Linux
        vec![
            "/usr/bin/chromedriver",
            "/usr/local/bin/chromedriver",
            "/usr/lib/chromium-browser/chromedriver",
            "/usr/lib/chromium/chromedriver",
            "/snap/bin/chromium.chromedriver",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("found chromedriver at: {}", path.display());
            return Ok(path);
        }
    }

    // Use 'which' to find chromedriver on Unix systems
    if !cfg!(target_os = "windows") {
        let output = std::process::Command::new("which")
            .arg("chromedriver")
            .output();

        if let Ok(output) = output
            && output.status.success()
        {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                let path = PathBuf::from(path_str);
                info!("found chromedriver using 'which': {}", path.display());
                return Ok(path);
            }
        }
    }

    warn!("no chromedriver executable found");
    Err(CrawlerError::DriverNotFound)
}

/// Poll `host:port` until it accepts a TCP connection or the window elapses.
///
/// `host` is a name, not an address: it goes through the same resolution the
/// WebDriver client performs against [`DRIVER_ENDPOINT`].
async fn wait_until_ready(host: &str, port: u16, window: Duration) -> Result<()> {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if TcpStream::connect((host, port)).await.is_ok() {
            debug!(host, port, "chromedriver is accepting connections");
            return Ok(());
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
    Err(CrawlerError::DriverUnavailable { timeout: window })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_probe_times_out_on_closed_port() {
        // Port 1 is privileged and refuses connections on any sane host.
        let err = wait_until_ready(DRIVER_HOST, 1, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlerError::DriverUnavailable { .. }));
    }

    #[tokio::test]
    async fn readiness_probe_resolves_the_session_host() {
        // Bind on the same host name the sessions dial, so the probe and the
        // WebDriver client agree on the address family even where localhost
        // is v6-only.
        let listener = tokio::net::TcpListener::bind((DRIVER_HOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_until_ready(DRIVER_HOST, port, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn env_override_wins_when_the_file_exists() {
        // find_chromedriver is the only reader of CHROMEDRIVER_PATH, and any
        // test mutating the process environment must hold this lock so the
        // mutation cannot race another discovery call.
        static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let _env = ENV_LOCK.lock().unwrap();

        let stub = std::env::temp_dir().join("chromedriver-env-stub");
        std::fs::write(&stub, b"").unwrap();
        // SAFETY: serialized by ENV_LOCK above; restored before the lock is
        // released.
        unsafe { std::env::set_var("CHROMEDRIVER_PATH", &stub) };
        let found = find_chromedriver().unwrap();
        unsafe { std::env::remove_var("CHROMEDRIVER_PATH") };
        assert_eq!(found, stub);
        let _ = std::fs::remove_file(&stub);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let driver = ChromeDriver::new();
        assert!(!driver.is_running().await);
        driver.stop().await.unwrap();
        assert!(!driver.is_running().await);
    }
}
