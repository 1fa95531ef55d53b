//! Browser discovery and launch.
//!
//! Two launch modes: a CDP-attached automation context for chatters, and a
//! detached native process for validation and monitoring windows. Launch
//! strategies are pluggable so a failing installed browser can fall back
//! to alternates without touching the calling code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use browserpool_cdp::{CdpClient, PageHandle};
use parking_lot::Mutex;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{translate_launch_error, PoolError};

/// Everything one launch attempt needs.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub admin: bool,
    pub proxy_url: Option<String>,
    pub user_agent: Option<String>,
}

/// One way of obtaining a running browser. Strategies are tried in order
/// until one produces a context.
#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(
        &self,
        opts: &LaunchOptions,
        config: &PoolConfig,
    ) -> Result<BrowserContext, PoolError>;
}

/// Launches whatever Chromium-family browser is installed locally.
pub struct InstalledBrowserStrategy;

#[async_trait]
impl LaunchStrategy for InstalledBrowserStrategy {
    fn name(&self) -> &'static str {
        "installed-browser"
    }

    async fn attempt(
        &self,
        opts: &LaunchOptions,
        config: &PoolConfig,
    ) -> Result<BrowserContext, PoolError> {
        let executable = resolve_executable()?;
        let port = pick_debug_port()?;
        release_profile_lock(&opts.profile_dir).await;

        let mut args = stealth_args(opts);
        args.push(format!("--remote-debugging-port={port}"));
        args.push("about:blank".to_string());

        let mut cmd = std::process::Command::new(&executable);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = tokio::process::Command::from(cmd)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| PoolError::Launch(format!("spawn {}: {e}", executable.display())))?;
        let pid = child.id();

        let endpoint = format!("http://127.0.0.1:{port}");
        match wait_until_ready(&endpoint, config.browser_ready_timeout()).await {
            Ok(()) => {}
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        }
        let client = match CdpClient::connect(&endpoint).await {
            Ok(client) => client,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e.into());
            }
        };

        info!(
            "Launched {} (pid {:?}) on port {} with profile {}",
            executable.display(),
            pid,
            port,
            opts.profile_dir.display()
        );
        Ok(BrowserContext {
            client,
            pid,
            port,
            profile_dir: opts.profile_dir.clone(),
            child: tokio::sync::Mutex::new(Some(child)),
        })
    }
}

/// Tries each strategy in order; the final failure is translated into a
/// user-facing message.
pub struct Launcher {
    strategies: Vec<Box<dyn LaunchStrategy>>,
    config: Arc<PoolConfig>,
}

impl Launcher {
    pub fn new(config: Arc<PoolConfig>) -> Self {
        Self {
            strategies: vec![Box::new(InstalledBrowserStrategy)],
            config,
        }
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn LaunchStrategy>>,
        config: Arc<PoolConfig>,
    ) -> Self {
        Self { strategies, config }
    }

    pub async fn launch(&self, opts: &LaunchOptions) -> Result<BrowserContext, PoolError> {
        let mut last_error = None;
        for strategy in &self.strategies {
            debug!("Launch attempt via strategy '{}'", strategy.name());
            match strategy.attempt(opts, &self.config).await {
                Ok(ctx) => return Ok(ctx),
                Err(e) => {
                    warn!("Strategy '{}' failed: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(PoolError::ExecutableNotFound) => Err(PoolError::ExecutableNotFound),
            Some(e) => Err(PoolError::Launch(
                translate_launch_error(&e.to_string()).to_string(),
            )),
            None => Err(PoolError::ExecutableNotFound),
        }
    }

    /// Spawn a detached, visible native browser window. The child is
    /// returned so a watcher task can reap it; the pool only tracks the
    /// PID.
    pub fn spawn_native(
        &self,
        profile_dir: &Path,
        url: &str,
        proxy_url: Option<&str>,
    ) -> Result<(Child, Option<i32>), PoolError> {
        let executable = resolve_executable()?;
        let opts = LaunchOptions {
            profile_dir: profile_dir.to_path_buf(),
            headless: false,
            admin: true,
            proxy_url: proxy_url.map(str::to_string),
            user_agent: None,
        };
        let mut args = stealth_args(&opts);
        args.push(url.to_string());

        let mut cmd = std::process::Command::new(&executable);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Detach from our process group so a pool shutdown signal does not
        // take the user's window down with it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = tokio::process::Command::from(cmd)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| spawn_failure(&executable, e))?;
        let pid = child.id().map(|p| p as i32);
        info!(
            "Opened native browser (pid {:?}) with profile {}",
            pid,
            profile_dir.display()
        );
        Ok((child, pid))
    }
}

/// A CDP-attached browser owned by the pool.
pub struct BrowserContext {
    client: CdpClient,
    pid: Option<u32>,
    port: u16,
    profile_dir: PathBuf,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl BrowserContext {
    pub fn client(&self) -> &CdpClient {
        &self.client
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Open page count; 0 when the browser is gone. Used as the liveness
    /// probe for session reuse.
    pub async fn page_count(&self) -> usize {
        self.client.page_count().await.unwrap_or(0)
    }

    pub async fn first_page(&self) -> Result<PageHandle, PoolError> {
        Ok(self.client.first_page().await?)
    }

    /// Graceful close: ask the browser to quit, wait up to `grace`, then
    /// kill the process.
    pub async fn close(&self, grace: Duration) {
        if let Err(e) = self.client.close_browser().await {
            debug!("Browser.close failed: {}", e);
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let waited = if grace.is_zero() {
                Err(())
            } else {
                tokio::time::timeout(grace, child.wait()).await.map_err(|_| ())
            };
            match waited {
                Ok(Ok(status)) => {
                    debug!("Browser exited with {}", status);
                    *guard = None;
                    return;
                }
                Ok(Err(e)) => debug!("Waiting for browser exit failed: {}", e),
                Err(()) => debug!("Browser did not exit within {:?}", grace),
            }
            if let Err(e) = child.start_kill() {
                debug!("Kill failed: {}", e);
            }
            let _ = child.wait().await;
            *guard = None;
        }
    }

    /// Hard kill without waiting. Only used during forced shutdown.
    pub fn force_kill(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

/// Chromium-style argument set. Keeps automation markers off and pushes
/// headless chatter windows off-screen as a second line of defense.
fn stealth_args(opts: &LaunchOptions) -> Vec<String> {
    let mut args = vec![
        format!("--user-data-dir={}", opts.profile_dir.display()),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
    ];
    if opts.admin {
        args.push("--window-size=1920,1080".to_string());
        args.push("--start-maximized".to_string());
        args.push("--disable-extensions".to_string());
        args.push("--disable-plugins".to_string());
    }
    if opts.headless {
        args.push("--headless=new".to_string());
        args.push("--window-position=-2000,-2000".to_string());
    }
    if let Some(ua) = &opts.user_agent {
        args.push(format!("--user-agent={ua}"));
    }
    if let Some(proxy) = &opts.proxy_url {
        args.push(format!("--proxy-server={proxy}"));
    }
    args
}

/// Raw spawn detail (executable path, errno text) stays in the logs; the
/// caller only sees the translated message, same as context launches.
fn spawn_failure(executable: &Path, e: std::io::Error) -> PoolError {
    warn!("Spawning {} failed: {}", executable.display(), e);
    PoolError::Launch(translate_launch_error(&e.to_string()).to_string())
}

static RESOLVED_EXECUTABLE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Find a Chromium-family executable: `CHROME_PATH` override first, then
/// well-known install locations, then `PATH`. The result is cached.
pub fn resolve_executable() -> Result<PathBuf, PoolError> {
    if let Some(path) = RESOLVED_EXECUTABLE.lock().clone() {
        return Ok(path);
    }
    let found = find_executable().ok_or(PoolError::ExecutableNotFound)?;
    *RESOLVED_EXECUTABLE.lock() = Some(found.clone());
    Ok(found)
}

fn find_executable() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
        warn!("CHROME_PATH is set but does not exist: {}", path.display());
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        ]
    } else if cfg!(windows) {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/bin/microsoft-edge",
        ]
    };
    for candidate in candidates {
        let path = Path::new(candidate);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
    }

    // PATH lookup as a last resort.
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in ["google-chrome", "chromium", "chromium-browser", "chrome"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Ask the OS for a free port. The tiny race between binding and the
/// browser claiming it is acceptable.
fn pick_debug_port() -> Result<u16, PoolError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Poll the debugging endpoint until the browser answers.
async fn wait_until_ready(endpoint: &str, timeout: Duration) -> Result<(), PoolError> {
    let url = format!("{endpoint}/json/version");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(resp) = reqwest::get(&url).await {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PoolError::Launch(format!(
                "browser did not answer on {url} within {timeout:?}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Break a stale `SingletonLock` left by a previous run. On unix the lock
/// is a symlink to `<hostname>-<pid>`; if that pid still runs we stop it
/// first, otherwise removing the link is enough.
pub async fn release_profile_lock(profile_dir: &Path) {
    let lock = profile_dir.join("SingletonLock");
    let Ok(meta) = tokio::fs::symlink_metadata(&lock).await else {
        return;
    };

    #[cfg(unix)]
    if meta.file_type().is_symlink() {
        if let Ok(target) = tokio::fs::read_link(&lock).await {
            let target = target.to_string_lossy().into_owned();
            if let Some(pid) = target
                .rsplit('-')
                .next()
                .and_then(|s| s.parse::<i32>().ok())
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
                    debug!("Stopped stale profile holder pid {}", pid);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                }
            }
        }
    }
    let _ = meta;

    if let Err(e) = tokio::fs::remove_file(&lock).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Could not remove {}: {}", lock.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_failure_is_sanitized() {
        let err = spawn_failure(
            Path::new("/usr/bin/google-chrome"),
            std::io::Error::from_raw_os_error(2),
        );
        let msg = err.user_message();
        assert!(!msg.contains("google-chrome"));
        assert!(!msg.contains("os error"));
        assert!(msg.contains("tente novamente") || msg.contains("navegador"));
    }

    #[test]
    fn test_stealth_args_chatter() {
        let opts = LaunchOptions {
            profile_dir: PathBuf::from("/tmp/p"),
            headless: true,
            admin: false,
            proxy_url: Some("http://proxy:8080".to_string()),
            user_agent: Some("UA/1.0".to_string()),
        };
        let args = stealth_args(&opts);
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--window-position=-2000,-2000".to_string()));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(args.contains(&"--proxy-server=http://proxy:8080".to_string()));
        assert!(args.contains(&"--user-agent=UA/1.0".to_string()));
        assert!(!args.iter().any(|a| a.contains("--enable-automation")));
        assert!(!args.contains(&"--start-maximized".to_string()));
    }

    #[test]
    fn test_stealth_args_admin() {
        let opts = LaunchOptions {
            profile_dir: PathBuf::from("/tmp/p"),
            headless: false,
            admin: true,
            proxy_url: None,
            user_agent: None,
        };
        let args = stealth_args(&opts);
        assert!(args.contains(&"--start-maximized".to_string()));
        assert!(args.contains(&"--window-size=1920,1080".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(!args.iter().any(|a| a.starts_with("--proxy-server")));
    }

    #[test]
    fn test_pick_debug_port() {
        let port = pick_debug_port().unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_release_lock_missing_dir_is_noop() {
        release_profile_lock(Path::new("/nonexistent/profile")).await;
    }

    #[tokio::test]
    async fn test_release_lock_removes_plain_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock = tmp.path().join("SingletonLock");
        tokio::fs::write(&lock, "").await.unwrap();
        release_profile_lock(tmp.path()).await;
        assert!(!lock.exists());
    }
}
