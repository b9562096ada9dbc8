//! Browser Launcher - find a binary, start it, learn its DevTools endpoint
//!
//! Binary resolution order:
//! 1. explicit override (`LaunchConfig::binary`, then `$CHROME_PATH`)
//! 2. known install locations for the current OS, resolved through `PATH`
//! 3. on-demand bootstrap into the user cache directory
//!
//! The browser is started with `--remote-debugging-port=0`; Chrome picks a
//! port and prints `DevTools listening on ws://...` on stderr, which is the
//! only startup signal we wait for.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::LaunchError;
use crate::util::duration_ms;

/// Environment variable that overrides binary discovery
pub const BROWSER_PATH_ENV: &str = "CHROME_PATH";

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";
const STDERR_TAIL: usize = 20;

/// Executable names left behind by the bootstrap installer
const BOOTSTRAP_EXECUTABLES: &[&str] = &["chrome", "chrome.exe", "Google Chrome for Testing"];

/// How to launch the browser
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    /// Pause before every page operation, for watching headed runs
    #[serde(with = "duration_ms")]
    pub slow_motion: Duration,
    /// Log CDP traffic and browser stderr
    pub debug: bool,
    pub binary: Option<PathBuf>,
    /// Profile directory; a throwaway one is created when unset
    pub user_data_dir: Option<PathBuf>,
    pub no_sandbox: bool,
    pub extra_args: Vec<String>,
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Allow downloading a browser when none is installed
    pub allow_bootstrap: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1280,
            window_height: 720,
            slow_motion: Duration::ZERO,
            debug: false,
            binary: None,
            user_data_dir: None,
            no_sandbox: false,
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            allow_bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    Override,
    Candidate,
    Bootstrap,
}

#[derive(Debug, Clone)]
pub struct LocatedBinary {
    pub path: PathBuf,
    pub source: BinarySource,
}

/// Resolve an installed browser without downloading anything
pub fn locate_browser(config: &LaunchConfig) -> Option<LocatedBinary> {
    let env_override = std::env::var_os(BROWSER_PATH_ENV).map(PathBuf::from);
    locate_in(config, env_override, candidates())
}

fn locate_in(config: &LaunchConfig, env_override: Option<PathBuf>, candidates: &[&str]) -> Option<LocatedBinary> {
    if let Some(path) = config.binary.clone().or(env_override) {
        match resolve(&path) {
            Some(path) => {
                return Some(LocatedBinary {
                    path,
                    source: BinarySource::Override,
                })
            }
            None => warn!(
                path = %path.display(),
                "browser override does not exist, searching known locations"
            ),
        }
    }

    candidates
        .iter()
        .find_map(|candidate| resolve(Path::new(candidate)))
        .map(|path| LocatedBinary {
            path,
            source: BinarySource::Candidate,
        })
}

/// The process-level steps of a launch
#[async_trait]
pub trait BinarySteps: Send + Sync {
    type Process: Send;

    fn locate(&self, config: &LaunchConfig) -> Option<LocatedBinary>;

    /// Download a browser, or reuse one downloaded earlier
    async fn fetch(&self) -> Result<PathBuf, LaunchError>;

    async fn spawn(&self, binary: &Path, config: &LaunchConfig) -> Result<Self::Process, LaunchError>;
}

/// Installed browsers, the bootstrap cache and real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemBinaries {
    fetcher: BrowserFetcher,
}

impl SystemBinaries {
    pub fn new(fetcher: BrowserFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl BinarySteps for SystemBinaries {
    type Process = BrowserProcess;

    fn locate(&self, config: &LaunchConfig) -> Option<LocatedBinary> {
        locate_browser(config)
    }

    async fn fetch(&self) -> Result<PathBuf, LaunchError> {
        self.fetcher.fetch().await
    }

    async fn spawn(&self, binary: &Path, config: &LaunchConfig) -> Result<BrowserProcess, LaunchError> {
        spawn_browser(binary, config).await
    }
}

/// Start a browser process. A located binary that fails to start is
/// replaced by a bootstrapped one, once, unless the failure is missing
/// system libraries or bootstrap is disabled.
pub async fn start_browser<S: BinarySteps>(steps: &S, config: &LaunchConfig) -> Result<S::Process, LaunchError> {
    let Some(located) = steps.locate(config) else {
        if !config.allow_bootstrap {
            return Err(LaunchError::NoBinary);
        }
        let path = steps.fetch().await?;
        return steps.spawn(&path, config).await;
    };

    match steps.spawn(&located.path, config).await {
        Ok(process) => Ok(process),
        // Another binary would hit the same missing libraries
        Err(e) if e.is_missing_dependencies() || !config.allow_bootstrap => Err(e),
        Err(e) => {
            warn!(
                path = %located.path.display(),
                error = %e,
                "browser failed to start, falling back to bootstrapped binary"
            );
            match steps.fetch().await {
                Ok(path) => steps.spawn(&path, config).await,
                Err(fetch_err) => {
                    warn!("bootstrap fallback unavailable: {}", fetch_err);
                    Err(e)
                }
            }
        }
    }
}

fn resolve(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    // Bare names go through PATH
    if candidate.components().count() == 1 {
        return which::which(candidate).ok();
    }
    None
}

fn candidates() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ]
    } else {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/snap/bin/chromium",
        ]
    }
}

/// Downloads Chrome for Testing on demand through `@puppeteer/browsers`
#[derive(Debug, Clone)]
pub struct BrowserFetcher {
    install_dir: PathBuf,
    channel: String,
    timeout: Duration,
}

impl BrowserFetcher {
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            install_dir,
            channel: "stable".to_string(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("browser-pilot")
            .join("chrome")
    }

    /// A previously bootstrapped binary, if any
    pub fn installed(&self) -> Option<PathBuf> {
        find_executable(&self.install_dir, 6)
    }

    pub async fn fetch(&self) -> Result<PathBuf, LaunchError> {
        if let Some(path) = self.installed() {
            debug!(path = %path.display(), "using bootstrapped browser");
            return Ok(path);
        }

        let npx = which::which("npx").map_err(|_| {
            LaunchError::Bootstrap("npx not found; install Node.js or set CHROME_PATH".to_string())
        })?;

        info!(
            dir = %self.install_dir.display(),
            channel = %self.channel,
            "no browser installed, downloading one"
        );

        let install = Command::new(npx)
            .args(["--yes", "@puppeteer/browsers", "install"])
            .arg(format!("chrome@{}", self.channel))
            .arg("--path")
            .arg(&self.install_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, install)
            .await
            .map_err(|_| LaunchError::Bootstrap(format!("download timed out after {:?}", self.timeout)))?
            .map_err(|e| LaunchError::Bootstrap(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LaunchError::Bootstrap(format!(
                "installer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_install_output(&String::from_utf8_lossy(&output.stdout))
            .filter(|path| path.is_file())
            .or_else(|| self.installed())
            .ok_or_else(|| {
                LaunchError::Bootstrap("installer did not report a browser path".to_string())
            })
    }
}

impl Default for BrowserFetcher {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

/// The installer prints `chrome@<version> <path>` as its last line
fn parse_install_output(stdout: &str) -> Option<PathBuf> {
    stdout.lines().rev().find_map(|line| {
        let (_, path) = line.trim().split_once(' ')?;
        let path = path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    })
}

fn find_executable(dir: &Path, depth: usize) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if entry
            .file_name()
            .to_str()
            .is_some_and(|name| BOOTSTRAP_EXECUTABLES.contains(&name))
        {
            return Some(path);
        }
    }
    if depth == 0 {
        return None;
    }
    subdirs
        .iter()
        .find_map(|sub| find_executable(sub, depth - 1))
}

/// Command line for a Chromium-family browser
pub fn chrome_args(config: &LaunchConfig, user_data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--remote-debugging-port=0".to_string(),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        format!("--window-size={},{}", config.window_width, config.window_height),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    if config.no_sandbox {
        args.push("--no-sandbox".to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

fn parse_devtools_line(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(DEVTOOLS_PREFIX)
        .filter(|url| url.starts_with("ws://"))
}

fn is_missing_library(line: &str) -> bool {
    line.contains("error while loading shared libraries")
        || line.contains("cannot open shared object file")
}

/// A spawned browser process we own
pub struct BrowserProcess {
    child: Mutex<Child>,
    pid: Option<u32>,
    ws_url: String,
    user_data_dir: PathBuf,
    owns_data_dir: bool,
}

impl BrowserProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Kill the process and remove the throwaway profile
    pub async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!("browser kill failed (probably already gone): {}", e);
        }
        if self.owns_data_dir {
            if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
                debug!(dir = %self.user_data_dir.display(), "profile cleanup failed: {}", e);
            }
        }
    }
}

/// Start `binary` and wait for its DevTools endpoint
pub async fn spawn_browser(binary: &Path, config: &LaunchConfig) -> Result<BrowserProcess, LaunchError> {
    let (user_data_dir, owns_data_dir) = match &config.user_data_dir {
        Some(dir) => (dir.clone(), false),
        None => (
            std::env::temp_dir().join(format!("browser-pilot-{}", Uuid::now_v7().simple())),
            true,
        ),
    };
    std::fs::create_dir_all(&user_data_dir).map_err(|source| LaunchError::Spawn {
        path: user_data_dir.display().to_string(),
        source,
    })?;

    info!(
        binary = %binary.display(),
        headless = config.headless,
        "launching browser"
    );

    let mut child = Command::new(binary)
        .args(chrome_args(config, &user_data_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            path: binary.display().to_string(),
            source,
        })?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| LaunchError::Exited("stderr was not captured".to_string()))?;
    let mut lines = BufReader::new(stderr).lines();

    let wait_for_endpoint = async {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| LaunchError::Exited(e.to_string()))?
        {
            if let Some(url) = parse_devtools_line(&line) {
                return Ok(url.to_string());
            }
            if is_missing_library(&line) {
                return Err(LaunchError::MissingDependencies(line.trim().to_string()));
            }
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        let output: Vec<String> = tail.into_iter().collect();
        Err(LaunchError::Exited(if output.is_empty() {
            "no output".to_string()
        } else {
            output.join("; ")
        }))
    };

    let outcome = match tokio::time::timeout(config.startup_timeout, wait_for_endpoint).await {
        Ok(result) => result,
        Err(_) => Err(LaunchError::StartupTimeout(config.startup_timeout)),
    };

    let ws_url = match outcome {
        Ok(url) => url,
        Err(e) => {
            let _ = child.kill().await;
            if owns_data_dir {
                let _ = tokio::fs::remove_dir_all(&user_data_dir).await;
            }
            return Err(e);
        }
    };

    // Keep draining stderr so the browser never blocks on a full pipe
    let verbose = config.debug;
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if verbose {
                debug!(target: "browser_stderr", "{}", line);
            } else {
                trace!(target: "browser_stderr", "{}", line);
            }
        }
    });

    let pid = child.id();
    info!(pid = ?pid, endpoint = %ws_url, "browser is listening");

    Ok(BrowserProcess {
        child: Mutex::new(child),
        pid,
        ws_url,
        user_data_dir,
        owns_data_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devtools_line() {
        assert_eq!(
            parse_devtools_line("DevTools listening on ws://127.0.0.1:41255/devtools/browser/ab-cd\n"),
            Some("ws://127.0.0.1:41255/devtools/browser/ab-cd")
        );
        assert_eq!(parse_devtools_line("[0101/000000.000:ERROR] something"), None);
    }

    #[test]
    fn test_missing_library_detection() {
        assert!(is_missing_library(
            "chrome: error while loading shared libraries: libnss3.so: cannot open shared object file"
        ));
        assert!(!is_missing_library("Fontconfig error: No writable cache directories"));
    }

    #[test]
    fn test_chrome_args_follow_config() {
        let config = LaunchConfig {
            headless: false,
            window_width: 800,
            window_height: 600,
            no_sandbox: true,
            extra_args: vec!["--lang=en-US".to_string()],
            ..LaunchConfig::default()
        };
        let args = chrome_args(&config, Path::new("/tmp/profile"));
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_install_output_parsing() {
        let stdout = "Downloading...\nchrome@131.0.6778.85 /home/u/.cache/browser-pilot/chrome/chrome/linux-131/chrome-linux64/chrome\n";
        assert_eq!(
            parse_install_output(stdout),
            Some(PathBuf::from(
                "/home/u/.cache/browser-pilot/chrome/chrome/linux-131/chrome-linux64/chrome"
            ))
        );
        assert_eq!(parse_install_output(""), None);
    }

    #[test]
    fn test_override_binary_wins() {
        let dir = std::env::temp_dir().join(format!("locate-{}", Uuid::now_v7().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        let fake = dir.join("my-chrome");
        std::fs::write(&fake, b"").unwrap();

        let config = LaunchConfig {
            binary: Some(fake.clone()),
            ..LaunchConfig::default()
        };
        let located = locate_browser(&config).unwrap();
        assert_eq!(located.path, fake);
        assert_eq!(located.source, BinarySource::Override);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_lookup_order() {
        let dir = std::env::temp_dir().join(format!("order-{}", Uuid::now_v7().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        let configured = dir.join("configured");
        let from_env = dir.join("from-env");
        let installed = dir.join("installed");
        for path in [&configured, &from_env, &installed] {
            std::fs::write(path, b"").unwrap();
        }
        let missing = dir.join("missing");
        let installed_str = installed.to_str().unwrap();
        let candidates = [missing.to_str().unwrap(), installed_str];

        let with_binary = LaunchConfig {
            binary: Some(configured.clone()),
            ..LaunchConfig::default()
        };
        let located = locate_in(&with_binary, Some(from_env.clone()), &candidates).unwrap();
        assert_eq!((located.path, located.source), (configured, BinarySource::Override));

        let located = locate_in(&LaunchConfig::default(), Some(from_env.clone()), &candidates).unwrap();
        assert_eq!((located.path, located.source), (from_env, BinarySource::Override));

        // A stale override falls through to the install locations
        let located = locate_in(&LaunchConfig::default(), Some(missing.clone()), &candidates).unwrap();
        assert_eq!((located.path, located.source), (installed.clone(), BinarySource::Candidate));

        let stale = LaunchConfig {
            binary: Some(missing.clone()),
            ..LaunchConfig::default()
        };
        assert!(locate_in(&stale, None, &[missing.to_str().unwrap()]).is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    /// Scripted launch steps; a "process" is the path it was spawned from
    #[derive(Default)]
    struct Steps {
        located: Option<PathBuf>,
        fetched: Option<PathBuf>,
        /// Spawn outcome per binary, consumed in order; unlisted binaries start
        spawn_failures: std::sync::Mutex<Vec<(PathBuf, LaunchError)>>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl Steps {
        fn installed(path: &str) -> Self {
            Self {
                located: Some(PathBuf::from(path)),
                fetched: Some(PathBuf::from("/cache/chrome")),
                ..Self::default()
            }
        }

        fn failing(self, path: &str, error: LaunchError) -> Self {
            self.spawn_failures.lock().unwrap().push((PathBuf::from(path), error));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BinarySteps for Steps {
        type Process = PathBuf;

        fn locate(&self, _config: &LaunchConfig) -> Option<LocatedBinary> {
            self.located.clone().map(|path| LocatedBinary {
                path,
                source: BinarySource::Candidate,
            })
        }

        async fn fetch(&self) -> Result<PathBuf, LaunchError> {
            self.calls.lock().unwrap().push("fetch".to_string());
            self.fetched
                .clone()
                .ok_or_else(|| LaunchError::Bootstrap("offline".to_string()))
        }

        async fn spawn(&self, binary: &Path, _config: &LaunchConfig) -> Result<PathBuf, LaunchError> {
            self.calls.lock().unwrap().push(format!("spawn {}", binary.display()));
            let mut failures = self.spawn_failures.lock().unwrap();
            match failures.iter().position(|(path, _)| path == binary) {
                Some(index) => Err(failures.remove(index).1),
                None => Ok(binary.to_path_buf()),
            }
        }
    }

    fn exited() -> LaunchError {
        LaunchError::Exited("crashed".to_string())
    }

    #[tokio::test]
    async fn test_installed_binary_used_first() {
        let steps = Steps::installed("/usr/bin/chromium");
        let started = start_browser(&steps, &LaunchConfig::default()).await.unwrap();
        assert_eq!(started, PathBuf::from("/usr/bin/chromium"));
        assert_eq!(steps.calls(), ["spawn /usr/bin/chromium"]);
    }

    #[tokio::test]
    async fn test_failed_start_falls_back_to_bootstrap_once() {
        let steps = Steps::installed("/usr/bin/chromium").failing("/usr/bin/chromium", exited());
        let started = start_browser(&steps, &LaunchConfig::default()).await.unwrap();
        assert_eq!(started, PathBuf::from("/cache/chrome"));
        assert_eq!(steps.calls(), ["spawn /usr/bin/chromium", "fetch", "spawn /cache/chrome"]);

        // The bootstrapped binary failing too ends the launch
        let steps = Steps::installed("/usr/bin/chromium")
            .failing("/usr/bin/chromium", exited())
            .failing("/cache/chrome", LaunchError::StartupTimeout(Duration::from_secs(30)));
        let outcome = start_browser(&steps, &LaunchConfig::default()).await;
        assert!(matches!(outcome, Err(LaunchError::StartupTimeout(_))));
        assert_eq!(steps.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_libraries_do_not_fall_back() {
        let steps = Steps::installed("/usr/bin/chromium").failing(
            "/usr/bin/chromium",
            LaunchError::MissingDependencies("libnss3.so".to_string()),
        );
        let outcome = start_browser(&steps, &LaunchConfig::default()).await;
        assert!(matches!(outcome, Err(LaunchError::MissingDependencies(_))));
        assert_eq!(steps.calls(), ["spawn /usr/bin/chromium"]);
    }

    #[tokio::test]
    async fn test_bootstrap_disabled() {
        let config = LaunchConfig {
            allow_bootstrap: false,
            ..LaunchConfig::default()
        };

        let steps = Steps::installed("/usr/bin/chromium").failing("/usr/bin/chromium", exited());
        assert!(matches!(
            start_browser(&steps, &config).await,
            Err(LaunchError::Exited(_))
        ));
        assert_eq!(steps.calls(), ["spawn /usr/bin/chromium"]);

        let nothing_installed = Steps::default();
        assert!(matches!(
            start_browser(&nothing_installed, &config).await,
            Err(LaunchError::NoBinary)
        ));
        assert!(nothing_installed.calls().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_installed_bootstraps() {
        let steps = Steps {
            fetched: Some(PathBuf::from("/cache/chrome")),
            ..Steps::default()
        };
        let started = start_browser(&steps, &LaunchConfig::default()).await.unwrap();
        assert_eq!(started, PathBuf::from("/cache/chrome"));
        assert_eq!(steps.calls(), ["fetch", "spawn /cache/chrome"]);

        // A failed download keeps the original start error
        let steps = Steps::installed("/usr/bin/chromium").failing("/usr/bin/chromium", exited());
        let steps = Steps { fetched: None, ..steps };
        assert!(matches!(
            start_browser(&steps, &LaunchConfig::default()).await,
            Err(LaunchError::Exited(_))
        ));
    }

    #[test]
    fn test_bootstrap_cache_lookup() {
        let dir = std::env::temp_dir().join(format!("fetcher-{}", Uuid::now_v7().simple()));
        let nested = dir.join("chrome").join("linux-131").join("chrome-linux64");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("chrome"), b"").unwrap();

        let fetcher = BrowserFetcher::new(dir.clone());
        assert_eq!(fetcher.installed(), Some(nested.join("chrome")));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
