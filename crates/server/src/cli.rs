//! Command-line interface

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use server::{Config, Result};

#[derive(Debug, Parser)]
#[command(name = "browser-pilot")]
#[command(version, about = "Supervised browser automation over JSON-RPC")]
pub struct Cli {
    /// JSON config file; flags below override it
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Dial a client at HOST:PORT instead of serving stdio
    #[arg(long, value_name = "HOST:PORT")]
    pub connect: Option<String>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    #[arg(long, value_name = "PX")]
    pub window_width: Option<u32>,

    #[arg(long, value_name = "PX")]
    pub window_height: Option<u32>,

    /// Pause before every page operation
    #[arg(long, value_name = "MS")]
    pub slow_motion: Option<u64>,

    /// Verbose browser output and protocol traffic
    #[arg(long)]
    pub debug: bool,

    /// Browser executable
    #[arg(long, env = "CHROME_PATH", value_name = "PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Profile directory; a fresh temporary one when unset
    #[arg(long, value_name = "DIR")]
    pub user_data_dir: Option<PathBuf>,

    #[arg(long)]
    pub no_sandbox: bool,

    /// Never download a browser when none is installed
    #[arg(long)]
    pub no_bootstrap: bool,

    /// Skip the HEAD check before navigating
    #[arg(long)]
    pub no_reachability_check: bool,

    /// Limit on a single tool call
    #[arg(long, value_name = "SECS")]
    pub tool_timeout: Option<u64>,

    /// Log filter, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut Config) {
        let launch = &mut config.supervisor.launch;
        if self.headed {
            launch.headless = false;
        }
        if let Some(width) = self.window_width {
            launch.window_width = width;
        }
        if let Some(height) = self.window_height {
            launch.window_height = height;
        }
        if let Some(ms) = self.slow_motion {
            launch.slow_motion = Duration::from_millis(ms);
        }
        if self.debug {
            launch.debug = true;
        }
        if let Some(path) = &self.chrome_path {
            launch.binary = Some(path.clone());
        }
        if let Some(dir) = &self.user_data_dir {
            launch.user_data_dir = Some(dir.clone());
        }
        if self.no_sandbox {
            launch.no_sandbox = true;
        }
        if self.no_bootstrap {
            launch.allow_bootstrap = false;
        }
        if self.no_reachability_check {
            config.supervisor.check_reachability = false;
        }
        if let Some(secs) = self.tool_timeout {
            config.server.tool_timeout = Duration::from_secs(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "browser-pilot",
            "--headed",
            "--window-width",
            "1920",
            "--slow-motion",
            "250",
            "--chrome-path",
            "/opt/chrome/chrome",
            "--no-reachability-check",
            "--tool-timeout",
            "45",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();

        let launch = &config.supervisor.launch;
        assert!(!launch.headless);
        assert_eq!(launch.window_width, 1920);
        assert_eq!(launch.window_height, 720);
        assert_eq!(launch.slow_motion, Duration::from_millis(250));
        assert_eq!(launch.binary, Some(PathBuf::from("/opt/chrome/chrome")));
        assert!(!config.supervisor.check_reachability);
        assert_eq!(config.server.tool_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_log_options() {
        let cli = Cli::try_parse_from(["browser-pilot", "--log-format", "json", "--log-level", "debug"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level, "debug");
        assert!(cli.connect.is_none());

        assert!(Cli::try_parse_from(["browser-pilot", "--log-format", "xml"]).is_err());
    }
}
