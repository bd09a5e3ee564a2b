//! Config for the match runner behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set them to `"true"` to enable.
//!
//! - `RUNNER_VERBOSE` — Print match progress on stdout (default: `true`)
//! - `RUNNER_LOG` — Enable logging to a file (default: `false`)
//! - `RUNNER_LOG_LEVEL` — `trace`, `debug`, `info`, `warn` or `error` (default: `info`)
//! - `RUNNER_PROXY_HOST` — Host the proxy listens on (default: `127.0.0.1`)
//! - `RUNNER_PROXY_COMMAND` — Whitespace separated proxy command line, `{address}` is
//!   replaced by `host:port` (default: `sc2-proxy --address {address}`)
//! - `RUNNER_REPLAYS_DIRECTORY` — Where replays are written (default: `replays`)
//! - `RUNNER_BOT_ACK_TIMEOUT_SECS` — How long a bot may take to join the proxy (default: `400`)
//! - `RUNNER_CONNECT_INTERVAL_MS` — Delay before each proxy connection attempt (default: `1000`)
//! - `RUNNER_CONCURRENCY` — Matches run at the same time (default: half the physical cores)
//! - `RUNNER_PYTHON`, `RUNNER_WINE`, `RUNNER_DOTNET`, `RUNNER_JAVA` — Launchers used for
//!   interpreted, Windows, .NET and Java bots

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use tracing::Level;

/// Programs prepended to the bot command line, per runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launchers {
    /// Interpreter used for `run.py` bots.
    pub python: String,
    /// Windows compatibility layer used for `.exe` bots on Linux.
    pub wine: String,
    /// Runtime used for `.dll` bots.
    pub dotnet: String,
    /// Runtime used for `.jar` bots.
    pub java: String,
}

impl Default for Launchers {
    fn default() -> Self {
        Self {
            python: if cfg!(windows) { "python" } else { "python3" }.to_string(),
            wine: "wine".to_string(),
            dotnet: "dotnet".to_string(),
            java: "java".to_string(),
        }
    }
}

/// Command line used to start the proxy.
///
/// Every `{address}` in the arguments is replaced by the `host:port` the proxy must listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments, possibly containing `{address}`.
    pub args: Vec<String>,
}

impl ProxyCommand {
    /// Create a proxy command from a program and its argument template.
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn args_for(&self, address: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{address}", address))
            .collect()
    }
}

impl Default for ProxyCommand {
    fn default() -> Self {
        Self::new("sc2-proxy", ["--address", "{address}"])
    }
}

impl FromStr for ProxyCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("empty proxy command");
        };
        Ok(Self::new(program, parts))
    }
}

/// Configuration for match runner behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) log_level: Level,
    pub(crate) proxy_host: String,
    pub(crate) proxy_command: ProxyCommand,
    pub(crate) replays_directory: PathBuf,
    pub(crate) bot_ack_timeout: Duration,
    pub(crate) connect_interval: Duration,
    pub(crate) concurrency: Option<usize>,
    pub(crate) launchers: Launchers,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - The proxy is `sc2-proxy --address {address}` listening on `127.0.0.1`.
    /// - Bots get 400 seconds to join the proxy.
    /// - The proxy is polled once per second.
    /// - Half the physical cores are used as match concurrency.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            log_level: Level::INFO,
            proxy_host: "127.0.0.1".to_string(),
            proxy_command: ProxyCommand::default(),
            replays_directory: PathBuf::from("replays"),
            bot_ack_timeout: Duration::from_secs(400),
            connect_interval: Duration::from_secs(1),
            concurrency: None,
            launchers: Launchers::default(),
        }
    }

    /// Create configuration from environment variables (see module documentation).
    ///
    /// # Errors
    /// Returned when a variable is set but cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn parse_var<T>(var: &str) -> anyhow::Result<Option<T>>
        where
            T: FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match std::env::var(var) {
                Ok(val) => val
                    .trim()
                    .parse()
                    .map(Some)
                    .with_context(|| format!("invalid value for {var}: '{val}'")),
                Err(_) => Ok(None),
            }
        }

        let defaults = Self::new();
        let launchers = Launchers {
            python: std::env::var("RUNNER_PYTHON").unwrap_or(defaults.launchers.python),
            wine: std::env::var("RUNNER_WINE").unwrap_or(defaults.launchers.wine),
            dotnet: std::env::var("RUNNER_DOTNET").unwrap_or(defaults.launchers.dotnet),
            java: std::env::var("RUNNER_JAVA").unwrap_or(defaults.launchers.java),
        };
        let proxy_command = match std::env::var("RUNNER_PROXY_COMMAND") {
            Ok(val) => val.parse().context("invalid value for RUNNER_PROXY_COMMAND")?,
            Err(_) => defaults.proxy_command,
        };
        let log_level = match std::env::var("RUNNER_LOG_LEVEL") {
            Ok(val) => val
                .parse::<Level>()
                .map_err(|e| anyhow::anyhow!("invalid value for RUNNER_LOG_LEVEL: {e}"))?,
            Err(_) => defaults.log_level,
        };

        Ok(Self {
            verbose: get_env_flag("RUNNER_VERBOSE", true),
            log: get_env_flag("RUNNER_LOG", false),
            log_level,
            proxy_host: std::env::var("RUNNER_PROXY_HOST").unwrap_or(defaults.proxy_host),
            proxy_command,
            replays_directory: std::env::var("RUNNER_REPLAYS_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.replays_directory),
            bot_ack_timeout: parse_var::<u64>("RUNNER_BOT_ACK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.bot_ack_timeout),
            connect_interval: parse_var::<u64>("RUNNER_CONNECT_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_interval),
            concurrency: parse_var::<usize>("RUNNER_CONCURRENCY")?,
            launchers,
        })
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Maximum level written to the log file.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Host the proxy listens on, also given to bots as `--LadderServer`.
    pub fn with_proxy_host(mut self, host: impl Into<String>) -> Self {
        self.proxy_host = host.into();
        self
    }

    /// Command used to start one proxy per match.
    pub fn with_proxy_command(mut self, command: ProxyCommand) -> Self {
        self.proxy_command = command;
        self
    }

    /// Directory used to compute replay paths.
    pub fn with_replays_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.replays_directory = dir.into();
        self
    }

    /// How long each bot may take to join the proxy.
    pub fn with_bot_ack_timeout(mut self, timeout: Duration) -> Self {
        self.bot_ack_timeout = timeout;
        self
    }

    /// Delay before each proxy connection attempt.
    pub fn with_connect_interval(mut self, interval: Duration) -> Self {
        self.connect_interval = interval;
        self
    }

    /// Number of matches run at the same time. Zero is treated as one.
    pub fn with_concurrency(mut self, matches: usize) -> Self {
        self.concurrency = Some(matches);
        self
    }

    /// Launchers used for interpreted and managed bots.
    pub fn with_launchers(mut self, launchers: Launchers) -> Self {
        self.launchers = launchers;
        self
    }

    /// Matches run at the same time: configured value, or half the physical cores.
    pub fn concurrency(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| num_cpus::get_physical() / 2)
            .max(1)
    }

    /// Directory used to compute replay paths.
    pub fn replays_directory(&self) -> &std::path::Path {
        &self.replays_directory
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_command_expands_address() {
        let command = ProxyCommand::default();
        assert_eq!(
            command.args_for("127.0.0.1:5000"),
            vec!["--address".to_string(), "127.0.0.1:5000".to_string()]
        );
    }

    #[test]
    fn proxy_command_from_str() {
        let command: ProxyCommand = "proxy  -a {address} --quiet".parse().unwrap();
        assert_eq!(command.program, "proxy");
        assert_eq!(command.args, vec!["-a", "{address}", "--quiet"]);
        assert!("   ".parse::<ProxyCommand>().is_err());
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(Configuration::new().with_concurrency(0).concurrency(), 1);
        assert_eq!(Configuration::new().with_concurrency(3).concurrency(), 3);
        assert!(Configuration::new().concurrency() >= 1);
    }
}
