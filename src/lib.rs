//! # Arena Runner
//!
//! Runs head-to-head matches between bot executables, hosted by an external proxy process that
//! speaks a small JSON protocol over a websocket.
//!
//! It provides:
//! - Match scheduling with bounded concurrency ([`MatchScheduler`](crate::scheduler::MatchScheduler))
//! - The proxy protocol client ([`Supervisor`](crate::supervisor::Supervisor))
//! - Bot runtime deduction and launching ([`BotProcess`](crate::bot::BotProcess))
//! - Result interpretation ([`MatchResult`](crate::result::MatchResult))
//!
//! Each match runs one proxy and two bots, each as a separate OS process. Every process is
//! killed when its match ends, and
//! [`MatchScheduler::shutdown`](crate::scheduler::MatchScheduler::shutdown) kills whatever is
//! left.
//!
//! # Documentation Overview
//!
//! - For the match pipeline and cleanup guarantees, see the [`scheduler`] module.
//! - For the wire protocol and its states, see the [`supervisor`] and [`protocol`] modules.
//! - For how bot directories are laid out and launched, see the [`bot`] module.
//! - For runner behavior and environment variables, see
//!   [`Configuration`](crate::configuration::Configuration).
//!
//! # Usage Example
//!
//! ```no_run
//! use arena_runner::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env()?.with_concurrency(2);
//!     let scheduler = MatchScheduler::new("bots", config);
//!
//!     let matches = vec![
//!         MatchConfig::new("AcropolisLE", "BotA", "BotB").with_match_id(1),
//!         MatchConfig::new("AcropolisLE", "BotB", "BotA").with_match_id(2),
//!     ];
//!     for result in scheduler.run(matches).await? {
//!         println!("{result}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Bot Requirements
//!
//! - A bot named `name` lives in `<bot_directory>/name/`, next to one marker file:
//!   `run.py`, `name.exe`, `name`, `name.dll` or `name.jar`
//! - Bots are started with `--GamePort <port> --StartPort <port> --LadderServer <host> --OpponentId <id>`
//! - Their output is written to `<bot_directory>/name/data/stderr.log`
#![warn(missing_docs)]

pub use anyhow;
pub mod bot;
pub mod configuration;
pub mod error;
pub mod logger;
pub mod match_config;
pub mod ports;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod result;
pub mod scheduler;
pub mod supervisor;

/// Commonly used types for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use arena_runner::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`MatchConfig`](crate::match_config::MatchConfig)
/// - [`MatchScheduler`](crate::scheduler::MatchScheduler)
/// - [`MatchResult`](crate::result::MatchResult) and [`Outcome`](crate::result::Outcome)
pub mod prelude {
    pub use crate::configuration::Configuration;
    pub use crate::error::RunnerError;
    pub use crate::match_config::{MatchConfig, Race};
    pub use crate::result::{MatchResult, Outcome, Winner};
    pub use crate::scheduler::MatchScheduler;
    pub use crate::supervisor::Supervisor;
}
