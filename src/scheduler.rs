//! Core match running logic.
//!
//! This module defines the [`MatchScheduler`] type, which runs a list of [`MatchConfig`]s.
//! Its responsibilities include:
//!
//! - Reserving one proxy port per match before anything starts
//! - Running matches in batches of [`Configuration::concurrency`] matches
//! - Driving the per-match pipeline: proxy, handshake, both bots, result stream
//! - Killing every bot and proxy it started, whatever the outcome
//!
//! # Match pipeline
//!
//! For every match the scheduler:
//!
//! 1. checks a port out of the [`PortPool`] and starts the proxy on `proxy_host:port`,
//! 2. runs the [`Supervisor`] handshake,
//! 3. starts player 1 and waits for the proxy to report it connected, then does the same for
//!    player 2,
//! 4. streams the result until the game is over,
//! 5. kills both bots, asks the proxy to shut down, kills it, then gives the port back.
//!
//! Any failure in steps 1 to 3 ends the match with
//! [`Outcome::Error`](crate::result::Outcome::Error); the other matches of the batch are not
//! affected.
//!
//! # Cleanup
//!
//! Every process is registered in a [`ProcessRegistry`] owned by the scheduler.
//! [`MatchScheduler::shutdown`] kills whatever is still registered, and is called when the
//! scheduler is dropped.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::future::join_all;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    bot::BotProcess,
    configuration::Configuration,
    error::RunnerError,
    logger::init_logger,
    match_config::MatchConfig,
    ports::{EphemeralPorts, PortPool, PortReserver, PortSlot},
    process::{ProcessRegistry, TrackingId},
    proxy::ProxyProcess,
    result::MatchResult,
    supervisor::{RetryPolicy, Supervisor},
};

/// Runs matches between bots found in a directory.
pub struct MatchScheduler {
    bot_directory: PathBuf,
    config: Configuration,
    reserver: Arc<dyn PortReserver>,
    registry: Arc<ProcessRegistry>,
    running: Mutex<Vec<MatchConfig>>,
    peak_ports: AtomicUsize,
}

/// How long the proxy gets to answer a shutdown request before it is killed.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

impl std::fmt::Debug for MatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchScheduler")
            .field("bot_directory", &self.bot_directory)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl MatchScheduler {
    /// Create a [`MatchScheduler`] for bots installed in `bot_directory`
    /// (one sub-directory per bot).
    #[instrument(skip_all)]
    pub fn new(bot_directory: impl Into<PathBuf>, config: Configuration) -> MatchScheduler {
        if config.log {
            if let Err(e) = init_logger(config.log_level) {
                eprintln!("logging disabled: {e:#}");
            }
        }

        trace!(?config);
        MatchScheduler {
            bot_directory: bot_directory.into(),
            config,
            reserver: Arc::new(EphemeralPorts::new()),
            registry: Arc::new(ProcessRegistry::new()),
            running: Mutex::new(Vec::new()),
            peak_ports: AtomicUsize::new(0),
        }
    }

    /// Use `reserver` instead of OS ephemeral ports.
    #[must_use]
    pub fn with_port_reserver(mut self, reserver: Arc<dyn PortReserver>) -> Self {
        self.reserver = reserver;
        self
    }

    /// Processes started and not killed yet.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Configuration in use.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Run every match and return their results, in the order of `matches`.
    ///
    /// # Errors
    /// [`RunnerError::PortReservation`] if the ports could not be reserved. Failures of a
    /// single match are reported in its result instead.
    pub async fn run(&self, matches: Vec<MatchConfig>) -> Result<Vec<MatchResult>, RunnerError> {
        let pool = PortPool::reserve(self.reserver.clone(), matches.len())?;
        let concurrency = self.config.concurrency();
        info!(matches = matches.len(), concurrency, "running matches");

        if self.config.verbose {
            disable_line_wrap();
        }

        let mut results = Vec::with_capacity(matches.len());
        for batch in matches.chunks(concurrency) {
            // every match of the batch is torn down before the next batch starts
            let batch_results = join_all(batch.iter().map(|config| {
                let slot = pool.checkout();
                self.run_in_slot(config, slot)
            }))
            .await;
            results.extend(batch_results);
        }

        if self.config.verbose {
            enable_line_wrap();
        }
        self.peak_ports.store(pool.peak(), Ordering::Relaxed);
        Ok(results)
    }

    /// Run one match.
    ///
    /// # Errors
    /// [`RunnerError::PortReservation`] if no port could be reserved.
    pub async fn run_single(&self, config: MatchConfig) -> Result<MatchResult, RunnerError> {
        let pool = PortPool::reserve(self.reserver.clone(), 1)?;
        Ok(self.run_in_slot(&config, pool.checkout()).await)
    }

    /// Highest number of ports checked out at the same time during the last [`run`](Self::run).
    pub fn peak_ports_in_flight(&self) -> usize {
        self.peak_ports.load(Ordering::Relaxed)
    }

    /// Kill every process still running. Returns how many were killed.
    pub fn shutdown(&self) -> usize {
        self.registry.shutdown()
    }

    async fn run_in_slot(&self, config: &MatchConfig, slot: Option<PortSlot>) -> MatchResult {
        let Some(slot) = slot else {
            // only reachable if the pool was sized wrong
            warn!(%config, "no port left for the match");
            return MatchResult::error(config, self.config.replays_directory());
        };

        self.add_running(config);
        let result = self.run_match(config, slot.port()).await;
        drop(slot);

        if self.config.verbose {
            print_match_result(&result);
        }
        self.remove_running(config);
        result
    }

    #[instrument(skip(self, config), fields(match_id = config.match_id()))]
    async fn run_match(&self, config: &MatchConfig, port: u16) -> MatchResult {
        let mut resources = MatchResources::new(&self.registry);
        let result = match self.play(config, port, &mut resources).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%config, "match failed: {e}");
                MatchResult::error(config, self.config.replays_directory())
            }
        };
        resources.teardown().await;
        info!(%result, "match over");
        result
    }

    async fn play(
        &self,
        config: &MatchConfig,
        port: u16,
        resources: &mut MatchResources<'_>,
    ) -> Result<MatchResult, RunnerError> {
        let host = &self.config.proxy_host;
        let address = format!("{host}:{port}");

        let proxy = ProxyProcess::start(&self.config.proxy_command, &address)?;
        resources.set_proxy(proxy);

        let retry = RetryPolicy {
            interval: self.config.connect_interval,
            ..RetryPolicy::default()
        };
        let supervisor = resources.set_supervisor(
            Supervisor::new(address.as_str(), config.clone())
                .with_replays_directory(self.config.replays_directory())
                .with_retry_policy(retry),
        );
        supervisor.start_game().await?;

        let players = [
            (config.player1(), config.player2()),
            (config.player2(), config.player1()),
        ];
        for (name, opponent) in players {
            let bot = resources.add_bot(BotProcess::new(name, &self.bot_directory)?);
            let process = bot.start(&self.config.launchers, opponent, port, host)?;
            let id = self.registry.track(process);
            resources.tracked.push(id);

            resources
                .supervisor()?
                .wait_for_bot(self.config.bot_ack_timeout)
                .await?;
        }

        Ok(resources.supervisor()?.wait_for_result().await)
    }

    fn add_running(&self, config: &MatchConfig) {
        let mut guard = self.running.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(config.clone());
        if self.config.verbose {
            print_running_matches(&guard);
        }
    }

    fn remove_running(&self, config: &MatchConfig) {
        let mut guard = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(pos) = guard.iter().position(|c| c == config) {
            guard.remove(pos);
        }
    }

    /// Directory holding the bots.
    pub fn bot_directory(&self) -> &Path {
        &self.bot_directory
    }
}

impl Drop for MatchScheduler {
    fn drop(&mut self) {
        let killed = self.shutdown();
        if killed > 0 {
            warn!(killed, "processes killed at scheduler shutdown");
        }
    }
}

/// Everything one match started, torn down together.
struct MatchResources<'a> {
    registry: &'a ProcessRegistry,
    proxy: Option<(ProxyProcess, TrackingId)>,
    supervisor: Option<Supervisor>,
    bots: Vec<BotProcess>,
    tracked: Vec<TrackingId>,
}

impl<'a> MatchResources<'a> {
    fn new(registry: &'a ProcessRegistry) -> Self {
        Self {
            registry,
            proxy: None,
            supervisor: None,
            bots: Vec::with_capacity(2),
            tracked: Vec::with_capacity(2),
        }
    }

    fn set_proxy(&mut self, proxy: ProxyProcess) {
        let id = self.registry.track(proxy.process());
        self.proxy = Some((proxy, id));
    }

    fn set_supervisor(&mut self, supervisor: Supervisor) -> &mut Supervisor {
        self.supervisor.insert(supervisor)
    }

    fn supervisor(&mut self) -> Result<&mut Supervisor, RunnerError> {
        self.supervisor
            .as_mut()
            .ok_or_else(|| RunnerError::Connection("no supervisor for the match".to_string()))
    }

    fn add_bot(&mut self, bot: BotProcess) -> &mut BotProcess {
        self.bots.push(bot);
        let last = self.bots.len() - 1;
        &mut self.bots[last]
    }

    async fn teardown(mut self) {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.close().await;
        }
        for bot in &mut self.bots {
            if bot.kill() {
                trace!(bot = bot.name(), "bot killed");
            }
        }
        for id in self.tracked.drain(..) {
            self.registry.untrack(id);
        }
        if let Some(supervisor) = self.supervisor.as_ref() {
            match tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, supervisor.shutdown_request())
                .await
            {
                Ok(Ok(())) => trace!("proxy asked to shut down"),
                Ok(Err(e)) => debug!("shutdown request failed: {e}"),
                Err(_) => debug!("proxy did not answer the shutdown request"),
            }
        }
        if let Some((proxy, id)) = self.proxy.take() {
            proxy.kill();
            self.registry.untrack(id);
            trace!(address = proxy.address(), "proxy killed");
        }
    }
}

fn print_match_result(result: &MatchResult) {
    // clear line, green match, default result, start of line
    println!(
        "\x1b[2K\x1b[32m#{} {} vs {}: \x1b[39m{}\x1b[0G",
        result.match_id(),
        result.bot1(),
        result.bot2(),
        result.outcome()
    );
}

fn print_running_matches(running: &[MatchConfig]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(MatchConfig::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
