//! Protocol client driving one match on the proxy.
//!
//! A [`Supervisor`] goes through the following states, strictly in order:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> AwaitingBotAcks -> Streaming -> Closed
//! ```
//!
//! - [`Supervisor::connect`] opens the websocket, retrying once per interval.
//! - [`Supervisor::start_game`] performs the handshake: `{"Status":"Connected"}` must arrive
//!   first, the [`MatchConfig`] is sent, then `{"Config":"Received"}` must arrive.
//! - [`Supervisor::wait_for_bot`] is called once per bot and waits for `{"Bot":"Connected"}`.
//! - [`Supervisor::wait_for_result`] consumes the result stream, acknowledging every message.
//!
//! [`Supervisor::shutdown_request`] sits outside this sequence: it asks the proxy to exit
//! over a connection of its own.

use std::{fmt, future::Future, path::PathBuf, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::RunnerError,
    match_config::MatchConfig,
    protocol::{ProxyMessage, ACKNOWLEDGMENT, RESET},
    result::{MatchResult, ResultCollector},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where a supervisor is in its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No socket.
    Disconnected,
    /// Trying to open the socket.
    Connecting,
    /// Socket open, handshake not done.
    Connected,
    /// Config accepted, bots are joining.
    AwaitingBotAcks,
    /// Game running, results are streamed.
    Streaming,
    /// Socket closed.
    Closed,
}

/// How often and how long to try opening the proxy socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before every attempt.
    pub interval: Duration,
    /// Attempts budget.
    pub max_attempts: u32,
    /// Give up as soon as more than this many consecutive attempts failed.
    pub max_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 60,
            max_failures: 15,
        }
    }
}

impl RetryPolicy {
    /// Call `attempt` until it succeeds, the failure threshold is exceeded or the budget is
    /// spent.
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, RunnerError>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut failures = 0;
        for n in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures += 1;
                    debug!(attempt = n, "connection failed: {e}");
                    if failures > self.max_failures {
                        break;
                    }
                }
            }
        }
        Err(RunnerError::Connection(format!(
            "gave up after {failures} failed attempts"
        )))
    }
}

enum Inbound {
    Text(String),
    Closed,
}

/// Protocol client for one proxy session.
pub struct Supervisor {
    address: String,
    config: MatchConfig,
    replays_directory: PathBuf,
    retry: RetryPolicy,
    state: SupervisorState,
    socket: Option<Socket>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}

impl Supervisor {
    /// Supervisor for the proxy at `address` (`host:port`), running `config`.
    pub fn new(address: impl Into<String>, config: MatchConfig) -> Supervisor {
        Supervisor {
            address: address.into(),
            config,
            replays_directory: PathBuf::from("replays"),
            retry: RetryPolicy::default(),
            state: SupervisorState::Disconnected,
            socket: None,
        }
    }

    /// Directory used to compute replay paths.
    #[must_use]
    pub fn with_replays_directory(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            replays_directory: dir.into(),
            ..self
        }
    }

    /// Connection retry policy.
    #[must_use]
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Current protocol state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Match run by this supervisor.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Websocket URL of the proxy.
    pub fn url(&self) -> String {
        let address = self.address.trim_end_matches("/sc2api");
        format!("ws://{address}/sc2api")
    }

    /// Open the proxy socket.
    ///
    /// # Errors
    /// [`RunnerError::Connection`] once more than `max_failures` attempts failed in a row.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn connect(&mut self) -> Result<(), RunnerError> {
        self.state = SupervisorState::Connecting;
        let url = self.url();
        let socket = self
            .retry
            .run(|_| open_socket(url.clone(), "supervisor"))
            .await;

        match socket {
            Ok(socket) => {
                debug!("connected to {url}");
                self.socket = Some(socket);
                self.state = SupervisorState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!("could not connect to {url}: {e}");
                self.state = SupervisorState::Disconnected;
                Err(e)
            }
        }
    }

    /// Handshake: connection status, config, config acknowledgment.
    ///
    /// Connects first when needed. Any unexpected message or closure is fatal.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn start_game(&mut self) -> Result<(), RunnerError> {
        if self.socket.is_none() {
            self.connect().await?;
        }

        let msg = self.expect_message("connection status").await?;
        if !msg.is_connected_status() {
            return self.protocol_violation("expected {\"Status\":\"Connected\"}").await;
        }
        debug!("connected to proxy");

        self.send(self.config.to_json()).await?;

        let msg = self.expect_message("config acknowledgment").await?;
        if !msg.is_config_received() {
            return self.protocol_violation("expected {\"Config\":\"Received\"}").await;
        }
        info!("config sent, bots can be started");
        self.state = SupervisorState::AwaitingBotAcks;
        Ok(())
    }

    /// Wait at most `timeout` for the proxy to report that a bot joined.
    ///
    /// On failure the socket is closed.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn wait_for_bot(&mut self, timeout: Duration) -> Result<(), RunnerError> {
        let received = tokio::time::timeout(timeout, self.receive()).await;
        let failure = match received {
            Err(_) => RunnerError::AckTimeout(timeout),
            Ok(Err(e)) => e,
            Ok(Ok(Inbound::Closed)) => {
                RunnerError::Connection("closed while waiting for a bot".to_string())
            }
            Ok(Ok(Inbound::Text(text))) => match ProxyMessage::parse(&text) {
                Ok(msg) if msg.is_bot_connected() => {
                    debug!("bot connected");
                    return Ok(());
                }
                _ => RunnerError::Connection(format!("unexpected message '{text}'")),
            },
        };
        warn!("bot did not join: {failure}");
        self.close().await;
        Err(failure)
    }

    /// Consume the result stream until the game is over, then close the socket.
    ///
    /// The returned result always has an outcome, [`Outcome::Error`](crate::result::Outcome::Error)
    /// when the stream ended without one.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn wait_for_result(&mut self) -> MatchResult {
        let mut collector = ResultCollector::new(&self.config, &self.replays_directory);
        self.stream_results(&mut collector).await;
        self.close().await;
        collector.finish()
    }

    async fn stream_results(&mut self, collector: &mut ResultCollector) {
        self.state = SupervisorState::Streaming;
        loop {
            let text = match self.receive().await {
                Ok(Inbound::Text(text)) => text,
                Ok(Inbound::Closed) => {
                    debug!("proxy closed the connection");
                    return;
                }
                Err(e) => {
                    warn!("{e}");
                    return;
                }
            };
            trace!(text, "proxy message");

            match ProxyMessage::parse(&text) {
                Ok(msg) => {
                    if msg.carries_result() {
                        collector.apply(&msg);
                    }
                    if msg.has_error() && !collector.has_result() {
                        warn!("proxy reported an error: {text}");
                        collector.set_error();
                        return;
                    }
                    if msg.is_complete() {
                        collector.stamp_completion();
                    }
                }
                Err(e) => warn!("ignoring malformed message '{text}': {e}"),
            }

            if let Err(e) = self.send(ACKNOWLEDGMENT.to_string()).await {
                warn!("could not acknowledge message: {e}");
                return;
            }
        }
    }

    /// Ask the proxy to reset its session and wait for its confirmation.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn reset(&mut self) -> Result<(), RunnerError> {
        self.send(RESET.to_string()).await?;
        match self.receive().await? {
            Inbound::Text(text) => {
                debug!(text, "reset confirmed");
                Ok(())
            }
            Inbound::Closed => Err(RunnerError::Connection(
                "closed while waiting for reset confirmation".to_string(),
            )),
        }
    }

    /// Ask the proxy to stop accepting connections and exit.
    ///
    /// Opens a separate connection carrying a `shutdown: true` header, in a single attempt.
    /// The proxy answers by refusing the upgrade, which counts as success.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn shutdown_request(&self) -> Result<(), RunnerError> {
        match open_socket(self.url(), "shutdown").await {
            Ok(mut socket) => {
                debug!("proxy accepted the shutdown connection");
                if let Err(e) = socket.close(None).await {
                    trace!("error while closing socket: {e}");
                }
                Ok(())
            }
            Err(WsError::Http(response)) => {
                debug!(status = %response.status(), "shutdown acknowledged");
                Ok(())
            }
            Err(e) => Err(RunnerError::Connection(format!(
                "shutdown request failed: {e}"
            ))),
        }
    }

    /// Close the socket. Does nothing when already closed.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                trace!("error while closing socket: {e}");
            }
        }
        self.state = SupervisorState::Closed;
    }

    async fn send(&mut self, text: String) -> Result<(), RunnerError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| RunnerError::Connection("not connected".to_string()))?;
        socket
            .send(Message::Text(text))
            .await
            .map_err(|e| RunnerError::Connection(format!("send failed: {e}")))
    }

    async fn receive(&mut self) -> Result<Inbound, RunnerError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| RunnerError::Connection("not connected".to_string()))?;
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text)),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Inbound::Text(String::from_utf8_lossy(&data).into_owned()))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Closed),
                Some(Err(e)) => {
                    debug!("socket error: {e}");
                    return Ok(Inbound::Closed);
                }
            }
        }
    }

    async fn expect_message(&mut self, what: &str) -> Result<ProxyMessage, RunnerError> {
        match self.receive().await? {
            Inbound::Text(text) => match ProxyMessage::parse(&text) {
                Ok(msg) => Ok(msg),
                Err(_) => {
                    self.protocol_violation(&format!("unexpected {what} '{text}'"))
                        .await
                }
            },
            Inbound::Closed => {
                self.close().await;
                Err(RunnerError::Connection(format!(
                    "proxy closed the connection before the {what}"
                )))
            }
        }
    }

    async fn protocol_violation<T>(&mut self, reason: &str) -> Result<T, RunnerError> {
        self.close().await;
        Err(RunnerError::Connection(reason.to_string()))
    }
}

async fn open_socket(url: String, role: &'static str) -> Result<Socket, WsError> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(role, HeaderValue::from_static("true"));
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_sixteen_attempts() {
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), RunnerError> = RetryPolicy::default()
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("refused") }
            })
            .await;

        assert!(matches!(result, Err(RunnerError::Connection(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 16);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(16) && elapsed < Duration::from_secs(17));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let attempts = AtomicU32::new(0);
        let value = RetryPolicy::default()
            .run(|n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 10 {
                        Err("refused")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 10);
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn small_budget_is_respected() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), RunnerError> = policy
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("refused") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn url_is_normalised() {
        let config = MatchConfig::new("m", "a", "b");
        assert_eq!(
            Supervisor::new("127.0.0.1:5000", config.clone()).url(),
            "ws://127.0.0.1:5000/sc2api"
        );
        assert_eq!(
            Supervisor::new("127.0.0.1:5000/sc2api", config).url(),
            "ws://127.0.0.1:5000/sc2api"
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut supervisor = Supervisor::new("127.0.0.1:1", MatchConfig::new("m", "a", "b"));
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        supervisor.close().await;
        supervisor.close().await;
        assert_eq!(supervisor.state(), SupervisorState::Closed);
    }
}
