#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
    WebSocketStream,
};
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    Layer, Registry,
};

struct MaxLevel(Level);
impl<S> Filter<S> for MaxLevel {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.level() <= &self.0
    }
}

/// Print runner events up to `debug` in the test output.
pub fn init_test_logger() {
    let format = fmt::format()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .event_format(format)
            .with_test_writer()
            .with_filter(MaxLevel(Level::DEBUG)),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}

pub const CONNECTED: &str = r#"{"Status":"Connected"}"#;
pub const CONFIG_RECEIVED: &str = r#"{"Config":"Received"}"#;
pub const BOT_CONNECTED: &str = r#"{"Bot":"Connected"}"#;
pub const COMPLETE: &str = r#"{"Status":"Complete"}"#;

/// One action of a scripted proxy session.
pub enum Step {
    /// Send a text message.
    Send(String),
    /// Record the next text message of the supervisor.
    Expect,
    Sleep(Duration),
    /// Close the socket, then drain.
    Close,
    /// Record everything until the supervisor disconnects.
    Drain,
}

pub fn send(text: &str) -> Step {
    Step::Send(text.to_string())
}

/// Handshake up to the config acknowledgment.
pub fn handshake() -> Vec<Step> {
    vec![send(CONNECTED), Step::Expect, send(CONFIG_RECEIVED)]
}

#[derive(Debug, Default, Clone)]
pub struct Session {
    pub supervisor_header: bool,
    pub received: Vec<String>,
    pub shutdown_requested: bool,
    /// When the scripted session was accepted.
    pub started: Option<Instant>,
    /// When the scripted session ended.
    pub ended: Option<Instant>,
}

type Shared = Arc<Mutex<Session>>;

/// Websocket server playing a script against the first supervisor connection.
///
/// It keeps accepting afterwards: a connection carrying a `shutdown` header is recorded and
/// refused, the way the real proxy answers a shutdown request.
pub struct FakeProxy {
    pub port: u16,
    state: Shared,
    done: oneshot::Receiver<()>,
    acceptor: JoinHandle<()>,
}

impl FakeProxy {
    pub async fn start(script: Vec<Step>) -> FakeProxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Shared::default();
        let (done_tx, done) = oneshot::channel();
        let acceptor = tokio::spawn(serve(listener, script, state.clone(), done_tx));
        FakeProxy {
            port,
            state,
            done,
            acceptor,
        }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Wait for the scripted session to end.
    pub async fn finish(self) -> Session {
        tokio::time::timeout(Duration::from_secs(10), self.done)
            .await
            .expect("fake proxy session did not end")
            .expect("fake proxy stopped before its session");
        self.acceptor.abort();
        let session = self.state.lock().unwrap().clone();
        session
    }
}

async fn serve(listener: TcpListener, script: Vec<Step>, state: Shared, done: oneshot::Sender<()>) {
    let mut pending = Some((script, done));
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let shared = state.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let headers = req.headers();
            let mut session = shared.lock().unwrap();
            if headers.contains_key("shutdown") {
                session.shutdown_requested = true;
                return Err(ErrorResponse::new(Some("Shutdown Requested".to_string())));
            }
            session.supervisor_header = headers
                .get("supervisor")
                .is_some_and(|v| v.as_bytes() == b"true");
            Ok(resp)
        };
        let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
            continue;
        };
        let Some((script, done)) = pending.take() else {
            continue;
        };

        state.lock().unwrap().started = Some(Instant::now());
        let mut received = Vec::new();
        play(&mut ws, script, &mut received).await;
        {
            let mut session = state.lock().unwrap();
            session.received = received;
            session.ended = Some(Instant::now());
        }
        let _ = done.send(());
    }
}

async fn play(ws: &mut WebSocketStream<TcpStream>, script: Vec<Step>, received: &mut Vec<String>) {
    for step in script {
        match step {
            Step::Send(text) => {
                if ws.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Step::Expect => loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        received.push(text);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            },
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::Close => {
                let _ = ws.close(None).await;
                drain(ws, received).await;
                return;
            }
            Step::Drain => {
                drain(ws, received).await;
                return;
            }
        }
    }
}

async fn drain(ws: &mut WebSocketStream<TcpStream>, received: &mut Vec<String>) {
    let deadline = Duration::from_secs(5);
    let _ = tokio::time::timeout(deadline, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                received.push(text);
            }
        }
    })
    .await;
}

/// A port on which nothing listens.
pub fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn scenario_a_result() -> String {
    r#"{"Result":{"BotA":"Victory","BotB":"Defeat"},"GameTime":500,"GameTimeFormatted":"00:08:20"}"#
        .to_string()
}
