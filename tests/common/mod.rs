//! Shared test utilities

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use voice_link::config::Config;
use voice_link::voice::{
    ActiveGraph, AudioHost, CaptureStage, GraphStages, LevelAnalyser, Microphone,
    ProcessorRegistry, RegisterError, RenderStage,
};
use voice_link::{Error, Result, TurnListener};

/// How long a test waits for anything asynchronous
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Observable side effects of a [`MockHost`]
#[derive(Default)]
pub struct HostState {
    pub microphones_requested: usize,
    pub microphones_stopped: usize,
    pub graphs_built: usize,
    pub disconnects: usize,
    pub registrations: Vec<std::result::Result<(), RegisterError>>,
    analyser: Option<LevelAnalyser>,
    capture: Option<CaptureStage>,
    render: Option<RenderStage>,
}

/// Scripted audio host; tests drive the audio thread by hand
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
    registry: ProcessorRegistry,
    deny: bool,
    grant_delay: Option<Duration>,
    registration_failure: Option<String>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState::default())),
            registry: ProcessorRegistry::new(),
            deny: false,
            grant_delay: None,
            registration_failure: None,
        }
    }

    /// Deny every microphone request
    pub fn denying(mut self) -> Self {
        self.deny = true;
        self
    }

    /// Answer microphone requests only after `delay`
    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = Some(delay);
        self
    }

    /// Fail processor registration with `reason`
    pub fn failing_registration(mut self, reason: &str) -> Self {
        self.registration_failure = Some(reason.to_string());
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Whether a graph is currently wired
    pub fn has_graph(&self) -> bool {
        self.state().capture.is_some()
    }

    /// Feed one input block through the analyser and capture stage
    pub fn push_block(&self, block: &[f32]) -> bool {
        let mut state = self.state();
        let HostState {
            analyser, capture, ..
        } = &mut *state;
        match (analyser.as_ref(), capture.as_mut()) {
            (Some(analyser), Some(capture)) => {
                analyser.analyse(block);
                capture.process(block)
            }
            _ => false,
        }
    }

    /// Pull `samples` mono samples out of the render stage
    pub fn render(&self, samples: usize) -> Vec<f32> {
        let mut out = vec![0.0; samples];
        if let Some(render) = self.state().render.as_mut() {
            render.render(&mut out, 1);
        }
        out
    }
}

struct MockMicrophone {
    state: Arc<Mutex<HostState>>,
    stopped: bool,
}

impl Microphone for MockMicrophone {
    fn label(&self) -> String {
        "mock microphone".to_string()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.state.lock().unwrap().microphones_stopped += 1;
        }
    }
}

struct MockGraph {
    state: Arc<Mutex<HostState>>,
    microphone: Box<dyn Microphone>,
    connected: bool,
}

impl ActiveGraph for MockGraph {
    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        {
            let mut state = self.state.lock().unwrap();
            state.disconnects += 1;
            state.analyser = None;
            state.capture = None;
            state.render = None;
        }
        self.microphone.stop();
    }
}

impl Drop for MockGraph {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl AudioHost for MockHost {
    fn name(&self) -> &str {
        "mock"
    }

    async fn request_microphone(&self) -> Result<Box<dyn Microphone>> {
        self.state().microphones_requested += 1;
        if let Some(delay) = self.grant_delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny {
            return Err(Error::Permission("Permission denied".to_string()));
        }
        Ok(Box::new(MockMicrophone {
            state: Arc::clone(&self.state),
            stopped: false,
        }))
    }

    fn register_processor(&self, name: &str) -> std::result::Result<(), RegisterError> {
        let outcome = match &self.registration_failure {
            Some(reason) => Err(RegisterError::Failed(reason.clone())),
            None => self.registry.register(name),
        };
        self.state().registrations.push(outcome.clone());
        outcome
    }

    async fn build_graph(
        &self,
        microphone: Box<dyn Microphone>,
        stages: GraphStages,
    ) -> Result<Box<dyn ActiveGraph>> {
        let mut state = self.state();
        state.graphs_built += 1;
        state.analyser = Some(stages.analyser);
        state.capture = Some(stages.capture);
        state.render = Some(stages.render);
        drop(state);

        Ok(Box::new(MockGraph {
            state: Arc::clone(&self.state),
            microphone,
            connected: true,
        }))
    }
}

/// Turn listener recording every drained target
#[derive(Default)]
pub struct RecordingListener {
    pub targets: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn count(&self) -> usize {
        self.targets.lock().unwrap().len()
    }
}

impl TurnListener for RecordingListener {
    fn on_turn_drained(&self, target: &str) {
        self.targets.lock().unwrap().push(target.to_string());
    }
}

/// Configuration pointing at a local test server
pub fn test_config(server_url: &str) -> Config {
    let mut config = Config::default();
    config.server.url = server_url.to_string();
    config.server.api_url = "http://127.0.0.1:9".to_string();
    config
}

/// What the server should do on the live connection
#[derive(Debug)]
pub enum ServerAction {
    Text(String),
    Close(u16),
    Drop,
}

/// Local WebSocket server standing in for the voice service
///
/// Connections are served one at a time.
pub struct TestServer {
    pub addr: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
    actions: mpsc::UnboundedSender<ServerAction>,
    connections: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    api_keys: Arc<Mutex<Vec<Option<String>>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (received_tx, received) = mpsc::unbounded_channel();
        let (actions, mut actions_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let api_keys = Arc::new(Mutex::new(Vec::new()));

        let server = Self {
            addr,
            received,
            actions,
            connections: Arc::clone(&connections),
            paths: Arc::clone(&paths),
            api_keys: Arc::clone(&api_keys),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                serve(stream, &received_tx, &mut actions_rx, &paths, &api_keys).await;
            }
        });

        server
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Next text frame sent by the client
    pub async fn next_message(&mut self) -> String {
        tokio::time::timeout(TIMEOUT, self.received.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("server stopped")
    }

    /// Next text frame, parsed as JSON
    pub async fn next_json(&mut self) -> serde_json::Value {
        let text = self.next_message().await;
        serde_json::from_str(&text).expect("client sent invalid json")
    }

    /// Whether the client sent nothing within `wait`
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.received.recv()).await.is_err()
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.actions.send(ServerAction::Text(text.into())).unwrap();
    }

    pub fn close(&self, code: u16) {
        self.actions.send(ServerAction::Close(code)).unwrap();
    }

    /// Drop the TCP connection without a closing handshake
    pub fn drop_connection(&self) {
        self.actions.send(ServerAction::Drop).unwrap();
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    pub fn api_keys(&self) -> Vec<Option<String>> {
        self.api_keys.lock().unwrap().clone()
    }
}

async fn serve(
    stream: TcpStream,
    received: &mpsc::UnboundedSender<String>,
    actions: &mut mpsc::UnboundedReceiver<ServerAction>,
    paths: &Arc<Mutex<Vec<String>>>,
    api_keys: &Arc<Mutex<Vec<Option<String>>>>,
) {
    let record = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        paths.lock().unwrap().push(request.uri().path().to_string());
        let key = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        api_keys.lock().unwrap().push(key);
        Ok(response)
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, record).await else {
        return;
    };

    loop {
        tokio::select! {
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = received.send(text);
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            action = actions.recv() => match action {
                Some(ServerAction::Text(text)) => {
                    if ws.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(ServerAction::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = ws.send(Message::Close(Some(frame))).await;
                }
                Some(ServerAction::Drop) | None => return,
            },
        }
    }
}

/// Server that completes the upgrade and then never reads
///
/// Once the socket buffers fill, every client write blocks.
pub struct StalledServer {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl StalledServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    held.push(ws);
                }
            }
        });

        Self { addr, connections }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// URL of a local port nothing listens on
pub fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}
