//! Shared utilities for flow and end-to-end tests.
#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http2::SendRequest;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use rpc_gateway::config::GatewayConfig;
use rpc_gateway::grpc::call::{CallFuture, ReadOutcome, ServerCall, UpstreamCall, UpstreamStub};
use rpc_gateway::grpc::framing::{GrpcMessage, MessageDecoder};
use rpc_gateway::grpc::metadata::{BackendMetadata, ClientMetadata};
use rpc_gateway::grpc::status::{Code, Status};
use rpc_gateway::grpc::AsyncQueue;
use rpc_gateway::http::{AppState, GatewayState, HttpServer};

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

pub fn msg(payload: &'static [u8]) -> GrpcMessage {
    GrpcMessage::new(Bytes::from_static(payload))
}

// ---------------------------------------------------------------------------
// In-memory call doubles
// ---------------------------------------------------------------------------

/// Operation invocations, recorded when the flow issues them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ClientRead,
    ClientInitialMetadata,
    ClientWrite(Bytes),
    ClientFinish(Code),
    UpstreamStart,
    UpstreamInitialMetadata,
    UpstreamRead,
    UpstreamWrite(Bytes),
    UpstreamWritesDone,
    UpstreamFinish,
    UpstreamCancel,
}

impl Event {
    /// Reads and writes on either call.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Event::ClientRead
                | Event::ClientInitialMetadata
                | Event::ClientWrite(_)
                | Event::UpstreamInitialMetadata
                | Event::UpstreamRead
                | Event::UpstreamWrite(_)
                | Event::UpstreamWritesDone
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Events recorded after the client was finished.
    pub fn after_client_finish(&self) -> Vec<Event> {
        let events = self.snapshot();
        match events.iter().position(|e| matches!(e, Event::ClientFinish(_))) {
            Some(index) => events[index + 1..].to_vec(),
            None => Vec::new(),
        }
    }
}

/// Scripted client side of a call.
#[derive(Clone)]
pub struct MockClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    events: EventLog,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReadOutcome>>,
    written: mpsc::UnboundedSender<GrpcMessage>,
    initial_metadata: Mutex<Option<ClientMetadata>>,
    fail_initial_metadata: AtomicBool,
    fail_writes: AtomicBool,
    finish_count: AtomicUsize,
    finish_tx: Mutex<Option<oneshot::Sender<(Status, ClientMetadata)>>>,
    gone: CancellationToken,
}

/// Test-side controls for a [`MockClient`].
pub struct ClientHandle {
    inner: Arc<ClientInner>,
    incoming: mpsc::UnboundedSender<ReadOutcome>,
    written: mpsc::UnboundedReceiver<GrpcMessage>,
    finished: Option<oneshot::Receiver<(Status, ClientMetadata)>>,
}

impl MockClient {
    pub fn new(events: EventLog) -> (Self, ClientHandle) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (finish_tx, finish_rx) = oneshot::channel();
        let inner = Arc::new(ClientInner {
            events,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            written: written_tx,
            initial_metadata: Mutex::new(None),
            fail_initial_metadata: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            finish_count: AtomicUsize::new(0),
            finish_tx: Mutex::new(Some(finish_tx)),
            gone: CancellationToken::new(),
        });
        let handle = ClientHandle {
            inner: Arc::clone(&inner),
            incoming: incoming_tx,
            written: written_rx,
            finished: Some(finish_rx),
        };
        (Self { inner }, handle)
    }
}

impl ServerCall for MockClient {
    fn send_initial_metadata(&self, metadata: ClientMetadata) -> CallFuture<bool> {
        self.inner.events.push(Event::ClientInitialMetadata);
        let ok = !self.inner.fail_initial_metadata.load(Ordering::SeqCst);
        if ok {
            *self.inner.initial_metadata.lock().unwrap() = Some(metadata);
        }
        Box::pin(async move { ok })
    }

    fn read(&self) -> CallFuture<ReadOutcome> {
        self.inner.events.push(Event::ClientRead);
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut incoming = inner.incoming.lock().await;
            incoming
                .recv()
                .await
                .unwrap_or_else(|| ReadOutcome::Failed(Status::cancelled("script ended")))
        })
    }

    fn write(&self, message: GrpcMessage) -> CallFuture<bool> {
        self.inner
            .events
            .push(Event::ClientWrite(message.payload().clone()));
        let ok = !self.inner.fail_writes.load(Ordering::SeqCst)
            && self.inner.written.send(message).is_ok();
        Box::pin(async move { ok })
    }

    fn finish(&self, status: Status, trailers: ClientMetadata) {
        self.inner.events.push(Event::ClientFinish(status.code()));
        self.inner.finish_count.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.inner.finish_tx.lock().unwrap().take() {
            let _ = tx.send((status, trailers));
        }
    }

    fn closed(&self) -> CallFuture<()> {
        let gone = self.inner.gone.clone();
        Box::pin(async move { gone.cancelled().await })
    }
}

impl ClientHandle {
    pub fn send(&self, message: GrpcMessage) {
        let _ = self.incoming.send(ReadOutcome::Message(message));
    }

    pub fn half_close(&self) {
        let _ = self.incoming.send(ReadOutcome::EndOfStream);
    }

    /// The next read reports a stream failure.
    pub fn fail_read(&self, status: Status) {
        let _ = self.incoming.send(ReadOutcome::Failed(status));
    }

    /// The client goes away without any read reporting it.
    pub fn disconnect(&self) {
        self.inner.gone.cancel();
    }

    pub fn fail_initial_metadata(&self) {
        self.inner.fail_initial_metadata.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.inner.fail_writes.store(true, Ordering::SeqCst);
    }

    pub async fn next_written(&mut self) -> Option<GrpcMessage> {
        within(self.written.recv()).await
    }

    /// Messages written so far, without waiting.
    pub fn drain_written(&mut self) -> Vec<GrpcMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.written.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn initial_metadata(&self) -> Option<ClientMetadata> {
        self.inner.initial_metadata.lock().unwrap().clone()
    }

    /// Wait for the terminal status. Panics if called twice.
    pub async fn finished(&mut self) -> (Status, ClientMetadata) {
        let rx = self.finished.take().expect("finished() called twice");
        within(rx).await.expect("client finish sender dropped")
    }

    pub fn finish_count(&self) -> usize {
        self.inner.finish_count.load(Ordering::SeqCst)
    }
}

/// How the scripted backend answers `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Accept,
    Unavailable,
    /// Accept once [`BackendHandle::release_start`] is called.
    Gated,
}

pub struct MockStub {
    events: EventLog,
    mode: StartMode,
    call: Mutex<Option<MockUpstream>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    started_with: Arc<Mutex<Option<(String, BackendMetadata)>>>,
}

#[derive(Clone)]
pub struct MockUpstream {
    inner: Arc<UpstreamInner>,
}

struct UpstreamInner {
    events: EventLog,
    initial_metadata: Mutex<Option<oneshot::Receiver<BackendMetadata>>>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<GrpcMessage>>,
    received: mpsc::UnboundedSender<GrpcMessage>,
    status: Mutex<Option<oneshot::Receiver<(Status, BackendMetadata)>>>,
    reject_writes: AtomicBool,
    cancel: CancellationToken,
}

/// Test-side controls for the backend behind a [`MockStub`].
pub struct BackendHandle {
    inner: Arc<UpstreamInner>,
    initial_metadata: Option<oneshot::Sender<BackendMetadata>>,
    messages: Option<mpsc::UnboundedSender<GrpcMessage>>,
    received: mpsc::UnboundedReceiver<GrpcMessage>,
    status: Option<oneshot::Sender<(Status, BackendMetadata)>>,
    gate: Option<oneshot::Sender<()>>,
    started_with: Arc<Mutex<Option<(String, BackendMetadata)>>>,
}

impl MockStub {
    pub fn new(events: EventLog, mode: StartMode) -> (Self, BackendHandle) {
        let (md_tx, md_rx) = oneshot::channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = oneshot::channel();
        let (gate_tx, gate_rx) = oneshot::channel();
        let started_with = Arc::new(Mutex::new(None));

        let inner = Arc::new(UpstreamInner {
            events: events.clone(),
            initial_metadata: Mutex::new(Some(md_rx)),
            messages: tokio::sync::Mutex::new(messages_rx),
            received: received_tx,
            status: Mutex::new(Some(status_rx)),
            reject_writes: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let stub = Self {
            events,
            mode,
            call: Mutex::new(Some(MockUpstream {
                inner: Arc::clone(&inner),
            })),
            gate: Mutex::new(Some(gate_rx)),
            started_with: Arc::clone(&started_with),
        };
        let handle = BackendHandle {
            inner,
            initial_metadata: Some(md_tx),
            messages: Some(messages_tx),
            received: received_rx,
            status: Some(status_tx),
            gate: Some(gate_tx),
            started_with,
        };
        (stub, handle)
    }
}

impl UpstreamStub for MockStub {
    type Call = MockUpstream;

    fn call(&self, method: &str, metadata: BackendMetadata) -> CallFuture<Result<MockUpstream, Status>> {
        self.events.push(Event::UpstreamStart);
        *self.started_with.lock().unwrap() = Some((method.to_string(), metadata));
        let call = self.call.lock().unwrap().take();
        let gate = self.gate.lock().unwrap().take();
        let mode = self.mode;
        Box::pin(async move {
            match mode {
                StartMode::Unavailable => return Err(Status::unavailable("connection refused")),
                StartMode::Gated => {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                }
                StartMode::Accept => {}
            }
            call.ok_or_else(|| Status::internal("mock backend already called"))
        })
    }
}

impl UpstreamCall for MockUpstream {
    fn read_initial_metadata(&self) -> CallFuture<Option<BackendMetadata>> {
        self.inner.events.push(Event::UpstreamInitialMetadata);
        let rx = self.inner.initial_metadata.lock().unwrap().take();
        let cancel = self.inner.cancel.clone();
        Box::pin(async move {
            let rx = rx?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                metadata = rx => metadata.ok(),
            }
        })
    }

    fn read(&self) -> CallFuture<Option<GrpcMessage>> {
        self.inner.events.push(Event::UpstreamRead);
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut messages = inner.messages.lock().await;
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => None,
                message = messages.recv() => message,
            }
        })
    }

    fn write(&self, message: GrpcMessage) -> CallFuture<bool> {
        self.inner
            .events
            .push(Event::UpstreamWrite(message.payload().clone()));
        let ok = !self.inner.reject_writes.load(Ordering::SeqCst)
            && !self.inner.cancel.is_cancelled()
            && self.inner.received.send(message).is_ok();
        Box::pin(async move { ok })
    }

    fn writes_done(&self) -> CallFuture<bool> {
        self.inner.events.push(Event::UpstreamWritesDone);
        Box::pin(async { true })
    }

    fn finish(&self) -> CallFuture<(Status, BackendMetadata)> {
        self.inner.events.push(Event::UpstreamFinish);
        let rx = self.inner.status.lock().unwrap().take();
        let cancel = self.inner.cancel.clone();
        Box::pin(async move {
            let cancelled = (Status::cancelled("call cancelled"), BackendMetadata::new());
            let Some(rx) = rx else {
                return cancelled;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => cancelled,
                status = rx => status.unwrap_or(cancelled),
            }
        })
    }

    fn try_cancel(&self) {
        self.inner.events.push(Event::UpstreamCancel);
        self.inner.cancel.cancel();
    }
}

impl BackendHandle {
    pub fn release_start(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    pub fn send_initial_metadata(&mut self, metadata: BackendMetadata) {
        if let Some(tx) = self.initial_metadata.take() {
            let _ = tx.send(metadata);
        }
    }

    /// Drop the initial metadata so the read fails.
    pub fn fail_initial_metadata(&mut self) {
        self.initial_metadata.take();
    }

    pub fn send(&self, message: GrpcMessage) {
        if let Some(tx) = &self.messages {
            let _ = tx.send(message);
        }
    }

    /// End the response stream with `status` and `trailers`.
    pub fn finish(&mut self, status: Status, trailers: BackendMetadata) {
        self.messages.take();
        if let Some(tx) = self.status.take() {
            let _ = tx.send((status, trailers));
        }
    }

    pub fn reject_writes(&self) {
        self.inner.reject_writes.store(true, Ordering::SeqCst);
    }

    pub async fn next_received(&mut self) -> Option<GrpcMessage> {
        within(self.received.recv()).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Method and metadata the flow started the call with.
    pub fn started_with(&self) -> Option<(String, BackendMetadata)> {
        self.started_with.lock().unwrap().clone()
    }
}

/// One flow over the doubles.
pub struct Harness {
    pub queue: AsyncQueue,
    pub events: EventLog,
    pub client: ClientHandle,
    pub backend: BackendHandle,
}

impl Harness {
    pub fn start(mode: StartMode) -> Self {
        Self::start_with_headers(mode, &ClientMetadata::new())
    }

    pub fn start_with_headers(mode: StartMode, headers: &ClientMetadata) -> Self {
        let queue = AsyncQueue::current();
        let events = EventLog::default();
        let (client, client_handle) = MockClient::new(events.clone());
        let (stub, backend) = MockStub::new(events.clone(), mode);

        rpc_gateway::grpc::ProxyFlow::<MockClient, MockUpstream>::start(
            &queue,
            client,
            &stub,
            "/echo.Echo/Chat",
            headers,
            Arc::new(rpc_gateway::grpc::NoopMetering),
        );

        Self {
            queue,
            events,
            client: client_handle,
            backend,
        }
    }

    /// True once the flow and all of its operations are gone.
    pub async fn released(&self) -> bool {
        let queue = self.queue.clone();
        wait_until(Duration::from_secs(5), move || {
            queue.flows().live_count() == 0 && queue.pending() == 0
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Real sockets
// ---------------------------------------------------------------------------

type ResponseFrame = Result<Frame<Bytes>, Infallible>;
type EchoBody = StreamBody<ReceiverStream<ResponseFrame>>;

fn echo_headers(request: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/grpc"));
    for key in ["x-trace", "x-trace-bin", "x-empty-bin"] {
        if let Some(value) = request.get(key) {
            headers.insert(key, value.clone());
        }
    }
    headers
}

/// How the echo backend's request bodies ended.
#[derive(Debug, Default)]
pub struct EchoStats {
    completed: AtomicUsize,
    reset: AtomicUsize,
}

impl EchoStats {
    /// Calls whose request body ended with END_STREAM.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Calls whose request body was reset by the gateway.
    pub fn reset(&self) -> usize {
        self.reset.load(Ordering::SeqCst)
    }
}

async fn echo_service(
    request: Request<Incoming>,
    stats: Arc<EchoStats>,
) -> Result<Response<EchoBody>, Infallible> {
    let (tx, rx) = mpsc::channel::<ResponseFrame>(16);
    let headers = echo_headers(request.headers());
    let path = request.uri().path().to_string();

    let mut response = Response::new(StreamBody::new(ReceiverStream::new(rx)));
    *response.headers_mut() = headers;

    if path == "/echo.Echo/Fail" {
        // Trailers-only answer.
        let headers = response.headers_mut();
        headers.insert("grpc-status", HeaderValue::from_static("5"));
        headers.insert("grpc-message", HeaderValue::from_static("no such thing"));
        return Ok(response);
    }

    let mut body = request.into_body();
    tokio::spawn(async move {
        let mut decoder = MessageDecoder::default();
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    decoder.push(&data);
                    while let Ok(Some(message)) = decoder.decode() {
                        if tx.send(Ok(Frame::data(message.encode().unwrap()))).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(_)) => {
                    stats.reset.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                None => break,
            }
        }
        stats.completed.fetch_add(1, Ordering::SeqCst);
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("x-backend-trailer", HeaderValue::from_static("done"));
        let _ = tx.send(Ok(Frame::trailers(trailers))).await;
    });
    Ok(response)
}

/// HTTP/2 gRPC backend that echoes every message of `/echo.Echo/*` calls
/// and answers `/echo.Echo/Fail` with `NOT_FOUND`.
pub async fn start_echo_backend() -> SocketAddr {
    start_observed_echo_backend().await.0
}

/// Echo backend that also reports how each request body ended.
pub async fn start_observed_echo_backend() -> (SocketAddr, Arc<EchoStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(EchoStats::default());
    let shared = Arc::clone(&stats);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let stats = Arc::clone(&shared);
            tokio::spawn(async move {
                let service = service_fn(move |request| echo_service(request, Arc::clone(&stats)));
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr, stats)
}

/// An address with nothing listening.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state: AppState = Arc::new(GatewayState::new(&config, AsyncQueue::current()));
    let shutdown = CancellationToken::new();

    let server = HttpServer::new(Arc::clone(&state));
    tokio::spawn(server.run(listener, shutdown.clone()));

    TestGateway { addr, state, shutdown }
}

pub fn gateway_config(override_backend: Option<SocketAddr>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.grpc.backend_address_override = override_backend.map(|addr| addr.to_string());
    config.grpc.connect_timeout_ms = 500;
    config
}

pub type ClientFrame = Result<Frame<Bytes>, Infallible>;
pub type StreamingBody = StreamBody<ReceiverStream<ClientFrame>>;

/// HTTP/2 client whose request bodies are fed message by message.
/// Aborting the returned task tears the connection down.
pub async fn h2_streaming_client(
    addr: SocketAddr,
) -> (SendRequest<StreamingBody>, tokio::task::JoinHandle<()>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, connection) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
        .await
        .unwrap();
    let task = tokio::spawn(async move {
        let _ = connection.await;
    });
    (sender, task)
}

/// gRPC request head for `path` carrying `body`.
pub fn grpc_request<B>(authority: SocketAddr, path: &str, body: B) -> Request<B> {
    Request::builder()
        .method("POST")
        .uri(format!("http://{authority}{path}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(body)
        .unwrap()
}

pub async fn h2_client(addr: SocketAddr) -> SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, connection) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);
    sender
}

/// Everything the client observed for one call.
#[derive(Debug)]
pub struct CallResult {
    pub http_status: StatusCode,
    pub headers: HeaderMap,
    pub messages: Vec<GrpcMessage>,
    /// Trailers, or the response headers for a trailers-only answer.
    pub trailers: HeaderMap,
}

impl CallResult {
    pub fn grpc_status(&self) -> Option<&str> {
        self.trailers.get("grpc-status").and_then(|v| v.to_str().ok())
    }

    pub fn grpc_message(&self) -> Option<&str> {
        self.trailers.get("grpc-message").and_then(|v| v.to_str().ok())
    }
}

/// Send `messages` on `path`, half-close, and collect the response.
pub async fn grpc_call(
    sender: &mut SendRequest<Full<Bytes>>,
    authority: SocketAddr,
    path: &str,
    headers: &[(&'static str, &'static str)],
    messages: &[GrpcMessage],
) -> CallResult {
    let mut body = Vec::new();
    for message in messages {
        body.extend_from_slice(&message.encode().unwrap());
    }

    let mut request = grpc_request(authority, path, Full::new(Bytes::from(body)));
    for (key, value) in headers {
        request
            .headers_mut()
            .insert(*key, HeaderValue::from_static(*value));
    }

    within(sender.ready()).await.unwrap();
    let response = within(sender.send_request(request)).await.unwrap();
    let (parts, body) = response.into_parts();
    let collected = within(body.collect()).await.unwrap();
    let trailers = collected
        .trailers()
        .cloned()
        .unwrap_or_else(|| parts.headers.clone());

    let mut decoder = MessageDecoder::default();
    decoder.push(&collected.to_bytes());
    let mut decoded = Vec::new();
    while let Some(message) = decoder.decode().unwrap() {
        decoded.push(message);
    }

    CallResult {
        http_status: parts.status,
        headers: parts.headers,
        messages: decoded,
        trailers,
    }
}
