//! Backend-facing calls over a shared HTTP/2 connection.
//!
//! # Responsibilities
//! - Connect lazily to one backend address and reconnect after the
//!   connection drops
//! - Open one HTTP/2 stream per proxied call
//! - Stream request messages as DATA frames, half-close on `writes_done`
//! - Decode response messages and read the terminal status from trailers
//!
//! # Design Decisions
//! - One multiplexed connection per backend, shared by every call through
//!   [`StubMap`](crate::grpc::stub_map::StubMap)
//! - Failures are recorded on the call and reported once, by `finish`
//! - Cancellation resolves every pending operation as a failure and resets
//!   the stream when the response body is dropped

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, TE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::GrpcConfig;
use crate::grpc::call::{CallFuture, UpstreamCall, UpstreamStub};
use crate::grpc::framing::{GrpcMessage, MessageDecoder};
use crate::grpc::metadata::BackendMetadata;
use crate::grpc::status::{Code, Status};
use crate::http::request::is_grpc_content_type;
use crate::http::response::{GRPC_ACCEPT_ENCODING, GRPC_CONTENT_TYPE};

type RequestFrame = Result<Frame<Bytes>, Infallible>;

/// Request body streamed to the backend.
pub type UpstreamBody = StreamBody<ReceiverStream<RequestFrame>>;

type ResponseFuture = Pin<Box<dyn Future<Output = hyper::Result<Response<Incoming>>> + Send>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport limits shared by every backend channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub connect_timeout: Duration,
    pub max_message_len: usize,
    pub stream_buffer: usize,
}

impl From<&GrpcConfig> for ChannelSettings {
    fn from(config: &GrpcConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_message_len: config.max_message_bytes,
            stream_buffer: config.stream_buffer.max(1),
        }
    }
}

/// Lazily connected HTTP/2 channel to one backend.
#[derive(Clone)]
pub struct GrpcChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    address: String,
    settings: ChannelSettings,
    sender: tokio::sync::Mutex<Option<SendRequest<UpstreamBody>>>,
}

impl GrpcChannel {
    pub fn new(address: impl Into<String>, settings: ChannelSettings) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                address: address.into(),
                settings,
                sender: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Whether an open connection exists. Reports `false` while connecting.
    pub fn is_connected(&self) -> bool {
        match self.inner.sender.try_lock() {
            Ok(sender) => sender.as_ref().is_some_and(|s| !s.is_closed()),
            Err(_) => false,
        }
    }
}

impl ChannelInner {
    async fn ready_sender(&self) -> Result<SendRequest<UpstreamBody>, Status> {
        let mut slot = self.sender.lock().await;
        if let Some(sender) = slot.as_ref() {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
            tracing::debug!(backend = %self.address, "backend connection closed, reconnecting");
        }
        let sender = self.connect().await?;
        *slot = Some(sender.clone());
        Ok(sender)
    }

    async fn connect(&self) -> Result<SendRequest<UpstreamBody>, Status> {
        let stream = match tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(self.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::warn!(backend = %self.address, error = %err, "backend connect failed");
                return Err(Status::unavailable(format!(
                    "connect to {} failed: {err}",
                    self.address
                )));
            }
            Err(_) => {
                tracing::warn!(backend = %self.address, "backend connect timed out");
                return Err(Status::unavailable(format!(
                    "connect to {} timed out",
                    self.address
                )));
            }
        };
        let _ = stream.set_nodelay(true);

        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .map_err(|err| {
                Status::unavailable(format!("HTTP/2 handshake with {} failed: {err}", self.address))
            })?;

        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(backend = %address, error = %err, "backend connection ended");
            }
        });

        tracing::info!(backend = %self.address, "connected to backend");
        Ok(sender)
    }
}

fn build_request(
    address: &str,
    method: &str,
    metadata: &BackendMetadata,
    body: UpstreamBody,
) -> Result<Request<UpstreamBody>, Status> {
    let uri = Uri::builder()
        .scheme("http")
        .authority(address)
        .path_and_query(method)
        .build()
        .map_err(|err| Status::internal(format!("invalid backend uri: {err}")))?;

    let mut request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .version(Version::HTTP_2)
        .body(body)
        .map_err(|err| Status::internal(format!("invalid backend request: {err}")))?;

    let headers = request.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    headers.insert(TE, HeaderValue::from_static("trailers"));
    headers.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    metadata.extend_header_map(headers);
    Ok(request)
}

impl UpstreamStub for GrpcChannel {
    type Call = HyperUpstreamCall;

    fn call(&self, method: &str, metadata: BackendMetadata) -> CallFuture<Result<HyperUpstreamCall, Status>> {
        let inner = Arc::clone(&self.inner);
        let method = method.to_string();
        Box::pin(async move {
            let mut sender = inner.ready_sender().await?;
            sender.ready().await.map_err(|err| {
                Status::unavailable(format!("backend {} not ready: {err}", inner.address))
            })?;

            let (tx, rx) = mpsc::channel(inner.settings.stream_buffer);
            let body = StreamBody::new(ReceiverStream::new(rx));
            let request = build_request(&inner.address, &method, &metadata, body)?;
            let response: ResponseFuture = Box::pin(sender.send_request(request));

            Ok(HyperUpstreamCall::new(tx, response, inner.settings.max_message_len))
        })
    }
}

/// One HTTP/2 stream to a backend.
#[derive(Clone)]
pub struct HyperUpstreamCall {
    inner: Arc<CallInner>,
}

struct CallInner {
    writer: Mutex<Option<mpsc::Sender<RequestFrame>>>,
    reader: tokio::sync::Mutex<ResponseReader>,
    cancel: CancellationToken,
}

struct ResponseReader {
    response: Option<ResponseFuture>,
    body: Option<Incoming>,
    decoder: MessageDecoder,
    initial_metadata: Option<BackendMetadata>,
    trailers: Option<HeaderMap>,
    failure: Option<Status>,
}

enum BodyEvent {
    Cancelled,
    Frame(Frame<Bytes>),
    Error(hyper::Error),
    End,
}

impl HyperUpstreamCall {
    fn new(writer: mpsc::Sender<RequestFrame>, response: ResponseFuture, max_message_len: usize) -> Self {
        Self {
            inner: Arc::new(CallInner {
                writer: Mutex::new(Some(writer)),
                reader: tokio::sync::Mutex::new(ResponseReader {
                    response: Some(response),
                    body: None,
                    decoder: MessageDecoder::new(max_message_len),
                    initial_metadata: None,
                    trailers: None,
                    failure: None,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

impl ResponseReader {
    /// Record the first failure and stop reading.
    fn fail(&mut self, status: Status) {
        self.failure.get_or_insert(status);
        self.body = None;
    }

    /// Wait for the response head, once.
    async fn await_head(&mut self, cancel: &CancellationToken) {
        let Some(response) = self.response.take() else {
            return;
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = response => Some(result),
        };

        let response = match result {
            None => return self.fail(Status::cancelled("backend call cancelled")),
            Some(Err(err)) => {
                return self.fail(Status::unavailable(format!("backend request failed: {err}")))
            }
            Some(Ok(response)) => response,
        };

        let (parts, body) = response.into_parts();
        // A response head always counts as initial metadata, even when the
        // call has already failed at the HTTP layer.
        if parts.status != StatusCode::OK {
            self.initial_metadata = Some(BackendMetadata::new());
            return self.fail(Status::new(
                Code::from_http_status(parts.status),
                format!("backend responded with HTTP {}", parts.status),
            ));
        }
        if Status::from_headers(&parts.headers).is_some() {
            self.initial_metadata = Some(BackendMetadata::new());
            self.trailers = Some(parts.headers);
            return;
        }
        if !is_grpc_content_type(&parts.headers) {
            self.initial_metadata = Some(BackendMetadata::new());
            return self.fail(Status::unknown("backend responded without a gRPC content-type"));
        }

        self.initial_metadata = Some(BackendMetadata::from_header_map(&parts.headers));
        self.body = Some(body);
    }

    async fn next_message(&mut self, cancel: &CancellationToken) -> Option<GrpcMessage> {
        loop {
            if self.failure.is_some() {
                return None;
            }
            match self.decoder.decode() {
                Ok(Some(message)) if message.is_compressed() => {
                    self.fail(Status::internal("backend sent a compressed message"));
                    return None;
                }
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(err) => {
                    self.fail(err.into());
                    return None;
                }
            }

            let Some(body) = self.body.as_mut() else {
                if let Err(err) = self.decoder.finish() {
                    self.fail(err.into());
                }
                return None;
            };
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => BodyEvent::Cancelled,
                frame = body.frame() => match frame {
                    Some(Ok(frame)) => BodyEvent::Frame(frame),
                    Some(Err(err)) => BodyEvent::Error(err),
                    None => BodyEvent::End,
                },
            };

            match event {
                BodyEvent::Cancelled => self.fail(Status::cancelled("backend call cancelled")),
                BodyEvent::Error(err) => {
                    self.fail(Status::unavailable(format!("backend stream failed: {err}")))
                }
                BodyEvent::End => self.body = None,
                BodyEvent::Frame(frame) => match frame.into_data() {
                    Ok(data) => self.decoder.push(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                        }
                    }
                },
            }
        }
    }

    fn terminal_status(&mut self) -> (Status, BackendMetadata) {
        let trailers = self.trailers.take();
        let metadata = trailers
            .as_ref()
            .map(BackendMetadata::from_header_map)
            .unwrap_or_default();

        if let Some(failure) = self.failure.clone() {
            return (failure, metadata);
        }
        match trailers.as_ref().and_then(Status::from_headers) {
            Some(status) => (status, metadata),
            None => (Status::unknown("backend stream ended without grpc-status"), metadata),
        }
    }
}

impl UpstreamCall for HyperUpstreamCall {
    fn read_initial_metadata(&self) -> CallFuture<Option<BackendMetadata>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut reader = inner.reader.lock().await;
            reader.await_head(&inner.cancel).await;
            reader.initial_metadata.clone()
        })
    }

    fn read(&self) -> CallFuture<Option<GrpcMessage>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut reader = inner.reader.lock().await;
            reader.await_head(&inner.cancel).await;
            reader.next_message(&inner.cancel).await
        })
    }

    fn write(&self, message: GrpcMessage) -> CallFuture<bool> {
        let writer = lock(&self.inner.writer).clone();
        let cancel = self.inner.cancel.clone();
        Box::pin(async move {
            let Some(writer) = writer else {
                return false;
            };
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot frame request message");
                    return false;
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = writer.send(Ok(Frame::data(frame))) => sent.is_ok(),
            }
        })
    }

    fn writes_done(&self) -> CallFuture<bool> {
        // Dropping the last sender ends the request body with END_STREAM.
        let was_open = lock(&self.inner.writer).take().is_some();
        Box::pin(async move { was_open })
    }

    fn finish(&self) -> CallFuture<(Status, BackendMetadata)> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut reader = inner.reader.lock().await;
            reader.await_head(&inner.cancel).await;
            while reader.next_message(&inner.cancel).await.is_some() {}
            reader.terminal_status()
        })
    }

    fn try_cancel(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.writer).take();
    }
}
