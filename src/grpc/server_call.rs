//! Client-facing call over an HTTP/2 request accepted by axum.
//!
//! # Data Flow
//! ```text
//! request body ──frames──▶ MessageDecoder ──▶ read()
//!
//! send_initial_metadata() ──▶ PendingResponse resolves ──▶ response headers
//! write() ──▶ data channel ──▶ response body DATA frames
//! finish() ──▶ trailers channel ──▶ response body TRAILERS frame
//! finish() before any headers ──▶ trailers-only response
//! ```
//!
//! The handler holds the [`PendingResponse`] until the flow either sends
//! headers or finishes, then hands the streaming body to hyper. Hyper dropping
//! that body (client reset or disconnect) closes the data channel, which is
//! what [`ServerCall::closed`] observes.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream;
use http::HeaderMap;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::sync::{mpsc, oneshot};

use crate::grpc::call::{CallFuture, ReadOutcome, ServerCall};
use crate::grpc::framing::{GrpcMessage, MessageDecoder};
use crate::grpc::metadata::ClientMetadata;
use crate::grpc::status::Status;
use crate::http::response::{grpc_response, trailers_only};

/// What the handler should answer with.
#[derive(Debug)]
enum ResponseHead {
    Headers(ClientMetadata),
    TrailersOnly(Status, ClientMetadata),
}

/// [`ServerCall`] backed by an axum request body and a streaming response.
#[derive(Clone)]
pub struct HyperServerCall {
    inner: Arc<Inner>,
}

struct Inner {
    reader: tokio::sync::Mutex<RequestReader>,
    head: Mutex<Option<oneshot::Sender<ResponseHead>>>,
    data: Mutex<Option<mpsc::Sender<Bytes>>>,
    trailers: Mutex<Option<oneshot::Sender<HeaderMap>>>,
    finished: AtomicBool,
}

struct RequestReader {
    body: Body,
    decoder: MessageDecoder,
    ended: bool,
}

/// Response half held by the handler until the flow decides the headers.
pub struct PendingResponse {
    head: oneshot::Receiver<ResponseHead>,
    data: mpsc::Receiver<Bytes>,
    trailers: oneshot::Receiver<HeaderMap>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HyperServerCall {
    /// Wrap a request body. `buffer` bounds the response messages queued ahead of hyper.
    pub fn new(body: Body, max_message_len: usize, buffer: usize) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(buffer.max(1));
        let (trailers_tx, trailers_rx) = oneshot::channel();

        let call = Self {
            inner: Arc::new(Inner {
                reader: tokio::sync::Mutex::new(RequestReader {
                    body,
                    decoder: MessageDecoder::new(max_message_len),
                    ended: false,
                }),
                head: Mutex::new(Some(head_tx)),
                data: Mutex::new(Some(data_tx)),
                trailers: Mutex::new(Some(trailers_tx)),
                finished: AtomicBool::new(false),
            }),
        };
        let pending = PendingResponse {
            head: head_rx,
            data: data_rx,
            trailers: trailers_rx,
        };
        (call, pending)
    }
}

impl Inner {
    /// Resolve the pending response. Returns false if it was already resolved.
    fn send_head(&self, head: ResponseHead) -> bool {
        match lock(&self.head).take() {
            Some(tx) => tx.send(head).is_ok(),
            None => false,
        }
    }

    fn head_sent(&self) -> bool {
        lock(&self.head).is_none()
    }

    fn data_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        lock(&self.data).clone()
    }
}

impl RequestReader {
    async fn next_message(&mut self) -> ReadOutcome {
        loop {
            match self.decoder.decode() {
                Ok(Some(message)) if message.is_compressed() => {
                    return ReadOutcome::Failed(Status::unimplemented(
                        "compressed messages are not supported",
                    ));
                }
                Ok(Some(message)) => return ReadOutcome::Message(message),
                Ok(None) => {}
                Err(err) => return ReadOutcome::Failed(err.into()),
            }

            if self.ended {
                return match self.decoder.finish() {
                    Ok(()) => ReadOutcome::EndOfStream,
                    Err(err) => ReadOutcome::Failed(err.into()),
                };
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    // Request trailers carry nothing the backend needs.
                    if let Ok(data) = frame.into_data() {
                        self.decoder.push(&data);
                    }
                }
                Some(Err(err)) => {
                    return ReadOutcome::Failed(Status::cancelled(format!(
                        "client stream failed: {err}"
                    )));
                }
                None => self.ended = true,
            }
        }
    }
}

impl ServerCall for HyperServerCall {
    fn send_initial_metadata(&self, metadata: ClientMetadata) -> CallFuture<bool> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            !inner.finished.load(Ordering::Acquire)
                && inner.send_head(ResponseHead::Headers(metadata))
        })
    }

    fn read(&self) -> CallFuture<ReadOutcome> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.reader.lock().await.next_message().await })
    }

    fn write(&self, message: GrpcMessage) -> CallFuture<bool> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if inner.finished.load(Ordering::Acquire) {
                return false;
            }
            // Headers must precede the first message.
            if !inner.head_sent() && !inner.send_head(ResponseHead::Headers(ClientMetadata::new())) {
                return false;
            }
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot frame response message");
                    return false;
                }
            };
            match inner.data_sender() {
                Some(tx) => tx.send(frame).await.is_ok(),
                None => false,
            }
        })
    }

    fn finish(&self, status: Status, trailers: ClientMetadata) {
        let inner = &self.inner;
        if inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        // Ends the data stream once in-flight writes drop their senders.
        lock(&inner.data).take();

        if !inner.head_sent() {
            inner.send_head(ResponseHead::TrailersOnly(status, trailers));
            return;
        }

        let mut map = HeaderMap::new();
        status.write_headers(&mut map);
        trailers.extend_header_map(&mut map);
        if let Some(tx) = lock(&inner.trailers).take() {
            let _ = tx.send(map);
        }
    }

    fn closed(&self) -> CallFuture<()> {
        let tx = self.inner.data_sender();
        Box::pin(async move {
            match tx {
                Some(tx) => tx.closed().await,
                None => std::future::pending().await,
            }
        })
    }
}

enum BodyState {
    Streaming(mpsc::Receiver<Bytes>, oneshot::Receiver<HeaderMap>),
    Done,
}

impl PendingResponse {
    /// Wait until the flow decides how the response starts.
    pub async fn into_response(self) -> Response {
        let head = match self.head.await {
            Ok(head) => head,
            Err(_) => {
                return trailers_only(
                    &Status::internal("call ended without a response"),
                    &ClientMetadata::new(),
                )
            }
        };

        match head {
            ResponseHead::TrailersOnly(status, trailers) => trailers_only(&status, &trailers),
            ResponseHead::Headers(metadata) => {
                let frames = stream::unfold(
                    BodyState::Streaming(self.data, self.trailers),
                    |state| async move {
                        let BodyState::Streaming(mut data, trailers) = state else {
                            return None;
                        };
                        match data.recv().await {
                            Some(chunk) => Some((
                                Ok::<_, Infallible>(Frame::data(chunk)),
                                BodyState::Streaming(data, trailers),
                            )),
                            None => trailers
                                .await
                                .ok()
                                .map(|map| (Ok(Frame::trailers(map)), BodyState::Done)),
                        }
                    },
                );
                grpc_response(Body::new(StreamBody::new(frames)), &metadata)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::status::{Code, GRPC_MESSAGE, GRPC_STATUS};

    fn request_body(messages: &[&'static [u8]]) -> Body {
        let mut bytes = Vec::new();
        for message in messages {
            bytes.extend_from_slice(&GrpcMessage::new(Bytes::from_static(message)).encode().unwrap());
        }
        Body::from(bytes)
    }

    #[tokio::test]
    async fn reads_messages_then_end_of_stream() {
        let (call, _pending) = HyperServerCall::new(request_body(&[b"one", b"two"]), 1024, 4);

        assert_eq!(
            call.read().await,
            ReadOutcome::Message(GrpcMessage::new(Bytes::from_static(b"one")))
        );
        assert_eq!(
            call.read().await,
            ReadOutcome::Message(GrpcMessage::new(Bytes::from_static(b"two")))
        );
        assert_eq!(call.read().await, ReadOutcome::EndOfStream);
    }

    #[tokio::test]
    async fn truncated_request_is_a_read_failure() {
        let (call, _pending) = HyperServerCall::new(Body::from(vec![0u8, 0, 0, 0, 9, 1]), 1024, 4);
        match call.read().await {
            ReadOutcome::Failed(status) => assert_eq!(status.code(), Code::Internal),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_before_headers_is_trailers_only() {
        let (call, pending) = HyperServerCall::new(Body::empty(), 1024, 4);
        call.finish(Status::unavailable("upstream backend unavailable"), ClientMetadata::new());

        let response = pending.into_response().await;
        assert_eq!(response.headers().get(GRPC_STATUS).unwrap(), "14");
        assert_eq!(
            response.headers().get(GRPC_MESSAGE).unwrap(),
            "upstream backend unavailable"
        );
        assert!(!call.send_initial_metadata(ClientMetadata::new()).await);
    }

    #[tokio::test]
    async fn streams_messages_then_trailers() {
        let (call, pending) = HyperServerCall::new(Body::empty(), 1024, 4);
        let headers: ClientMetadata = [("x-trace", "abc".to_string())].into_iter().collect();
        assert!(call.send_initial_metadata(headers).await);

        let response = pending.into_response().await;
        assert_eq!(response.headers().get("x-trace").unwrap(), "abc");
        assert_eq!(response.headers().get("content-type").unwrap(), "application/grpc");

        assert!(call.write(GrpcMessage::new(Bytes::from_static(b"hi"))).await);
        let trailers: ClientMetadata = [("x-cost", "7".to_string())].into_iter().collect();
        call.finish(Status::ok(), trailers);
        assert!(!call.write(GrpcMessage::new(Bytes::from_static(b"late"))).await);

        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(&collected.to_bytes()[..], &[0, 0, 0, 0, 2, b'h', b'i']);
        assert_eq!(trailers.get(GRPC_STATUS).unwrap(), "0");
        assert_eq!(trailers.get("x-cost").unwrap(), "7");
    }

    #[tokio::test]
    async fn dropping_the_response_reports_closed() {
        let (call, pending) = HyperServerCall::new(Body::empty(), 1024, 4);
        assert!(call.send_initial_metadata(ClientMetadata::new()).await);
        let response = pending.into_response().await;

        let closed = call.closed();
        drop(response);
        tokio::time::timeout(std::time::Duration::from_secs(1), closed)
            .await
            .unwrap();
    }
}
