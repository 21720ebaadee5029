//! Drives a streaming response through the decoder into a handler
//!
//! The read loop runs on its own task. `StreamHandle::cancel` stops it: the
//! response body is dropped, which closes the connection, and no callback
//! fires after cancellation is observed. Dropping the handle without
//! cancelling leaves the stream running to completion.

use std::future::Future;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::decoder::{SseDecoder, StreamEvent};
use crate::error::StreamError;

/// Receives decoded stream events in arrival order.
///
/// `on_complete` fires at most once and nothing follows it. `on_error` may
/// fire for server `error` frames without ending the stream; for connection
/// and status failures it is the last callback.
pub trait StreamHandler: Send + 'static {
    fn on_message(&mut self, text: String);
    fn on_error(&mut self, error: StreamError);
    fn on_complete(&mut self);
}

/// Forward events into a channel. Send failures mean the receiver went away
/// and are ignored.
impl StreamHandler for mpsc::UnboundedSender<StreamEvent> {
    fn on_message(&mut self, text: String) {
        let _ = self.send(StreamEvent::Message(text));
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.send(StreamEvent::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.send(StreamEvent::Complete);
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Completed,
    Errored,
    Cancelled,
}

impl StreamState {
    fn label(self) -> &'static str {
        match self {
            StreamState::Completed => "completed",
            StreamState::Errored => "errored",
            StreamState::Cancelled => "cancelled",
        }
    }
}

/// Handle to a running stream.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<StreamState>,
}

impl StreamHandle {
    /// Stop reading. Idempotent; a no-op once the stream has ended.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this stream, for handing to other tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the stream to end.
    pub async fn finished(self) -> StreamState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "stream task failed");
                StreamState::Errored
            }
        }
    }
}

/// Open a stream with `connect` and feed it to `handler` on a new task.
pub fn spawn<C, H>(connect: C, handler: H) -> StreamHandle
where
    C: Future<Output = Result<reqwest::Response, StreamError>> + Send + 'static,
    H: StreamHandler,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut handler = handler;
        let state = tokio::select! {
            biased;
            _ = token.cancelled() => StreamState::Cancelled,
            state = run(connect, &mut handler, &token) => state,
        };
        debug!(outcome = state.label(), "stream finished");
        metrics::counter!("api_streams_total", "outcome" => state.label()).increment(1);
        state
    });
    StreamHandle { cancel, task }
}

async fn run<C, H>(connect: C, handler: &mut H, cancel: &CancellationToken) -> StreamState
where
    C: Future<Output = Result<reqwest::Response, StreamError>>,
    H: StreamHandler,
{
    let response = match connect.await {
        Ok(response) => response,
        Err(error) => {
            return emit(handler, cancel, StreamEvent::Error(error)).unwrap_or(StreamState::Errored);
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let error = StreamError::status(status.as_u16(), &body);
        return emit(handler, cancel, StreamEvent::Error(error)).unwrap_or(StreamState::Errored);
    }

    consume(response, handler, cancel).await
}

/// Read an already-successful response to the end.
pub async fn consume<H: StreamHandler>(
    response: reqwest::Response,
    handler: &mut H,
    cancel: &CancellationToken,
) -> StreamState {
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let error = StreamError::transport(format!("stream read failed: {e}"));
                return emit(handler, cancel, StreamEvent::Error(error))
                    .unwrap_or(StreamState::Errored);
            }
        };
        for event in decoder.feed(&chunk) {
            if let Some(end) = emit(handler, cancel, event) {
                return end;
            }
        }
    }

    for event in decoder.finish() {
        if let Some(end) = emit(handler, cancel, event) {
            return end;
        }
    }
    StreamState::Completed
}

/// Deliver one event. Returns the terminal state if the stream is over.
fn emit<H: StreamHandler>(
    handler: &mut H,
    cancel: &CancellationToken,
    event: StreamEvent,
) -> Option<StreamState> {
    if cancel.is_cancelled() {
        return Some(StreamState::Cancelled);
    }
    match event {
        StreamEvent::Message(text) => handler.on_message(text),
        StreamEvent::Error(error) => handler.on_error(error),
        StreamEvent::Complete => {
            handler.on_complete();
            return Some(StreamState::Completed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamErrorKind;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::time::Duration;

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn chunked(chunks: Vec<&'static str>) -> Body {
        Body::from_stream(futures_util::stream::iter(
            chunks.into_iter().map(Ok::<_, std::io::Error>),
        ))
    }

    fn connect(url: String) -> impl Future<Output = Result<reqwest::Response, StreamError>> {
        async move {
            reqwest::Client::new()
                .get(url)
                .send()
                .await
                .map_err(|e| StreamError::connect(e.to_string()))
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn tokens_split_across_chunks_arrive_whole() {
        let router = Router::new().route(
            "/stream",
            get(|| async {
                chunked(vec![
                    "data: {\"type\":\"start\"}\n\ndata: {\"type\":\"token\",\"content\":\"he",
                    "llo\"}\n\ndata: {\"type\":\"token\",\"content\":\" world\"}\n\n",
                    "data: [DONE]\n\n",
                ])
            }),
        );
        let base = serve(router).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn(connect(format!("{base}/stream")), tx);

        assert_eq!(handle.finished().await, StreamState::Completed);
        assert_eq!(
            collect(rx).await,
            vec![
                StreamEvent::Message("hello".into()),
                StreamEvent::Message(" world".into()),
                StreamEvent::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn eof_without_done_still_completes_once() {
        let router = Router::new().route(
            "/stream",
            get(|| async { chunked(vec!["data: {\"type\":\"token\",\"content\":\"x\"}"]) }),
        );
        let base = serve(router).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let state = spawn(connect(format!("{base}/stream")), tx).finished().await;

        assert_eq!(state, StreamState::Completed);
        assert_eq!(
            collect(rx).await,
            vec![StreamEvent::Message("x".into()), StreamEvent::Complete]
        );
    }

    #[tokio::test]
    async fn error_status_reports_once_without_completing() {
        let router = Router::new().route(
            "/stream",
            get(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(serde_json::json!({"detail": "slow down"})),
                )
                    .into_response()
            }),
        );
        let base = serve(router).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let state = spawn(connect(format!("{base}/stream")), tx).finished().await;

        assert_eq!(state, StreamState::Errored);
        let events = collect(rx).await;
        match events.as_slice() {
            [StreamEvent::Error(err)] => {
                assert_eq!(err.kind, StreamErrorKind::Status(429));
                assert!(err.message.contains("slow down"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failure_reports_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let failing = async { Err(StreamError::connect("refused")) };
        assert_eq!(spawn(failing, tx).finished().await, StreamState::Errored);

        let events = collect(rx).await;
        assert_eq!(events, vec![StreamEvent::Error(StreamError::connect("refused"))]);
    }

    #[tokio::test]
    async fn server_error_frame_is_delivered_mid_stream() {
        let router = Router::new().route(
            "/stream",
            get(|| async {
                chunked(vec![
                    "data: {\"type\":\"error\",\"message\":\"quota\",\"is_quota_error\":true,\"error_code\":\"Q1\"}\n",
                    "data: [DONE]\n",
                ])
            }),
        );
        let base = serve(router).await;

        let (tx, rx) = mpsc::unbounded_channel();
        spawn(connect(format!("{base}/stream")), tx).finished().await;

        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Error(err) => {
                assert!(err.is_quota_error());
                assert_eq!(err.error_code(), Some(&serde_json::json!("Q1")));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(events[1], StreamEvent::Complete);
    }

    #[tokio::test]
    async fn cancel_stops_callbacks() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<&'static str>();
        let chunk_rx = std::sync::Arc::new(tokio::sync::Mutex::new(Some(chunk_rx)));

        let router = Router::new().route(
            "/stream",
            get(move || {
                let chunk_rx = chunk_rx.clone();
                async move {
                    let rx = chunk_rx.lock().await.take().unwrap();
                    let body = futures_util::stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|c| (Ok::<_, std::io::Error>(c), rx))
                    });
                    Body::from_stream(body)
                }
            }),
        );
        let base = serve(router).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(connect(format!("{base}/stream")), tx);

        chunk_tx.send("data: first\n").unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Message("first".into())));

        handle.cancel();
        let _ = chunk_tx.send("data: second\n");
        let _ = chunk_tx.send("data: [DONE]\n");

        assert_eq!(handle.finished().await, StreamState::Cancelled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rx.try_recv().ok(), None);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_harmless() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = spawn(async { Err(StreamError::connect("nope")) }, tx);
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.finished().await, StreamState::Errored);
    }
}
