//! In-memory transport.
//!
//! Builds requests from byte chunks or a channel and records everything the
//! engine writes. Used by the test suite and by hosts that want to drive
//! calls without a network stack.

use super::{BodyStream, HttpRequest, ResponseSink};
use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use grpc::{Frame, FrameError, Metadata, MessageDecoder, Status, Timeout};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Builder for an [`HttpRequest`].
pub struct MemoryRequest {
    path: String,
    headers: Metadata,
    host: Option<String>,
    peer: Option<String>,
    chunks: Vec<io::Result<Bytes>>,
    stream: Option<BodyStream>,
}

impl MemoryRequest {
    /// A request for `path` with `content-type: application/grpc`.
    pub fn new(path: impl Into<String>) -> Self {
        let mut headers = Metadata::new();
        headers.insert("content-type", "application/grpc");
        Self {
            path: path.into(),
            headers,
            host: Some("localhost".to_string()),
            peer: Some("127.0.0.1:50000".to_string()),
            chunks: Vec::new(),
            stream: None,
        }
    }

    /// Set a header, replacing earlier values.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn without_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    /// Set `grpc-timeout`.
    pub fn timeout(self, timeout: Duration) -> Self {
        let value = Timeout::from_duration(timeout).to_header_value();
        self.header(grpc::timeout::GRPC_TIMEOUT, &value)
    }

    pub fn peer(mut self, peer: &str) -> Self {
        self.peer = Some(peer.to_string());
        self
    }

    /// Append one uncompressed message frame to the body. A payload that
    /// can't be framed fails the body at that point.
    pub fn message(mut self, payload: &[u8]) -> Self {
        self.chunks.push(grpc::encode_message(payload).map_err(io::Error::other));
        self
    }

    /// Append raw body bytes.
    pub fn chunk(mut self, data: impl Into<Bytes>) -> Self {
        self.chunks.push(Ok(data.into()));
        self
    }

    /// Switch to a channel-fed body. Chunks added so far are sent first.
    pub fn streaming(mut self) -> (Self, BodySender) {
        let (tx, rx) = mpsc::unbounded();
        let chunks = std::mem::take(&mut self.chunks);
        let prefix = stream::iter(chunks);
        self.stream = Some(Box::pin(prefix.chain(rx)));
        (self, BodySender { tx })
    }

    /// Finish the request. The returned token aborts the call as a client
    /// disconnect would.
    pub fn build(self) -> (HttpRequest, CancellationToken) {
        let aborted = CancellationToken::new();
        let body = match self.stream {
            Some(stream) => stream,
            None => {
                Box::pin(stream::iter(self.chunks)) as BodyStream
            }
        };
        let request = HttpRequest {
            path: self.path,
            headers: self.headers,
            host: self.host,
            peer: self.peer,
            body,
            aborted: aborted.clone(),
        };
        (request, aborted)
    }
}

/// Feeds a streaming request body. Dropping it ends the body.
#[derive(Clone)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
}

impl BodySender {
    /// Send one uncompressed message frame. Returns `false` if the request
    /// body was already dropped or the payload can't be framed.
    pub fn send_message(&self, payload: &[u8]) -> bool {
        match grpc::encode_message(payload) {
            Ok(frame) => self.send_raw(frame),
            Err(e) => {
                self.fail(io::Error::other(e));
                false
            }
        }
    }

    pub fn send_raw(&self, data: impl Into<Bytes>) -> bool {
        self.tx.unbounded_send(Ok(data.into())).is_ok()
    }

    /// Fail the body stream with a transport error.
    pub fn fail(&self, error: io::Error) {
        let _ = self.tx.unbounded_send(Err(error));
    }

    /// End the body.
    pub fn close(self) {
        self.tx.close_channel();
    }
}

/// One write observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Headers { http_status: u16, end_of_stream: bool },
    Data { len: usize, flush: bool },
    Trailers,
}

#[derive(Debug, Default)]
struct Recording {
    http_status: Option<u16>,
    headers: Option<Metadata>,
    trailers_only: bool,
    data: BytesMut,
    trailers: Option<Metadata>,
    events: Vec<SinkEvent>,
}

/// A [`ResponseSink`] that keeps everything written to it.
///
/// Protocol-order violations (data before headers, anything after the
/// trailers) fail the write.
pub struct RecordingSink {
    recording: Arc<Mutex<Recording>>,
    hold: watch::Receiver<bool>,
}

/// Read side of a [`RecordingSink`].
#[derive(Clone)]
pub struct RecordedResponse {
    recording: Arc<Mutex<Recording>>,
    hold: Arc<watch::Sender<bool>>,
}

/// Create a recording sink and its read handle.
pub fn recording_sink() -> (RecordingSink, RecordedResponse) {
    let recording = Arc::new(Mutex::new(Recording::default()));
    let (hold_tx, hold_rx) = watch::channel(false);
    (
        RecordingSink {
            recording: recording.clone(),
            hold: hold_rx,
        },
        RecordedResponse {
            recording,
            hold: Arc::new(hold_tx),
        },
    )
}

fn protocol_error(message: &str) -> io::Error {
    io::Error::other(message.to_string())
}

impl ResponseSink for RecordingSink {
    fn write_headers(
        &mut self,
        http_status: u16,
        headers: Metadata,
        end_of_stream: bool,
    ) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut rec = self.recording.lock();
            if rec.headers.is_some() {
                return Err(protocol_error("headers already written"));
            }
            rec.http_status = Some(http_status);
            rec.headers = Some(headers);
            rec.trailers_only = end_of_stream;
            rec.events.push(SinkEvent::Headers {
                http_status,
                end_of_stream,
            });
            Ok(())
        })
    }

    fn write_data(&mut self, data: Bytes, flush: bool) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            // Parks while the reader holds data writes back.
            if self.hold.wait_for(|held| !*held).await.is_err() {
                return Err(protocol_error("response reader dropped"));
            }
            let mut rec = self.recording.lock();
            if rec.headers.is_none() || rec.trailers_only || rec.trailers.is_some() {
                return Err(protocol_error("data written out of order"));
            }
            rec.events.push(SinkEvent::Data {
                len: data.len(),
                flush,
            });
            rec.data.extend_from_slice(&data);
            Ok(())
        })
    }

    fn write_trailers(&mut self, trailers: Metadata) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut rec = self.recording.lock();
            if rec.headers.is_none() || rec.trailers_only || rec.trailers.is_some() {
                return Err(protocol_error("trailers written out of order"));
            }
            rec.trailers = Some(trailers);
            rec.events.push(SinkEvent::Trailers);
            Ok(())
        })
    }
}

impl RecordedResponse {
    /// Make subsequent data writes wait until [`release_data`](Self::release_data).
    pub fn hold_data(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_data(&self) {
        self.hold.send_replace(false);
    }

    pub fn http_status(&self) -> Option<u16> {
        self.recording.lock().http_status
    }

    pub fn headers(&self) -> Option<Metadata> {
        self.recording.lock().headers.clone()
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.recording.lock().trailers.clone()
    }

    /// Whether the status was folded into the headers.
    pub fn is_trailers_only(&self) -> bool {
        self.recording.lock().trailers_only
    }

    /// Whether the response has ended (trailers or trailers-only).
    pub fn is_complete(&self) -> bool {
        let rec = self.recording.lock();
        rec.trailers_only || rec.trailers.is_some()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.recording.lock().events.clone()
    }

    /// The call status, from the trailers or a trailers-only header block.
    pub fn status(&self) -> Option<Status> {
        let rec = self.recording.lock();
        let block = if rec.trailers_only {
            rec.headers.as_ref()
        } else {
            rec.trailers.as_ref()
        };
        block.and_then(Status::from_trailers)
    }

    /// Body data split into frames.
    pub fn frames(&self) -> Result<Vec<Frame>, FrameError> {
        let mut decoder = MessageDecoder::with_max_message_size(None);
        decoder.feed(&self.recording.lock().data);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode()? {
            frames.push(frame);
        }
        decoder.finish()?;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_body_chunks() {
        let (mut request, _abort) = MemoryRequest::new("/svc/Method")
            .message(b"one")
            .chunk(Bytes::from_static(&[0, 0]))
            .build();

        assert_eq!(request.content_type(), Some("application/grpc"));
        let first = request.body.next().await.unwrap().unwrap();
        assert_eq!(first.len(), grpc::frame::HEADER_SIZE + 3);
        assert_eq!(&request.body.next().await.unwrap().unwrap()[..], &[0, 0]);
        assert!(request.body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_streaming_body() {
        let (request, sender) = MemoryRequest::new("/svc/Method").message(b"a").streaming();
        let (mut request, _abort) = request.build();

        sender.send_message(b"b");
        sender.close();

        let mut count = 0;
        while let Some(chunk) = request.body.next().await {
            chunk.unwrap();
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_recording_sink_enforces_order() {
        let (mut sink, recorded) = recording_sink();

        assert!(sink.write_data(Bytes::from_static(b"x"), true).await.is_err());
        sink.write_headers(200, Metadata::new(), false).await.unwrap();
        assert!(sink.write_headers(200, Metadata::new(), false).await.is_err());

        sink.write_data(grpc::encode_message(b"hi").unwrap(), true).await.unwrap();
        let mut trailers = Metadata::new();
        trailers.insert("grpc-status", "0");
        sink.write_trailers(trailers).await.unwrap();
        assert!(sink.write_data(Bytes::from_static(b"x"), true).await.is_err());

        assert!(recorded.is_complete());
        assert!(!recorded.is_trailers_only());
        assert!(recorded.status().unwrap().is_ok());
        let frames = recorded.frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"hi");
    }
}
