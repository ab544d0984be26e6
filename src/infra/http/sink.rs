//! Client sink that hands the response head and body chunks to the axum handler.

use std::io;

use async_stream::stream;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, Version},
};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::application::orchestrator::{ClientSink, SinkError};

/// Chunks buffered between the engine task and the connection.
const BODY_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

type BodyItem = Result<Bytes, io::Error>;

/// Sink side, owned by the engine task. Dropping it after the head went out without
/// calling `finish` fails the body, so the client sees a truncated transfer.
pub struct ChannelSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::Sender<BodyItem>,
    version: Version,
    headers_sent: bool,
    finished: bool,
}

/// Connection side, owned by the handler.
pub struct ChannelSource {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<BodyItem>,
}

impl ChannelSink {
    pub fn new(version: Version) -> (Self, ChannelSource) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let sink = Self {
            head: Some(head_tx),
            body: body_tx,
            version,
            headers_sent: false,
            finished: false,
        };
        let source = ChannelSource {
            head: head_rx,
            body: body_rx,
        };
        (sink, source)
    }
}

impl ChannelSource {
    /// Split into the head receiver and a streaming body.
    pub fn into_parts(self) -> (oneshot::Receiver<ResponseHead>, Body) {
        let mut rx = self.body;
        let stream = stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        (self.head, Body::from_stream(stream))
    }
}

#[async_trait]
impl ClientSink for ChannelSink {
    fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    async fn send_headers(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<(), SinkError> {
        let sender = self.head.take().ok_or(SinkError::HeadersSent)?;
        self.headers_sent = true;
        sender
            .send(ResponseHead {
                status,
                headers: headers.clone(),
            })
            .map_err(|_| SinkError::Disconnected)
    }

    async fn write(&mut self, data: Bytes) -> Result<(), SinkError> {
        self.body
            .send(Ok(data))
            .await
            .map_err(|_| SinkError::Disconnected)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.body.is_closed() {
            return Err(SinkError::Disconnected);
        }
        Ok(())
    }

    fn supports_flush(&self) -> bool {
        self.version >= Version::HTTP_11
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.finished = true;
        if self.body.is_closed() {
            return Err(SinkError::Disconnected);
        }
        Ok(())
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        if self.headers_sent && !self.finished {
            debug!("response body ended early");
            let _ = self
                .body
                .try_send(Err(io::Error::other("response body truncated")));
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn head_and_body_reach_the_handler() {
        let (mut sink, source) = ChannelSink::new(Version::HTTP_11);
        let (head, body) = source.into_parts();

        let writer = tokio::spawn(async move {
            sink.send_headers(StatusCode::OK, &HeaderMap::new())
                .await
                .expect("head");
            sink.write(Bytes::from_static(b"hello ")).await.expect("write");
            sink.write(Bytes::from_static(b"world")).await.expect("write");
            sink.finish().await.expect("finish");
        });

        let head = head.await.expect("head");
        assert_eq!(head.status, StatusCode::OK);
        let bytes = body.collect().await.expect("body").to_bytes();
        assert_eq!(bytes, "hello world");
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn dropped_connection_is_reported() {
        let (mut sink, source) = ChannelSink::new(Version::HTTP_11);
        drop(source);

        assert!(matches!(
            sink.send_headers(StatusCode::OK, &HeaderMap::new()).await,
            Err(SinkError::Disconnected)
        ));
        assert!(sink.headers_sent());
        assert!(matches!(
            sink.write(Bytes::from_static(b"x")).await,
            Err(SinkError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn headers_go_out_once() {
        let (mut sink, _source) = ChannelSink::new(Version::HTTP_10);
        sink.send_headers(StatusCode::OK, &HeaderMap::new())
            .await
            .expect("head");
        assert!(matches!(
            sink.send_headers(StatusCode::OK, &HeaderMap::new()).await,
            Err(SinkError::HeadersSent)
        ));
        assert!(!sink.supports_flush());
    }
}
