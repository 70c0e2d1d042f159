//! HTTP Push Transport
//!
//! Implements PushTransport with a plain tokio TCP connection per exchange
//! and a hand-assembled HTTP/1.1 POST. The request goes out in a single
//! write. The response head is parsed with httparse, the body is read until
//! the acknowledgment is complete and any remainder is drained briefly
//! before the connection is closed.

use crate::domain::entities::PushAck;
use crate::domain::errors::PushError;
use crate::domain::ports::{PushSession, PushTransport};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

/// Largest response header block accepted.
const MAX_HEADER_LEN: usize = 4096;
/// Response header fields parsed before the head is rejected.
const MAX_HEADERS: usize = 32;
/// Bytes read and discarded after the acknowledgment.
const DRAIN_LEN: usize = 4096;

/// Where and how to reach the collector.
#[derive(Debug, Clone)]
pub struct HttpPushConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Bound on connect, send and the acknowledgment read.
    pub response_timeout: Duration,
    /// Bound on draining the rest of the response.
    pub drain_timeout: Duration,
    /// Poll interval while waiting for the link to come up.
    pub link_poll_interval: Duration,
}

impl Default for HttpPushConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            path: "/".to_string(),
            response_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
            link_poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct HttpPushTransport {
    config: HttpPushConfig,
}

impl HttpPushTransport {
    pub fn new(config: HttpPushConfig) -> Self {
        Self { config }
    }

    async fn resolve(&self) -> Result<SocketAddr, PushError> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        let mut addrs = lookup_host(target.clone())
            .await
            .map_err(|_| PushError::Resolve(target.clone()))?;
        addrs.next().ok_or(PushError::Resolve(target))
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn wait_link_up(&self) {
        let mut reported = false;
        loop {
            match self.resolve().await {
                Ok(_) => return,
                Err(e) => {
                    if !reported {
                        tracing::debug!("waiting for network link: {}", e);
                        reported = true;
                    }
                }
            }
            tokio::time::sleep(self.config.link_poll_interval).await;
        }
    }

    async fn connect(&self) -> Result<Box<dyn PushSession>, PushError> {
        let addr = self.resolve().await?;
        let stream = tokio::time::timeout(self.config.response_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PushError::Timeout("connect"))?
            .map_err(PushError::Connect)?;
        stream.set_nodelay(true)?;

        Ok(Box::new(HttpPushSession {
            stream,
            config: self.config.clone(),
        }))
    }
}

struct HttpPushSession {
    stream: TcpStream,
    config: HttpPushConfig,
}

impl HttpPushSession {
    fn build_request(&self, body: &[u8]) -> Bytes {
        let head = format!(
            "POST {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n\
             Content-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            self.config.path,
            self.config.host,
            self.config.port,
            body.len()
        );
        let mut request = BytesMut::with_capacity(head.len() + body.len());
        request.put_slice(head.as_bytes());
        request.put_slice(body);
        request.freeze()
    }

    /// Read the status line and headers, returning any body bytes that came
    /// in with them.
    async fn read_head(&mut self) -> Result<Vec<u8>, PushError> {
        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        loop {
            if let Some(len) = parse_head(&buf)? {
                return Ok(buf.split_off(len));
            }
            if buf.len() > MAX_HEADER_LEN {
                return Err(PushError::MalformedResponse);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(PushError::MalformedResponse);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_ack(&mut self) -> Result<Vec<u8>, PushError> {
        let mut body = self.read_head().await?;
        let mut chunk = [0u8; 64];
        while body.len() < PushAck::LEN {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(PushError::ShortResponse(body.len()));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(body)
    }

    async fn drain(&mut self) {
        let mut sink = [0u8; 512];
        let mut drained = 0;
        let limit = self.config.drain_timeout;
        let _ = tokio::time::timeout(limit, async {
            while drained < DRAIN_LEN {
                match self.stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => drained += n,
                }
            }
        })
        .await;
    }
}

#[async_trait]
impl PushSession for HttpPushSession {
    async fn exchange(mut self: Box<Self>, request: Bytes) -> Result<Bytes, PushError> {
        let timeout = self.config.response_timeout;
        let message = self.build_request(&request);

        tokio::time::timeout(timeout, self.stream.write_all(&message))
            .await
            .map_err(|_| PushError::Timeout("send"))??;

        let body = tokio::time::timeout(timeout, self.read_ack())
            .await
            .map_err(|_| PushError::Timeout("response"))??;

        self.drain().await;
        let _ = self.stream.shutdown().await;
        Ok(Bytes::from(body))
    }
}

/// Length of the response head once it is complete. Any 2xx status is
/// accepted.
fn parse_head(buf: &[u8]) -> Result<Option<usize>, PushError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            tracing::debug!("unparsable push response: {}", e);
            return Err(PushError::MalformedResponse);
        }
    };
    match response.code {
        Some(code) if (200..300).contains(&code) => Ok(Some(len)),
        Some(code) => Err(PushError::BadStatus(code)),
        None => Err(PushError::MalformedResponse),
    }
}
