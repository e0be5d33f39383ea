//! Mastodon public timeline as a content stream
//!
//! Authenticates with a pre-issued token or the OAuth password grant, then
//! reads `GET /api/v1/streaming/public` as server-sent events. Only `update`
//! events carry statuses; everything else is surfaced as `Ignored`.

use crate::config::MastodonConfig;
use crate::error::{BallotError, Result};
use crate::services::stream_filter::{ContentEvent, ContentSource, ContentStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    content: String,
    account: Option<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    acct: String,
}

pub struct MastodonClient {
    http: reqwest::Client,
    server: String,
    access_token: String,
}

impl MastodonClient {
    /// Build the client and obtain an access token. Fatal on error.
    pub async fn connect(config: &MastodonConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let access_token = match &config.access_token {
            Some(token) => token.clone(),
            None => Self::authenticate(&http, config).await?,
        };
        info!(server = %config.server, "Mastodon client ready");

        Ok(Self {
            http,
            server: config.server.clone(),
            access_token,
        })
    }

    async fn authenticate(http: &reqwest::Client, config: &MastodonConfig) -> Result<String> {
        let response = http
            .post(format!("{}/oauth/token", config.server))
            .form(&[
                ("grant_type", "password"),
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
                ("username", config.user_email.as_str()),
                ("password", config.user_password.as_str()),
                ("scope", "read"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let token: TokenResponse = response.json().await?;
        info!(user = %config.user_email, "Authenticated with Mastodon");
        Ok(token.access_token)
    }
}

#[async_trait]
impl ContentStream for MastodonClient {
    async fn subscribe(&self) -> Result<Box<dyn ContentSource>> {
        let response = self
            .http
            .get(format!("{}/api/v1/streaming/public", self.server))
            .bearer_auth(&self.access_token)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BallotError::from));
        Ok(Box::new(SseEventSource::new(chunks)))
    }
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseFrame {
    event: String,
    data: String,
}

impl SseFrame {
    fn into_content_event(self) -> ContentEvent {
        if self.event != "update" {
            return ContentEvent::Ignored { kind: self.event };
        }
        match serde_json::from_str::<Status>(&self.data) {
            Ok(status) => ContentEvent::Update {
                content: status.content,
                author: status.account.map(|a| a.acct).unwrap_or_default(),
            },
            Err(e) => {
                warn!(error = %e, "Malformed status in update event");
                ContentEvent::Ignored {
                    kind: "update".to_string(),
                }
            }
        }
    }
}

/// Line-level SSE state machine
#[derive(Debug, Default)]
struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed one line without its terminator; a blank line dispatches the frame
    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let event = self.event.take().unwrap_or_else(|| "message".to_string());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseFrame { event, data });
        }

        // Comment, used by Mastodon as a heartbeat
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Content source over a raw SSE byte stream
pub struct SseEventSource {
    chunks: ChunkStream,
    buffer: Vec<u8>,
    parser: SseParser,
    frames: VecDeque<SseFrame>,
}

impl SseEventSource {
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            chunks: Box::pin(chunks),
            buffer: Vec::new(),
            parser: SseParser::default(),
            frames: VecDeque::new(),
        }
    }

    fn consume_lines(&mut self) {
        // Split on bytes so a multi-byte character across chunks stays intact
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.parser.feed_line(line) {
                self.frames.push_back(frame);
            }
        }
    }
}

#[async_trait]
impl ContentSource for SseEventSource {
    async fn next_event(&mut self) -> Option<Result<ContentEvent>> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(Ok(frame.into_content_event()));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.consume_lines();
                }
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn source(chunks: Vec<&'static [u8]>) -> SseEventSource {
        SseEventSource::new(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    #[test]
    fn test_parser_dispatches_on_blank_line() {
        let mut parser = SseParser::default();

        assert_eq!(parser.feed_line(":thump"), None);
        assert_eq!(parser.feed_line("event: delete"), None);
        assert_eq!(parser.feed_line("data: 1234"), None);
        assert_eq!(
            parser.feed_line(""),
            Some(SseFrame {
                event: "delete".to_string(),
                data: "1234".to_string(),
            })
        );

        assert_eq!(parser.feed_line("data:a"), None);
        assert_eq!(parser.feed_line("data: b"), None);
        assert_eq!(
            parser.feed_line(""),
            Some(SseFrame {
                event: "message".to_string(),
                data: "a\nb".to_string(),
            })
        );
        assert_eq!(parser.feed_line(""), None);
    }

    #[tokio::test]
    async fn test_reads_updates_across_chunk_boundaries() {
        let mut events = source(vec![
            &b":thump\n\nevent: upd"[..],
            &b"ate\r\ndata: {\"content\":\"<p>I vote CAT \xe7"[..],
            &b"\x8c\xab</p>\",\"account\":{\"acct\":\"alice\"}}\n\n"[..],
            &b"event: delete\ndata: 99\n\n"[..],
            &b"event: update\ndata: not json\n\n"[..],
        ]);

        assert_eq!(
            events.next_event().await.unwrap().unwrap(),
            ContentEvent::Update {
                content: "<p>I vote CAT 猫</p>".to_string(),
                author: "alice".to_string(),
            }
        );
        assert_eq!(
            events.next_event().await.unwrap().unwrap(),
            ContentEvent::Ignored {
                kind: "delete".to_string()
            }
        );
        assert_eq!(
            events.next_event().await.unwrap().unwrap(),
            ContentEvent::Ignored {
                kind: "update".to_string()
            }
        );
        assert!(events.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let mut events = SseEventSource::new(stream::iter(vec![
            Ok(Bytes::from_static(b"event: update\n")),
            Err(BallotError::Stream("connection reset".to_string())),
        ]));

        assert!(matches!(
            events.next_event().await,
            Some(Err(BallotError::Stream(_)))
        ));
    }
}
