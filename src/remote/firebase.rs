//! Firebase Realtime Database client (REST + streaming)
//!
//! - `get`/`set` map to `GET`/`PUT {database_url}{path}.json`
//! - `listen` holds a Server-Sent Events stream open and reconnects with
//!   exponential backoff; the server replays the full subtree as a `put`
//!   after every (re)connect, so nothing is missed across a reconnect.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{header, Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info, trace, warn};

use super::{path_segments, ChangeEvent, ChangeKind, RemoteStore};
use crate::config::SyncConfig;

#[derive(Clone)]
pub struct FirebaseStore {
    client: Client,
    /// No overall timeout: event streams stay open indefinitely
    stream_client: Client,
    base_url: Url,
    auth_token: Option<String>,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
}

impl FirebaseStore {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let base_url = config
            .database_url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .context("FIREBASE_DATABASE_URL is not configured")?;
        let base_url = Url::parse(&base_url)
            .with_context(|| format!("Invalid database URL {}", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Database URL {} cannot carry a path", base_url);
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("bidboard/0.1 (sync)")
            .build()
            .context("Failed to build Firebase HTTP client")?;

        let stream_client = Client::builder()
            .connect_timeout(Duration::from_millis(config.request_timeout_ms))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("bidboard/0.1 (listener)")
            .build()
            .context("Failed to build Firebase streaming client")?;

        Ok(Self {
            client,
            stream_client,
            base_url,
            auth_token: config.auth_token.clone(),
            reconnect_base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        })
    }

    /// `{base}/{segments}.json` with every segment percent-encoded, so a key
    /// holding `?`, `%` or a space stays inside its own segment
    fn url(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("{} cannot carry a path", self.base_url))?;
            segments.pop_if_empty();
            match path_segments(path).split_last() {
                Some((last, parents)) => {
                    segments.extend(parents);
                    segments.push(&format!("{}.json", last));
                }
                None => {
                    segments.push(".json");
                }
            }
        }
        Ok(url)
    }

    fn auth_query(&self) -> Vec<(&'static str, &str)> {
        match self.auth_token.as_deref() {
            Some(token) => vec![("auth", token)],
            None => Vec::new(),
        }
    }

    async fn run_listener(self, path: String, tx: mpsc::UnboundedSender<ChangeEvent>) {
        let mut backoff = ReconnectBackoff::new(self.reconnect_base_delay, self.reconnect_max_delay);

        loop {
            if tx.is_closed() {
                debug!(path = %path, "Listener dropped, closing event stream");
                return;
            }

            info!(path = %path, "Opening Firebase event stream");

            match self.stream_events(&path, &tx).await {
                Ok(received) => {
                    if tx.is_closed() {
                        return;
                    }
                    let delay = backoff.after_close(received);
                    warn!(
                        path = %path,
                        received,
                        delay_ms = delay.as_millis() as u64,
                        "Firebase event stream ended, reconnecting"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    let delay = backoff.after_error();
                    warn!(
                        path = %path,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Firebase event stream failed, reconnecting"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Forward events until the stream closes. Returns how many put/patch
    /// events were delivered.
    async fn stream_events(&self, path: &str, tx: &mpsc::UnboundedSender<ChangeEvent>) -> Result<usize> {
        let mut resp = self
            .stream_client
            .get(self.url(path)?)
            .query(&self.auth_query())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("GET {} (stream) failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("GET {} (stream) {}: {}", path, status, text);
        }

        let mut parser = SseParser::default();
        let mut received = 0usize;
        while let Some(chunk) = resp.chunk().await.context("Event stream read failed")? {
            for message in parser.feed(&chunk) {
                match message.event.as_str() {
                    "put" | "patch" => {
                        let kind = if message.event == "put" {
                            ChangeKind::Put
                        } else {
                            ChangeKind::Patch
                        };
                        let payload: StreamPayload = serde_json::from_str(&message.data)
                            .with_context(|| format!("Malformed {} event payload", kind.as_str()))?;
                        let event = ChangeEvent {
                            listen_path: path.to_string(),
                            path: payload.path,
                            kind,
                            data: payload.data,
                        };
                        if tx.send(event).is_err() {
                            return Ok(received);
                        }
                        received += 1;
                    }
                    "keep-alive" => trace!(path = path, "keep-alive"),
                    "cancel" => bail!("listener cancelled by server: {}", message.data),
                    "auth_revoked" => bail!("listener credential revoked"),
                    other => debug!(path = path, event = other, "Ignoring unknown stream event"),
                }
            }
        }

        Ok(received)
    }
}

/// Reconnect delays for the event stream. The delay doubles on every failed
/// or empty connection and returns to the base only after a connection that
/// delivered events.
#[derive(Debug, Clone)]
struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Delay before reconnecting after the server closed the stream
    fn after_close(&mut self, received: usize) -> Duration {
        if received > 0 {
            self.current = self.base;
        }
        self.after_error()
    }

    fn after_error(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[async_trait::async_trait]
impl RemoteStore for FirebaseStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(self.url(path)?)
            .query(&self.auth_query())
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} {}: {}", path, status, text));
        }

        let value: Value = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let resp = self
            .client
            .put(self.url(path)?)
            .query(&self.auth_query())
            .json(&value)
            .send()
            .await
            .with_context(|| format!("PUT {} failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("PUT {} {}: {}", path, status, text));
        }
        Ok(())
    }

    async fn listen(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            store.run_listener(path, tx).await;
        });
        Ok(rx)
    }
}

/// `data:` payload of put/patch events
#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SseMessage {
    event: String,
    data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines (and
/// multi-byte characters) anywhere.
#[derive(Debug, Default)]
struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(message) = self.dispatch() {
                    out.push(message);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        out
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str, token: Option<&str>) -> FirebaseStore {
        let config = SyncConfig {
            database_url: Some(url.to_string()),
            auth_token: token.map(str::to_string),
            ..SyncConfig::default()
        };
        FirebaseStore::new(&config).unwrap()
    }

    #[test]
    fn test_requires_database_url() {
        assert!(FirebaseStore::new(&SyncConfig::default()).is_err());
    }

    #[test]
    fn test_url_building() {
        let s = store("https://db.example.app/", None);
        assert_eq!(s.url("/bids").unwrap().as_str(), "https://db.example.app/bids.json");
        assert_eq!(
            s.url("/user_inputs/b1").unwrap().as_str(),
            "https://db.example.app/user_inputs/b1.json"
        );
        assert_eq!(s.url("/").unwrap().as_str(), "https://db.example.app/.json");
        assert!(s.auth_query().is_empty());

        let s = store("https://db.example.app", Some("secret"));
        assert_eq!(s.auth_query(), vec![("auth", "secret")]);
    }

    #[test]
    fn test_rejects_unparseable_url() {
        assert!(FirebaseStore::new(&SyncConfig {
            database_url: Some("not a url".to_string()),
            ..SyncConfig::default()
        })
        .is_err());
    }

    #[test]
    fn test_record_keys_stay_in_their_segment() {
        let s = store("https://db.example.app", Some("secret"));
        let cases = [
            ("a?b", "/user_inputs/a%3Fb.json"),
            ("50%off", "/user_inputs/50%25off.json"),
            ("x y", "/user_inputs/x%20y.json"),
        ];
        for (id, expected) in cases {
            let url = s.url(&crate::remote::join_path("/user_inputs", id)).unwrap();
            let request = s
                .client
                .put(url)
                .query(&s.auth_query())
                .build()
                .unwrap();
            assert_eq!(request.url().path(), expected, "id {:?}", id);
            assert_eq!(request.url().query(), Some("auth=secret"), "id {:?}", id);
        }
    }

    #[test]
    fn test_backoff_grows_on_empty_streams() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        // A server that accepts and closes immediately never gets a free retry
        assert_eq!(backoff.after_close(0), Duration::from_millis(100));
        assert_eq!(backoff.after_close(0), Duration::from_millis(200));
        assert_eq!(backoff.after_error(), Duration::from_millis(350));
        assert_eq!(backoff.after_close(0), Duration::from_millis(350));

        // A productive connection resets the delay
        assert_eq!(backoff.after_close(3), Duration::from_millis(100));
        assert_eq!(backoff.after_close(0), Duration::from_millis(200));
    }

    #[test]
    fn test_sse_parser_split_chunks() {
        let mut parser = SseParser::default();
        let first = parser.feed(b"event: put\ndata: {\"path\":\"/\",");
        assert!(first.is_empty());

        let second = parser.feed(b"\"data\":{\"a\":1}}\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].event, "put");
        assert_eq!(second[0].data, "{\"path\":\"/\",\"data\":{\"a\":1}}");
        assert_eq!(second[1].event, "keep-alive");

        let payload: StreamPayload = serde_json::from_str(&second[0].data).unwrap();
        assert_eq!(payload.path, "/");
        assert_eq!(payload.data, serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_sse_parser_crlf_and_comments() {
        let mut parser = SseParser::default();
        let out = parser.feed(b": hello\r\nevent: patch\r\ndata: {\"path\":\"/b1\",\"data\":{}}\r\n\r\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event, "patch");
    }

    #[test]
    fn test_sse_parser_multibyte_split() {
        let mut parser = SseParser::default();
        let bytes = "event: put\ndata: {\"path\":\"/\",\"data\":\"물동량\"}\n\n".as_bytes();
        let split = bytes.len() - 8;
        assert!(parser.feed(&bytes[..split]).is_empty());
        let out = parser.feed(&bytes[split..]);
        assert_eq!(out.len(), 1);
        assert!(out[0].data.contains("물동량"));
    }
}
