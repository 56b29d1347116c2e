//! HTTP tracker client
//!
//! GET announces over reqwest, falling back through backup trackers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use super::response::parse_announce_response;
use super::{AnnounceRequest, AnnounceResponse, Announcer, TrackerError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Announces over HTTP(S) to one or more trackers
pub struct HttpTracker {
    client: Client,
    urls: Vec<Url>,
    /// Tracker that answered last; tried first next time
    preferred: AtomicUsize,
}

impl HttpTracker {
    /// Build a tracker client from announce URLs in priority order.
    ///
    /// Non-HTTP URLs (udp:// and the like) are skipped.
    pub fn new<I, S>(urls: I) -> Result<Self, TrackerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        let mut last_error = None;
        for raw in urls {
            match parse_url(raw.as_ref()) {
                Ok(url) => parsed.push(url),
                Err(e) => {
                    warn!("Skipping tracker {}: {}", raw.as_ref(), e);
                    last_error = Some(e);
                }
            }
        }

        if parsed.is_empty() {
            return Err(last_error.unwrap_or_else(|| TrackerError::InvalidUrl("no tracker URLs".into())));
        }

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TrackerError::Http(e.to_string()))?;

        info!("Using {} HTTP tracker(s)", parsed.len());
        Ok(Self {
            client,
            urls: parsed,
            preferred: AtomicUsize::new(0),
        })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    async fn announce_to(&self, url: &Url, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let target = announce_url(url, request);
        debug!("Announcing to {}", url);

        let response = self
            .client
            .get(target)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;

        parse_announce_response(&body)
    }
}

#[async_trait]
impl Announcer for HttpTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = None;

        for step in 0..self.urls.len() {
            let index = (start + step) % self.urls.len();
            match self.announce_to(&self.urls[index], request).await {
                Ok(response) => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Announce to {} failed: {}", self.urls[index], e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TrackerError::InvalidUrl("no tracker URLs".into())))
    }
}

fn parse_url(raw: &str) -> Result<Url, TrackerError> {
    let url = Url::parse(raw).map_err(|e| TrackerError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TrackerError::UnsupportedProtocol(other.to_string())),
    }
}

/// Full announce URL; binary fields are percent-encoded byte by byte
fn announce_url(base: &Url, request: &AnnounceRequest) -> String {
    let separator = if base.query().is_some() { '&' } else { '?' };
    let mut target = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        base,
        separator,
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );

    let event = request.event.as_str();
    if !event.is_empty() {
        target.push_str("&event=");
        target.push_str(event);
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xab; 20],
            peer_id: *b"-TL0100-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 100,
            left: 900,
            event,
        }
    }

    /// Answer one HTTP request with `body`, returning the request line
    async fn serve_once(listener: TcpListener, status: &'static str, body: &'static [u8]) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).into_owned();

        let reply = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            body.len()
        );
        socket.write_all(reply.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        head.lines().next().unwrap_or_default().to_string()
    }

    #[test]
    fn test_announce_url_encoding() {
        let base = Url::parse("http://tracker.test/announce").unwrap();
        let url = announce_url(&base, &request(TrackerEvent::Started));

        assert!(url.starts_with("http://tracker.test/announce?info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=-TL0100-abcdefghijkl"));
        assert!(url.contains("&port=6881&uploaded=0&downloaded=100&left=900&compact=1"));
        assert!(url.ends_with("&event=started"));

        let base = Url::parse("http://tracker.test/announce?key=1").unwrap();
        let url = announce_url(&base, &request(TrackerEvent::None));
        assert!(url.starts_with("http://tracker.test/announce?key=1&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_rejects_non_http_trackers() {
        assert!(matches!(
            HttpTracker::new(["udp://tracker.test:80"]),
            Err(TrackerError::UnsupportedProtocol(_))
        ));
        assert!(HttpTracker::new(["not a url"]).is_err());

        let tracker = HttpTracker::new(["udp://a:80", "http://b/announce"]).unwrap();
        assert_eq!(tracker.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_announce_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "200 OK",
            b"d8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe1e",
        ));

        let tracker = HttpTracker::new([format!("http://{}/announce", addr)]).unwrap();
        let response = tracker.announce(&request(TrackerEvent::Started)).await.unwrap();

        assert_eq!(response.interval, 900);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /announce?info_hash="));
        assert!(request_line.contains("event=started"));
    }

    #[tokio::test]
    async fn test_falls_back_to_backup_tracker() {
        let bad = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bad_addr = bad.local_addr().unwrap();
        let good = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_addr = good.local_addr().unwrap();

        let bad_server = tokio::spawn(serve_once(bad, "200 OK", b"d14:failure reason4:nopee"));
        let good_server = tokio::spawn(serve_once(good, "200 OK", b"d8:intervali30e5:peers0:e"));

        let tracker = HttpTracker::new([
            format!("http://{}/announce", bad_addr),
            format!("http://{}/announce", good_addr),
        ])
        .unwrap();

        let response = tracker.announce(&request(TrackerEvent::None)).await.unwrap();
        assert_eq!(response.interval, 30);
        assert!(response.peers.is_empty());
        assert_eq!(tracker.preferred.load(Ordering::Relaxed), 1);

        bad_server.await.unwrap();
        good_server.await.unwrap();
    }
}
