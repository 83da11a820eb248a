//! Outbound HTTP transport
//!
//! Everything the engine sends to or fetches from peers goes through the
//! [`Transport`] trait so the normalizer, resolvers and delivery engine can be
//! driven by a scripted transport in tests.

use async_trait::async_trait;
use rand::Rng;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::signature::sign_request;
use crate::config::FederationConfig;
use crate::data::LocalUser;

/// Accept header for activity objects and actor documents.
pub const ACTIVITY_ACCEPT: &str = "application/activity+json";
/// Accept header for WebFinger lookups.
pub const JRD_ACCEPT: &str = "application/jrd+json";
/// Content type of outbound deliveries.
pub const LD_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Classified outbound failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("destination not allowed: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// The peer refused this particular message; retrying will not help.
    pub fn is_permanent_for_message(&self) -> bool {
        matches!(self, Self::Status(400) | Self::Status(422))
    }

    /// The host cannot be reached at all.
    pub fn is_permanent_for_host(&self) -> bool {
        matches!(self, Self::Dns { .. } | Self::Forbidden(_))
    }

    pub fn is_bad_gateway(&self) -> bool {
        matches!(self, Self::Status(502))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else {
            Self::Other(error.to_string())
        }
    }
}

/// Key material used to sign a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub key_id: String,
    pub private_key_pem: String,
}

impl From<&LocalUser> for SigningIdentity {
    fn from(user: &LocalUser) -> Self {
        Self {
            key_id: user.key_id(),
            private_key_pem: user.private_key_pem.clone(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` and return the body.
    async fn fetch(
        &self,
        url: &str,
        accept: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Signed POST of `body` to `url`.
    async fn post_signed(
        &self,
        identity: &SigningIdentity,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Fetch that survives one flaky gateway.
///
/// A 502 or timeout sleeps a random 60 to 120 seconds and retries once.
pub async fn fetch_hard_mode(
    transport: &dyn Transport,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    match transport.fetch(url, ACTIVITY_ACCEPT, timeout).await {
        Err(error) if error.is_bad_gateway() || error.is_timeout() => {
            let pause = Duration::from_secs(rand::thread_rng().gen_range(60..=120));
            tracing::info!(%url, %error, ?pause, "Retrying fetch after upstream error");
            tokio::time::sleep(pause).await;
            let retried = transport.fetch(url, ACTIVITY_ACCEPT, timeout).await;
            if retried.is_err() {
                tracing::info!(%url, "Retry failed");
            }
            retried
        }
        other => other,
    }
}

// =============================================================================
// reqwest implementation
// =============================================================================

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Redirects followed by a single fetch.
const MAX_REDIRECTS: usize = 5;

/// Where a redirect response points, resolved against the URL that produced it.
fn redirect_location(
    current: &url::Url,
    response: &reqwest::Response,
) -> Result<url::Url, TransportError> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(TransportError::Status(response.status().as_u16()))?;
    current
        .join(location)
        .map_err(|e| TransportError::Other(format!("bad redirect {location}: {e}")))
}

/// Transport backed by a shared `reqwest::Client`.
///
/// Redirects are followed by hand so every hop passes the destination check.
pub struct HttpTransport {
    client: reqwest::Client,
    max_body_bytes: usize,
    allow_private_hosts: bool,
}

impl HttpTransport {
    pub fn new(config: &FederationConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_fetch_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// Parse `url` and make sure its host resolves to somewhere we may talk to.
    async fn check_destination(&self, url: &str) -> Result<url::Url, TransportError> {
        let parsed =
            url::Url::parse(url).map_err(|e| TransportError::Other(format!("bad url {url}: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::Forbidden(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::Other(format!("missing host in {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = parsed.port_or_known_default().unwrap_or(443);

        if !self.allow_private_hosts && is_disallowed_host(&host) {
            return Err(TransportError::Forbidden(host));
        }

        let addrs = tokio::net::lookup_host((host.trim_end_matches('.'), port))
            .await
            .map_err(|e| TransportError::Dns {
                host: host.clone(),
                reason: e.to_string(),
            })?;

        let mut resolved_any = false;
        for addr in addrs {
            resolved_any = true;
            if !self.allow_private_hosts && is_disallowed_ip(addr.ip()) {
                return Err(TransportError::Forbidden(host.clone()));
            }
        }

        if !resolved_any {
            return Err(TransportError::Dns {
                host,
                reason: "no addresses".to_string(),
            });
        }

        Ok(parsed)
    }

    async fn read_limited(&self, mut response: reqwest::Response) -> Result<Vec<u8>, TransportError> {
        if let Some(length) = response.content_length() {
            if length as usize > self.max_body_bytes {
                return Err(TransportError::BodyTooLarge(self.max_body_bytes));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(TransportError::from_reqwest)?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(TransportError::BodyTooLarge(self.max_body_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn accepted_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 201 | 202)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        accept: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut target = self.check_destination(url).await?;
        let started = Instant::now();

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(target.clone())
                .header(reqwest::header::ACCEPT, accept)
                .timeout(timeout)
                .send()
                .await
                .map_err(TransportError::from_reqwest)?;

            if response.status().is_redirection() {
                let next = redirect_location(&target, &response)?;
                tracing::debug!(%url, to = %next, "Following redirect");
                target = self.check_destination(next.as_str()).await?;
                continue;
            }

            crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
                .with_label_values(&["fetch"])
                .observe(started.elapsed().as_secs_f64());

            if !accepted_status(response.status()) {
                tracing::debug!(%url, status = %response.status(), "Fetch failed");
                return Err(TransportError::Status(response.status().as_u16()));
            }

            return self.read_limited(response).await;
        }

        Err(TransportError::Other(format!("too many redirects from {url}")))
    }

    async fn post_signed(
        &self,
        identity: &SigningIdentity,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let parsed = self.check_destination(url).await?;
        let signed = sign_request(
            "POST",
            url,
            Some(body),
            Some(LD_CONTENT_TYPE),
            &identity.private_key_pem,
            &identity.key_id,
        )
        .map_err(|e| TransportError::Other(e.to_string()))?;

        let mut request = self
            .client
            .post(parsed)
            .header(reqwest::header::CONTENT_TYPE, LD_CONTENT_TYPE)
            .header("Date", &signed.date)
            .header("Signature", &signed.signature)
            .timeout(timeout)
            .body(body.to_vec());
        if let Some(digest) = &signed.digest {
            request = request.header("Digest", digest);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(TransportError::from_reqwest)?;

        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["post"])
            .observe(started.elapsed().as_secs_f64());

        if !accepted_status(response.status()) {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        tracing::debug!(%url, status = %response.status(), "Delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::header, response::IntoResponse, routing::get};

    #[test]
    fn classifies_permanent_failures() {
        assert!(TransportError::Status(400).is_permanent_for_message());
        assert!(TransportError::Status(422).is_permanent_for_message());
        assert!(!TransportError::Status(500).is_permanent_for_message());

        let dns = TransportError::Dns {
            host: "gone.example".to_string(),
            reason: "nxdomain".to_string(),
        };
        assert!(dns.is_permanent_for_host());
        assert!(!TransportError::Timeout.is_permanent_for_host());
    }

    #[test]
    fn disallowed_hosts_cover_loopback_and_private() {
        assert!(is_disallowed_host("localhost"));
        assert!(is_disallowed_host("127.0.0.1"));
        assert!(is_disallowed_host("192.168.1.10"));
        assert!(!is_disallowed_host("example.com"));
    }

    fn test_federation_config(allow_private_hosts: bool) -> FederationConfig {
        let dir = std::env::temp_dir();
        let mut config = crate::config::tests::test_config(&dir).federation;
        config.allow_private_hosts = allow_private_hosts;
        config
    }

    #[tokio::test]
    async fn refuses_private_destinations_by_default() {
        let transport = HttpTransport::new(&test_federation_config(false)).unwrap();
        let result = transport
            .fetch("http://127.0.0.1:9/actor", ACTIVITY_ACCEPT, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::Forbidden(_))));
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_dns_failure() {
        let transport = HttpTransport::new(&test_federation_config(true)).unwrap();
        let result = transport
            .fetch(
                "https://does-not-exist.invalid/actor",
                ACTIVITY_ACCEPT,
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Dns { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_mode_retries_once_after_bad_gateway() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(TransportError::Status(502)));
        transport
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(b"{}".to_vec()));

        let started = tokio::time::Instant::now();
        let body = fetch_hard_mode(&transport, "https://b.example/p/1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(body, b"{}".to_vec());
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_mode_retries_once_after_timeout() {
        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .times(2)
            .returning(|_, _, _| Err(TransportError::Timeout));

        let result =
            fetch_hard_mode(&transport, "https://b.example/p/1", Duration::from_secs(30)).await;
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn hard_mode_does_not_retry_not_found() {
        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .times(1)
            .returning(|_, _, _| Err(TransportError::Status(404)));

        let result =
            fetch_hard_mode(&transport, "https://b.example/p/1", Duration::from_secs(30)).await;
        assert_eq!(result, Err(TransportError::Status(404)));
    }
    /// Serve `router` on an ephemeral loopback port.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn redirect_to(location: &'static str) -> impl IntoResponse {
        (axum::http::StatusCode::FOUND, [(header::LOCATION, location)])
    }

    #[tokio::test]
    async fn relative_redirects_are_followed() {
        let addr = serve(
            Router::new()
                .route("/old", get(|| async { redirect_to("/new") }))
                .route("/new", get(|| async { "{}" })),
        )
        .await;

        let transport = HttpTransport::new(&test_federation_config(true)).unwrap();
        let body = transport
            .fetch(&format!("{addr}/old"), ACTIVITY_ACCEPT, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(body, b"{}".to_vec());
    }

    #[tokio::test]
    async fn redirect_targets_pass_the_destination_check() {
        let addr = serve(
            Router::new().route("/actor", get(|| async { redirect_to("file:///etc/passwd") })),
        )
        .await;

        let transport = HttpTransport::new(&test_federation_config(true)).unwrap();
        let result = transport
            .fetch(&format!("{addr}/actor"), ACTIVITY_ACCEPT, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(TransportError::Forbidden(_))));
    }

    #[tokio::test]
    async fn redirect_loops_give_up() {
        let addr = serve(Router::new().route("/loop", get(|| async { redirect_to("/loop") }))).await;

        let transport = HttpTransport::new(&test_federation_config(true)).unwrap();
        let result = transport
            .fetch(&format!("{addr}/loop"), ACTIVITY_ACCEPT, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(TransportError::Other(_))));
    }
}
