use std::net::IpAddr;
use std::time::Duration;

use magpie_core::error::AppError;
use magpie_core::traits::Fetcher;
use reqwest::Client;
use url::Url;

/// Default cap on fetched document size. Oversized documents are a
/// security violation, not a retryable fetch problem.
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// HTTP fetcher using reqwest.
///
/// Enforces the pipeline's HTTPS-only rule, blocks requests resolving to
/// private/reserved IP ranges (SSRF), rejects oversized bodies, and maps
/// transport failures onto the pipeline error taxonomy so the retry
/// controller can classify them.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    max_body_bytes: usize,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent("Magpie/0.1 (tech-transfer aggregator)")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Http(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            ssrf_protection: true,
        })
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only for test rigs where the target is a local fixture server.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn map_transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            return AppError::Timeout(self.timeout_secs);
        }
        let message = e.to_string();
        if e.is_connect() {
            if message.contains("refused") {
                return AppError::ConnectionRefused(message);
            }
            if message.contains("reset") {
                return AppError::ConnectionReset(message);
            }
            return AppError::ConnectionRefused(message);
        }
        if message.contains("reset") {
            return AppError::ConnectionReset(message);
        }
        AppError::Http(message)
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        validate_url(url, self.ssrf_protection).await?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AppError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(AppError::Http(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        if let Some(length) = response.content_length()
            && length as usize > self.max_body_bytes
        {
            return Err(AppError::Security(format!(
                "document of {length} bytes exceeds the {} byte limit",
                self.max_body_bytes
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        // Servers that omit Content-Length still get the cap applied.
        if body.len() > self.max_body_bytes {
            return Err(AppError::Security(format!(
                "document of {} bytes exceeds the {} byte limit",
                body.len(),
                self.max_body_bytes
            )));
        }

        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// URL validation (HTTPS-only + SSRF)
// ---------------------------------------------------------------------------

/// Validate a URL before fetching.
///
/// 1. Only allow the `https` scheme (the submission gate guarantees this;
///    the fetcher re-checks since pagination links come from remote pages).
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str, ssrf_protection: bool) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::Http(format!("Invalid URL: {e}")))?;

    if parsed.scheme() != "https" {
        return Err(AppError::Security(format!(
            "URL scheme '{}' is not allowed (https only)",
            parsed.scheme()
        )));
    }

    if !ssrf_protection {
        return Ok(());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Http("URL has no host".to_string()))?;

    // Host given as an IP literal: check it directly.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::Security(format!(
                "SSRF blocked: {host} is a private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port().unwrap_or(443);
    let addr = format!("{host}:{port}");
    let addrs: Vec<_> = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| {
            AppError::ConnectionRefused(format!("DNS resolution failed for {host}: {e}"))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::ConnectionRefused(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::Security(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata!)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation() // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()       // ::1
                || v6.is_unspecified() // ::
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // IPv4-mapped IPv6 (::ffff:x.x.x.x) — check the embedded v4
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
