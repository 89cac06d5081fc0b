//! Export fetcher: long timeouts, bounded fixed-delay retries, charset-tolerant decoding.

use std::borrow::Cow;
use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_CHARSET, ACCEPT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retry bound. Attempts are not spaced exponentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Client(_) => 0,
            FetchError::Transport { attempts, .. } | FetchError::HttpStatus { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Response body decoded to text, with the charset that was used.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: StatusCode,
    pub final_url: String,
    pub text: String,
    pub byte_len: usize,
    pub encoding: &'static str,
    pub had_decode_errors: bool,
    pub attempts: usize,
}

/// Failure of one attempt. Neither variant carries the request URL in the clear.
#[derive(Debug)]
enum AttemptError {
    Transport(reqwest::Error),
    Status(StatusCode, String),
}

impl AttemptError {
    fn transport(err: reqwest::Error) -> Self {
        AttemptError::Transport(err.without_url())
    }

    fn disposition(&self) -> RetryDisposition {
        match self {
            AttemptError::Transport(err) => classify_reqwest_error(err),
            AttemptError::Status(status, _) => classify_status(*status),
        }
    }

    fn into_fetch_error(self, url: &str, attempts: usize) -> FetchError {
        match self {
            AttemptError::Transport(source) => FetchError::Transport {
                url: redact_url(url),
                attempts,
                source,
            },
            AttemptError::Status(status, redacted_url) => FetchError::HttpStatus {
                status: status.as_u16(),
                url: redacted_url,
                attempts,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, */*;q=0.5"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(
            ACCEPT_CHARSET,
            HeaderValue::from_static("utf-8, iso-8859-1;q=0.5"),
        );

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// Fetch the full export body as text, retrying transport failures and retryable statuses.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPayload, FetchError> {
        let span = info_span!("http_fetch", url = %redact_url(url));
        async {
            let max_attempts = self.retry.attempts();
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.attempt(url).await {
                    Ok(mut payload) => {
                        payload.attempts = attempt;
                        info!(
                            attempt,
                            bytes = payload.byte_len,
                            encoding = payload.encoding,
                            "export fetched"
                        );
                        return Ok(payload);
                    }
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < max_attempts =>
                    {
                        warn!(
                            attempt,
                            max_attempts,
                            error = ?err,
                            delay_ms = self.retry.delay.as_millis() as u64,
                            "export fetch failed; retrying"
                        );
                        tokio::time::sleep(self.retry.delay).await;
                    }
                    Err(err) => return Err(err.into_fetch_error(url, attempt)),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedPayload, AttemptError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(AttemptError::transport)?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(AttemptError::Status(status, redact_url(&final_url)));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await.map_err(AttemptError::transport)?;
        let decoded = decode_body(&body, content_type.as_deref());

        Ok(FetchedPayload {
            status,
            final_url,
            text: decoded.text.into_owned(),
            byte_len: body.len(),
            encoding: decoded.encoding,
            had_decode_errors: decoded.had_errors,
            attempts: 0,
        })
    }
}

#[derive(Debug)]
pub struct DecodedBody<'a> {
    pub text: Cow<'a, str>,
    pub encoding: &'static str,
    pub had_errors: bool,
}

/// Decode with the declared charset; undeclared bodies decode as lossy UTF-8 so broken
/// sequences surface as U+FFFD instead of being silently reinterpreted.
pub fn decode_body<'a>(bytes: &'a [u8], content_type: Option<&str>) -> DecodedBody<'a> {
    let encoding = content_type
        .and_then(charset_param)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, used, had_errors) = encoding.decode(bytes);
    DecodedBody {
        text,
        encoding: used.name(),
        had_errors,
    }
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Strip query strings so URL-embedded tokens never reach logs or error messages.
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let had_query = parsed.query().is_some();
            parsed.set_query(None);
            let _ = parsed.set_password(None);
            if had_query {
                format!("{parsed}?<redacted>")
            } else {
                parsed.to_string()
            }
        }
        Err(_) => "<unparseable-url>".to_string(),
    }
}
