use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

pub fn user_agent() -> String {
    format!("monarch-pipeline/{}", env!("CARGO_PKG_VERSION"))
}

pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&user_agent()) {
        headers.insert(USER_AGENT, value);
    }
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
}

/// Retries 429/5xx responses and connect/timeout failures with linear backoff.
/// The final response is returned whatever its status.
pub fn send_with_retries<F>(mut make_req: F) -> Result<Response, reqwest::Error>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    backoff(attempt);
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    backoff(attempt);
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Reads the body of a failed response, truncated for log lines.
pub fn error_message(response: Response, fallback: &str) -> String {
    let text = response.text().unwrap_or_else(|_| fallback.to_string());
    let trimmed: String = text.chars().take(200).collect();
    if trimmed.trim().is_empty() {
        fallback.to_string()
    } else {
        trimmed
    }
}

fn backoff(attempt: usize) {
    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
    tracing::debug!(attempt, delay_ms = delay, "retrying request");
    thread::sleep(Duration::from_millis(delay));
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
