use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;

/// Default ceiling for transient retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default fixed spacing between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

/// Serverside breakage and rate limiting are worth another attempt.
pub fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Fixed-backoff retry over HTTP-level outcomes.
///
/// Only the response status feeds the predicate; a transport-level error
/// (DNS, connect, TLS) aborts the whole run immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    retry_on: fn(StatusCode) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration, retry_on: fn(StatusCode) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_on,
        }
    }

    /// The policy used by retry-enabled clients: up to 5 attempts spaced
    /// 1000ms apart, retrying on 5xx and 429.
    pub fn transient() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF, transient_status)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn should_retry(&self, status: StatusCode) -> bool {
        (self.retry_on)(status)
    }

    pub async fn run<F, Fut>(&self, mut attempt_fn: F) -> reqwest::Result<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut attempt = 1u32;
        loop {
            let response = attempt_fn().await?;

            if attempt >= self.max_attempts || !self.should_retry(response.status()) {
                return Ok(response);
            }

            log::debug!(
                "retrying after HTTP {} (attempt {attempt}/{})",
                response.status(),
                self.max_attempts
            );
            attempt += 1;
            tokio::time::sleep(self.backoff).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retried() {
        assert!(transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(transient_status(StatusCode::BAD_GATEWAY));
        assert!(transient_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn client_and_not_found_errors_are_not_retried() {
        assert!(!transient_status(StatusCode::NOT_FOUND));
        assert!(!transient_status(StatusCode::FORBIDDEN));
        assert!(!transient_status(StatusCode::OK));
    }

    #[test]
    fn default_policy_matches_the_documented_ceiling() {
        let policy = RetryPolicy::transient();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.backoff(), Duration::from_millis(1000));
    }

    #[test]
    fn at_least_one_attempt_is_always_made() {
        let policy = RetryPolicy::new(0, Duration::ZERO, transient_status);
        assert_eq!(policy.max_attempts(), 1);
    }
}
