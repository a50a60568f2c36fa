//! Retry and error recovery utilities
//!
//! Provides exponential backoff for ledger RPC failures and the error
//! classification shared by the poll loops, the queue consumers and the writers.

use bridge_core::BridgeError;
use eyre::Result;

use crate::queue::RejectedMessage;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// The work already happened - treat as success
    Benign,
    /// Permanent failure - do not retry (invalid params, contract error)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("nonce too low")
        || error_lower.contains("already known")
        || error_lower.contains("already executed")
        || error_lower.contains("signature already collected")
    {
        return ErrorClass::Benign;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("not part of the validator set")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Classify a report, preferring the typed bridge taxonomy when present
pub fn classify_report(report: &eyre::Report) -> ErrorClass {
    if let Some(err) = report.downcast_ref::<BridgeError>() {
        return if err.is_benign() {
            ErrorClass::Benign
        } else if err.is_permanent() {
            ErrorClass::Permanent
        } else {
            ErrorClass::Transient
        };
    }
    if report.downcast_ref::<serde_json::Error>().is_some()
        || report.downcast_ref::<RejectedMessage>().is_some()
    {
        return ErrorClass::Permanent;
    }
    classify_error(&format!("{:#}", report))
}

/// Retry context for one unit of work
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub config: RetryConfig,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub last_class: Option<ErrorClass>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default())
    }

    pub fn with_config(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_error: None,
            last_class: None,
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: &eyre::Report) {
        self.attempt += 1;
        self.last_error = Some(format!("{:#}", error));
        self.last_class = Some(classify_report(error));
    }

    /// Get the decision for the next attempt
    pub fn next_action(&self) -> RetryAction {
        let error = self.last_error.as_deref().unwrap_or("");

        match self.last_class.clone().unwrap_or(ErrorClass::Unknown) {
            ErrorClass::Permanent => {
                warn!(error = %error, "Permanent error - dead lettering");
                RetryAction::DeadLetter
            }
            ErrorClass::Benign => {
                debug!(error = %error, "Already processed, skipping");
                RetryAction::Skip
            }
            ErrorClass::Transient | ErrorClass::Unknown => {
                if !self.config.should_retry(self.attempt) {
                    return RetryAction::DeadLetter;
                }
                let backoff = self.config.backoff_for_attempt(self.attempt.saturating_sub(1));
                debug!(
                    ?backoff,
                    attempt = self.attempt,
                    "Transient error - retrying"
                );
                RetryAction::RetryAfter(backoff)
            }
        }
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_error = None;
        self.last_class = None;
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Retry after a backoff period
    RetryAfter(Duration),
    /// Skip (already processed)
    Skip,
    /// Give up (permanent failure or retries exhausted)
    DeadLetter,
}

/// Execute with retry logic
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut ctx = RetryContext::with_config(config.clone());

    loop {
        match operation(ctx.attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                ctx.record_failure(&e);

                match ctx.next_action() {
                    RetryAction::RetryAfter(backoff) => {
                        warn!(
                            attempt = ctx.attempt,
                            max = config.max_retries,
                            ?backoff,
                            error = %format!("{:#}", e),
                            "Retrying after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    RetryAction::Skip => return Err(e),
                    RetryAction::DeadLetter => {
                        return Err(e.wrap_err(format!("giving up after {} attempts", ctx.attempt)))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256};
    use eyre::eyre;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
        assert_eq!(config.backoff_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("nonce too low"), ErrorClass::Benign);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_typed_errors_take_precedence() {
        let benign = eyre::Report::new(BridgeError::AlreadyExecuted(B256::ZERO))
            .wrap_err("collecting lock receipt");
        assert_eq!(classify_report(&benign), ErrorClass::Benign);

        let permanent = eyre::Report::new(BridgeError::NotAValidator(Address::ZERO));
        assert_eq!(classify_report(&permanent), ErrorClass::Permanent);

        // Message text would look transient; the type says otherwise
        let queue = eyre::Report::new(BridgeError::QueueUnavailable("connection reset".into()));
        assert_eq!(classify_report(&queue), ErrorClass::Transient);

        let rejected = eyre::Report::new(RejectedMessage("unlock on lock queue".into()));
        assert_eq!(classify_report(&rejected), ErrorClass::Permanent);

        let bad_body = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(
            classify_report(&eyre::Report::new(bad_body)),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_retry_context_exhausts() {
        let mut ctx = RetryContext::with_config(RetryConfig::new(2, Duration::from_millis(10)));
        ctx.record_failure(&eyre!("connection refused"));
        assert_eq!(
            ctx.next_action(),
            RetryAction::RetryAfter(Duration::from_millis(10))
        );
        ctx.record_failure(&eyre!("connection refused"));
        assert_eq!(ctx.next_action(), RetryAction::DeadLetter);

        ctx.reset();
        assert_eq!(ctx.attempt, 0);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1));

        let result = with_retry(&config, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(eyre!("network unreachable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(5, Duration::from_millis(1));

        let result: Result<()> = with_retry(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre!("execution reverted")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
