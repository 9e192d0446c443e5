//! Reconnect Supervisor
//!
//! Restarts stream sessions after retryable failures. Sessions themselves
//! never retry: a dropped connection ends the session, and the supervisor
//! decides, from a [`ReconnectPolicy`], whether and when to start a new one.
//!
//! The default policy has `max_attempts = 0`, which disables reconnecting.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StreamError;
use crate::session::{EndReason, SessionHandle, SessionOutcome};

/// When and how often to reconnect
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive reconnect attempts before giving up (0 disables)
    pub max_attempts: u32,

    /// Delay before the first reconnect
    pub initial_backoff_ms: u64,

    /// Upper bound for the delay
    pub max_backoff_ms: u64,

    /// Growth factor between attempts
    pub backoff_multiplier: f32,

    /// Add up to 25% random jitter to each delay
    pub use_jitter: bool,

    /// HTTP statuses worth retrying
    pub retry_status_codes: Vec<u16>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether reconnecting is enabled at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Backoff before reconnect attempt `attempt` (0-indexed), ignoring the limit
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }

    /// Delay before reconnect attempt `attempt`, or `None` once attempts are
    /// exhausted
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.backoff_for_attempt(attempt))
    }

    /// Whether an error is worth reconnecting after
    ///
    /// Transport failures and listed HTTP statuses are; decode and
    /// configuration errors never are.
    #[must_use]
    pub fn is_retryable(&self, error: &StreamError) -> bool {
        match error {
            StreamError::Connect(_) | StreamError::Read(_) => true,
            StreamError::HttpStatus { status, .. } => self.retry_status_codes.contains(status),
            StreamError::Decode(_) | StreamError::Config(_) | StreamError::Task(_) => false,
        }
    }

    /// Whether a finished session should be followed by a new one
    #[must_use]
    pub fn should_restart(&self, outcome: &SessionOutcome) -> bool {
        match (outcome.summary.end_reason, &outcome.error) {
            (EndReason::Stopped, _) => false,
            (EndReason::EndOfStream, _) => true,
            (EndReason::Failed, Some(e)) => self.is_retryable(e),
            (EndReason::Failed, None) => false,
        }
    }
}

/// Run sessions until one ends for good
///
/// `start` is called with the number of consecutive failed attempts so far
/// and must return a started session. Between sessions the policy's backoff
/// applies; cancellation interrupts both a running session and a backoff
/// sleep. A session that read at least one frame resets the attempt count.
///
/// # Errors
///
/// The last start error, if the final attempt could not connect.
pub async fn supervise<F, Fut>(
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
    mut start: F,
) -> Result<SessionOutcome, StreamError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<SessionHandle, StreamError>>,
{
    let mut attempt = 0_u32;

    loop {
        let last = match start(attempt).await {
            Err(e) if !policy.is_retryable(&e) => return Err(e),
            Err(e) => Err(e),
            Ok(handle) => {
                let outcome = run_to_end(handle, cancel).await;
                if cancel.is_cancelled() || !policy.should_restart(&outcome) {
                    return Ok(outcome);
                }
                if outcome.summary.frames > 0 {
                    attempt = 0;
                }
                Ok(outcome)
            }
        };

        let Some(delay) = policy.delay_for_attempt(attempt) else {
            if policy.is_enabled() {
                warn!(attempts = attempt, "Reconnect attempts exhausted");
            }
            return last;
        };

        match &last {
            Err(e) => warn!(error = %e, attempt = attempt + 1, delay_ms = delay.as_millis(), "Stream connect failed, retrying"),
            Ok(outcome) => info!(
                end_reason = ?outcome.summary.end_reason,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Stream ended, reconnecting"
            ),
        }

        tokio::select! {
            () = cancel.cancelled() => return last,
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

async fn run_to_end(handle: SessionHandle, cancel: &CancellationToken) -> SessionOutcome {
    let stop = handle.cancellation_token();
    let wait = handle.wait();
    tokio::pin!(wait);

    tokio::select! {
        biased;
        outcome = &mut wait => outcome,
        () = cancel.cancelled() => {
            stop.cancel();
            wait.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::client::FeedClient;
    use crate::dispatch::Dispatcher;
    use crate::enrich::{Enricher, LanguageFilter, UnsetLanguagePolicy};
    use crate::session::StreamSession;
    use crate::sink::{TerminalSink, TerminalStyle};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            use_jitter: false,
            ..ReconnectPolicy::default()
        }
    }

    fn session(dispatcher: &Arc<Dispatcher>) -> StreamSession {
        let client = FeedClient::new(&ApiConfig {
            bearer_token: "t".into(),
            ..ApiConfig::default()
        })
        .unwrap();
        let enricher = Enricher::new(LanguageFilter::new(["en"], UnsetLanguagePolicy::PassThrough));
        StreamSession::new(client, enricher, Arc::clone(dispatcher)).keep_sinks_open()
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Box::new(TerminalSink::new(
            Box::new(std::io::sink()),
            TerminalStyle::Plain,
        ))))
    }

    #[test]
    fn test_default_is_disabled() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.is_enabled());
        assert_eq!(policy.delay_for_attempt(0), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(40));
        assert_eq!(policy.backoff_for_attempt(8), Duration::from_millis(40));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ReconnectPolicy {
            use_jitter: true,
            ..policy(3)
        };
        for _ in 0..20 {
            let delay = policy.backoff_for_attempt(0);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(13));
        }
    }

    #[test]
    fn test_retry_classification() {
        let policy = policy(3);
        assert!(policy.is_retryable(&StreamError::Read(std::io::Error::other("reset"))));
        assert!(policy.is_retryable(&StreamError::HttpStatus {
            status: 429,
            body: String::new()
        }));
        assert!(!policy.is_retryable(&StreamError::HttpStatus {
            status: 401,
            body: String::new()
        }));
        assert!(!policy.is_retryable(&StreamError::Decode(
            crate::error::DecodeError::Remote { messages: vec![] }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = supervise(&policy(2), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<SessionHandle, _>(StreamError::HttpStatus {
                    status: 503,
                    body: String::new(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(StreamError::HttpStatus { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = supervise(&policy(5), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<SessionHandle, _>(StreamError::HttpStatus {
                    status: 401,
                    body: String::new(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_end_of_stream() {
        let dispatcher = dispatcher();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let outcome = supervise(&policy(2), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let handle = session(&dispatcher).start_with_reader(std::io::Cursor::new(Vec::<u8>::new()));
            async move { Ok(handle) }
        })
        .await
        .unwrap();

        assert_eq!(outcome.summary.end_reason, EndReason::EndOfStream);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_policy_runs_once() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();

        let outcome = supervise(&ReconnectPolicy::disabled(), &cancel, |_| {
            let handle = session(&dispatcher).start_with_reader(std::io::Cursor::new(Vec::<u8>::new()));
            async move { Ok(handle) }
        })
        .await
        .unwrap();

        assert_eq!(outcome.summary.end_reason, EndReason::EndOfStream);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_session() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let (reader, _writer) = tokio::io::duplex(64);
        let mut reader = Some(tokio::io::BufReader::new(reader));

        let supervisor = {
            let cancel = cancel.clone();
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                supervise(&policy(5), &cancel, |_| {
                    let handle = reader
                        .take()
                        .map(|r| session(&dispatcher).start_with_reader(r));
                    async move { handle.ok_or_else(|| StreamError::Task("reader used".into())) }
                })
                .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let outcome = supervisor.await.unwrap().unwrap();
        assert_eq!(outcome.summary.end_reason, EndReason::Stopped);
    }
}
