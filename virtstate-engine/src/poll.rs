//! Generic state polling.
//!
//! Action completion only proves the server accepted a transition, so every
//! lifecycle step that cares about the resulting state re-polls until a
//! target status is observed. The loop backs off between checks and honors
//! the caller's deadline, truncating its own ceiling when the deadline is
//! shorter.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::trace;
use virtstate_client::ClientError;
use virtstate_common::Deadline;

/// Poll timing parameters.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Pause before the first check.
    pub delay: Duration,
    /// Starting interval between checks.
    pub min_interval: Duration,
    /// Backoff ceiling for the interval.
    pub max_interval: Duration,
    /// Overall ceiling for the whole poll.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Why a poll gave up.
#[derive(Debug)]
pub enum PollError {
    /// The poll's own ceiling passed without reaching a target status.
    Timeout,
    /// The caller's deadline expired first.
    Cancelled,
    /// A refresh call failed; carries the underlying error (including
    /// not-found, which some callers treat as a terminal success).
    Refresh(ClientError),
}

/// Poll `refresh` until it reports one of `targets`.
///
/// `refresh` returns the current object plus a status label. Any refresh
/// error aborts the poll immediately. The effective ceiling is
/// `min(deadline remaining, config.timeout)`; on expiry the error says
/// whether the caller's deadline or the poll ceiling was the limiting one.
pub async fn wait_for_state<T, F, Fut>(
    config: &PollConfig,
    deadline: Deadline,
    targets: &[&str],
    mut refresh: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(T, String), ClientError>>,
{
    let ceiling = Instant::now() + deadline.clamp(config.timeout);
    let mut interval = config.min_interval;

    sleep_until(ceiling, config.delay).await;
    loop {
        if Instant::now() >= ceiling {
            return Err(if deadline.expired() {
                PollError::Cancelled
            } else {
                PollError::Timeout
            });
        }

        let (value, status) = refresh().await.map_err(PollError::Refresh)?;
        trace!(status = %status, "poll tick");
        if targets.contains(&status.as_str()) {
            return Ok(value);
        }

        sleep_until(ceiling, interval).await;
        interval = (interval * 2).min(config.max_interval);
    }
}

// Never sleep past the ceiling, so expiry is noticed promptly.
async fn sleep_until(ceiling: Instant, wanted: Duration) {
    let remaining = ceiling.saturating_duration_since(Instant::now());
    tokio::time::sleep(wanted.min(remaining)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> PollConfig {
        PollConfig {
            delay: Duration::from_millis(1),
            min_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            timeout: Duration::from_millis(250),
        }
    }

    #[tokio::test]
    async fn test_poll_reaches_target_after_intermediate_states() {
        let ticks = AtomicU32::new(0);
        let result = wait_for_state(&fast_config(), Deadline::none(), &["Running"], || {
            let tick = ticks.fetch_add(1, Ordering::SeqCst);
            async move {
                let status = if tick < 3 { "Starting" } else { "Running" };
                Ok((tick, status.to_string()))
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_poll_times_out_on_ceiling() {
        let result: Result<(), _> =
            wait_for_state(&fast_config(), Deadline::none(), &["Running"], || async {
                Ok(((), "Starting".to_string()))
            })
            .await;
        assert!(matches!(result, Err(PollError::Timeout)));
    }

    #[tokio::test]
    async fn test_short_deadline_reports_cancellation() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let config = PollConfig {
            timeout: Duration::from_secs(60),
            ..fast_config()
        };
        let started = Instant::now();
        let result: Result<(), _> = wait_for_state(&config, deadline, &["Running"], || async {
            Ok(((), "Starting".to_string()))
        })
        .await;
        assert!(matches!(result, Err(PollError::Cancelled)));
        // The deadline truncates the ceiling instead of waiting it out.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_refresh_error_aborts_immediately() {
        let result: Result<(), _> =
            wait_for_state(&fast_config(), Deadline::none(), &["Stopped"], || async {
                Err(ClientError::NotFound("c1".to_string()))
            })
            .await;
        match result {
            Err(PollError::Refresh(err)) => assert!(err.is_not_found()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
