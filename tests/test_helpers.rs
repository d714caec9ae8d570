//! Test helpers for timing-sensitive tests
//!
//! Relay tests wait on background tasks (session registration, discovery
//! updates), so they poll with CI-adjusted deadlines instead of sleeping.

use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use veil_core::LoggingConfig;

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber once per test binary
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let config = LoggingConfig {
            level: "warn".to_string(),
            ansi: false,
        };
        // Another harness may already own the global subscriber.
        let _ = config.init();
    });
}

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// Returns a timeout that's longer in CI environments to account for
/// resource contention and slower machines.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout.mul_f32(3.0)
    } else {
        base_timeout.mul_f32(1.5)
    }
}

/// Default deadline for a single step of a test
pub fn step_timeout() -> Duration {
    ci_timeout(Duration::from_secs(5))
}

/// Await `fut`, panicking with `what` if it misses the step deadline
///
/// # Panics
///
/// Panics on timeout.
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(step_timeout(), fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Poll `check` every 10ms until it returns true
///
/// # Panics
///
/// Panics if `check` is still false at the step deadline.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    within(what, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_timeout_extends_base() {
        let base = Duration::from_secs(2);
        assert!(ci_timeout(base) > base);
    }

    #[tokio::test]
    async fn test_wait_until_returns_when_true() {
        let mut polls = 0;
        wait_until("third poll", || {
            polls += 1;
            let ready = polls >= 3;
            async move { ready }
        })
        .await;
        assert_eq!(polls, 3);
    }
}
