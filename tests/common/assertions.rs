// Custom test assertions for lock manager integration tests

use std::time::Duration;
use strata_dlm::lock::LockRef;
use strata_dlm::types::{LockFlags, LockMode};
use tokio::time::Instant;

/// Outcome of one check, with the details shown when it fails.
#[derive(Debug, Default)]
pub struct AssertionResult {
    failure: Option<String>,
    details: Vec<(&'static str, String)>,
}

impl AssertionResult {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            details: Vec::new(),
        }
    }

    pub fn check(passed: bool, message: impl Into<String>) -> Self {
        if passed {
            Self::pass()
        } else {
            Self::fail(message)
        }
    }

    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    pub fn with_expected(self, expected: impl Into<String>) -> Self {
        self.detail("expected", expected.into())
    }

    pub fn with_actual(self, actual: impl Into<String>) -> Self {
        self.detail("actual", actual.into())
    }

    fn detail(mut self, label: &'static str, value: String) -> Self {
        if self.failure.is_some() {
            self.details.push((label, value));
        }
        self
    }

    /// Panic with the message and details if the check failed.
    pub fn assert(self) {
        let Some(failure) = self.failure else {
            return;
        };
        let details: String = self
            .details
            .iter()
            .map(|(label, value)| format!("\n  {}: {}", label, value))
            .collect();
        panic!("{}{}", failure, details);
    }
}

/// Re-run `check` every 10ms of tokio time until it passes or `timeout`
/// runs out. Works under paused time too.
pub async fn assert_eventually<F>(mut check: F, timeout: Duration) -> AssertionResult
where
    F: FnMut() -> AssertionResult,
{
    let deadline = Instant::now() + timeout;
    loop {
        let result = check();
        if result.passed() {
            return result;
        }
        if Instant::now() >= deadline {
            let reason = result.failure.unwrap_or_default();
            return AssertionResult {
                failure: Some(format!("still failing after {:?}: {}", timeout, reason)),
                details: result.details,
            };
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `lock` carries any of `flags`.
pub async fn wait_for_flags(lock: &LockRef, flags: LockFlags, timeout: Duration) {
    assert_eventually(
        || {
            AssertionResult::check(lock.has_flags(flags), "lock flags not set")
                .with_expected(format!("{:?}", flags))
                .with_actual(format!("{:?}", lock.flags()))
        },
        timeout,
    )
    .await
    .assert();
}

/// Assert `lock` is granted in `mode`.
pub fn assert_granted(lock: &LockRef, mode: LockMode) {
    AssertionResult::check(lock.granted_mode() == Some(mode), "lock not granted")
        .with_expected(mode.to_string())
        .with_actual(format!("{}", lock.debug()))
        .assert();
}

/// Assert `lock` was cancelled and destroyed.
pub fn assert_destroyed(lock: &LockRef) {
    AssertionResult::check(lock.has_flags(LockFlags::DESTROYED), "lock still alive")
        .with_actual(format!("{}", lock.debug()))
        .assert();
}
