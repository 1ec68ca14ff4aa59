//! Caller-supplied deadlines for long-running operations.

use std::time::{Duration, Instant};

/// An optional deadline carried through an operation.
///
/// Remote actions and polling loops take a `Deadline` alongside their own
/// default timeout; the effective timeout for any single call is
/// `min(remaining, default)`, so an operation never outlives the time its
/// caller has left.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline: operations run up to their own default timeouts.
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline at a fixed instant.
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Time remaining until the deadline, if one is set.
    ///
    /// Returns `Some(Duration::ZERO)` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }

    /// Effective timeout for a single call: `min(remaining, default)`.
    pub fn clamp(&self, default: Duration) -> Duration {
        match self.remaining() {
            Some(rem) => rem.min(default),
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadline_uses_default() {
        let d = Deadline::none();
        assert_eq!(d.clamp(Duration::from_secs(180)), Duration::from_secs(180));
        assert!(!d.expired());
        assert!(d.remaining().is_none());
    }

    #[test]
    fn test_deadline_truncates_default() {
        let d = Deadline::after(Duration::from_secs(10));
        let clamped = d.clamp(Duration::from_secs(180));
        assert!(clamped <= Duration::from_secs(10));
        assert!(clamped > Duration::from_secs(9));
    }

    #[test]
    fn test_expired_deadline() {
        let d = Deadline::at(Instant::now() - Duration::from_secs(1));
        assert!(d.expired());
        assert_eq!(d.clamp(Duration::from_secs(180)), Duration::ZERO);
    }
}
