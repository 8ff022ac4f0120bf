//! Call deadlines.

use grpc::Metadata;
use grpc::Timeout;
use grpc::timeout::GRPC_TIMEOUT;
use std::time::Duration;
use tokio::time::Instant;

/// When a call must be finished by, if ever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// A deadline `timeout` from `now`. A timeout too large to represent
    /// means no deadline.
    pub fn after(now: Instant, timeout: Duration) -> Self {
        Self {
            at: now.checked_add(timeout),
        }
    }

    /// Derive the deadline from the `grpc-timeout` request header.
    ///
    /// A missing header means no deadline. So does a malformed one, which
    /// is logged and otherwise ignored.
    pub fn from_headers(headers: &Metadata, now: Instant) -> Self {
        let Some(value) = headers.get(GRPC_TIMEOUT) else {
            return Self::none();
        };
        match Timeout::parse(value) {
            Some(timeout) => Self::after(now, timeout.as_duration()),
            None => {
                tracing::debug!(value, "ignoring invalid grpc-timeout header");
                Self::none()
            }
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Resolves when the deadline passes. Never resolves without one.
    pub async fn expired(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(timeout: &str) -> Metadata {
        let mut md = Metadata::new();
        md.insert(GRPC_TIMEOUT, timeout);
        md
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_from_header() {
        let now = Instant::now();
        let deadline = Deadline::from_headers(&headers("100m"), now);
        assert_eq!(deadline.instant(), Some(now + Duration::from_millis(100)));
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(100)));
        assert!(!deadline.is_expired());

        deadline.expired().await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_or_invalid_header_means_no_deadline() {
        let now = Instant::now();
        assert_eq!(Deadline::from_headers(&Metadata::new(), now), Deadline::none());
        assert_eq!(Deadline::from_headers(&headers("soon"), now), Deadline::none());
        assert_eq!(Deadline::from_headers(&headers("0S"), now), Deadline::none());

        let none = Deadline::none();
        assert!(none.remaining().is_none());
        let raced = tokio::time::timeout(Duration::from_secs(3600), none.expired()).await;
        assert!(raced.is_err());
    }

    #[tokio::test]
    async fn test_huge_timeout_means_no_deadline() {
        let deadline = Deadline::after(Instant::now(), Duration::MAX);
        assert!(deadline.instant().is_none());
    }
}
