//! The `grpc-timeout` request header.

use std::time::Duration;

/// Header name for the call timeout.
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// The wire format allows at most eight digits before the unit.
const MAX_DIGITS: usize = 8;

const NANOS_PER_UNIT: [(char, u64); 6] = [
    ('H', 3_600_000_000_000),
    ('M', 60_000_000_000),
    ('S', 1_000_000_000),
    ('m', 1_000_000),
    ('u', 1_000),
    ('n', 1),
];

/// A relative call timeout as carried in `grpc-timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeout(Duration);

impl Timeout {
    pub fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Parse a header value such as `100m` or `5S`.
    ///
    /// The value must be a positive integer of at most eight digits followed
    /// by one of `H`, `M`, `S`, `m`, `u` or `n`. Anything else, including a
    /// zero amount, yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let unit = value.chars().last()?;
        let digits = &value[..value.len() - unit.len_utf8()];

        if digits.is_empty()
            || digits.len() > MAX_DIGITS
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let amount: u64 = digits.parse().ok()?;
        if amount == 0 {
            return None;
        }

        let (_, scale) = NANOS_PER_UNIT.iter().find(|(u, _)| *u == unit)?;
        let nanos = u128::from(amount) * u128::from(*scale);
        Some(Self(Duration::new(
            (nanos / 1_000_000_000) as u64,
            (nanos % 1_000_000_000) as u32,
        )))
    }

    /// Render as a header value in the finest unit whose amount fits in
    /// eight digits. Remainders round up so the peer never sees a shorter
    /// timeout than intended.
    pub fn to_header_value(self) -> String {
        let nanos = self.0.as_nanos().max(1);
        for &(unit, scale) in NANOS_PER_UNIT.iter().rev() {
            let scale = u128::from(scale);
            let amount = nanos.div_ceil(scale);
            if amount < 100_000_000 {
                return format!("{amount}{unit}");
            }
        }
        "99999999H".to_string()
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}
