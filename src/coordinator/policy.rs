use std::time::Duration;

use crate::config::RedeliverySettings;

/// Decides when a failing message stops being redelivered and how long the
/// caller should back off before the next attempt.
///
/// The core never sleeps; `delay_for` is advisory.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Negative means unlimited.
    pub max_redeliveries: i32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_exponential_backoff: bool,
    pub max_delay: Option<Duration>,
    pub report_exhaustion: bool,
}

impl RedeliveryPolicy {
    pub const DEFAULT_MAX_REDELIVERIES: i32 = 6;
    pub const UNLIMITED: i32 = -1;

    pub fn with_max_redeliveries(mut self, max_redeliveries: i32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    pub fn with_report_exhaustion(mut self, report: bool) -> Self {
        self.report_exhaustion = report;
        self
    }

    /// Whether a message already redelivered `redeliveries` times has used up
    /// its budget.
    pub fn is_exhausted(&self, redeliveries: u32) -> bool {
        u32::try_from(self.max_redeliveries).is_ok_and(|max| redeliveries >= max)
    }

    /// Backoff before redelivery number `redelivery` (1-based).
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        if redelivery == 0 {
            return Duration::ZERO;
        }
        let delay = if self.use_exponential_backoff && self.backoff_multiplier > 1.0 {
            let exponent = i32::try_from(redelivery - 1).unwrap_or(i32::MAX);
            let factor = self.backoff_multiplier.powi(exponent);
            // Float-to-int `as` saturates, so a runaway factor caps at u64::MAX.
            Duration::from_millis((self.initial_delay.as_millis() as f64 * factor).round() as u64)
        } else {
            self.initial_delay
        };
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: Self::DEFAULT_MAX_REDELIVERIES,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 5.0,
            use_exponential_backoff: false,
            max_delay: None,
            report_exhaustion: true,
        }
    }
}

impl From<&RedeliverySettings> for RedeliveryPolicy {
    fn from(settings: &RedeliverySettings) -> Self {
        Self {
            max_redeliveries: settings.max_redeliveries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            use_exponential_backoff: settings.use_exponential_backoff,
            max_delay: settings.max_delay_ms.map(Duration::from_millis),
            report_exhaustion: settings.report_exhaustion,
        }
    }
}
