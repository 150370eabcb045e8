use serde::{Deserialize, Serialize};

/// Top-level configuration for a consumer's delivery core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub consumer: ConsumerSettings,
    pub redelivery: RedeliverySettings,
    pub logging: LoggingSettings,
}

/// Identity, prefetch and expiry settings for one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Generated when not configured.
    pub id: Option<String>,
    /// Used for entries whose message and receive path name no destination.
    pub destination: String,
    /// Outstanding plus pending entries the flow-control layer allows.
    pub prefetch_limit: usize,
    /// How often a parked receiver re-checks the head for expired entries.
    pub ttl_check_interval_ms: u64,
}

/// Retry budget and backoff applied to failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeliverySettings {
    /// Negative means unlimited.
    pub max_redeliveries: i32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_exponential_backoff: bool,
    pub max_delay_ms: Option<u64>,
    /// Log exhaustion at warn level and mark the poison cause accordingly.
    pub report_exhaustion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub consumer: Option<PartialConsumerSettings>,
    pub redelivery: Option<PartialRedeliverySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialConsumerSettings {
    pub id: Option<String>,
    pub destination: Option<String>,
    pub prefetch_limit: Option<usize>,
    pub ttl_check_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialRedeliverySettings {
    pub max_redeliveries: Option<i32>,
    pub initial_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub use_exponential_backoff: Option<bool>,
    pub max_delay_ms: Option<u64>,
    pub report_exhaustion: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            consumer: ConsumerSettings {
                id: None,
                destination: "default".to_string(),
                prefetch_limit: 1000,
                ttl_check_interval_ms: 100,
            },
            redelivery: RedeliverySettings {
                max_redeliveries: 6,
                initial_delay_ms: 1000,
                backoff_multiplier: 5.0,
                use_exponential_backoff: false,
                max_delay_ms: None,
                report_exhaustion: true,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlay the values that were provided on top of `base`.
    pub fn merge_onto(self, base: Settings) -> Settings {
        let consumer = self.consumer.unwrap_or_default();
        let redelivery = self.redelivery.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            consumer: ConsumerSettings {
                id: consumer.id.or(base.consumer.id),
                destination: consumer.destination.unwrap_or(base.consumer.destination),
                prefetch_limit: consumer
                    .prefetch_limit
                    .unwrap_or(base.consumer.prefetch_limit),
                ttl_check_interval_ms: consumer
                    .ttl_check_interval_ms
                    .unwrap_or(base.consumer.ttl_check_interval_ms),
            },
            redelivery: RedeliverySettings {
                max_redeliveries: redelivery
                    .max_redeliveries
                    .unwrap_or(base.redelivery.max_redeliveries),
                initial_delay_ms: redelivery
                    .initial_delay_ms
                    .unwrap_or(base.redelivery.initial_delay_ms),
                backoff_multiplier: redelivery
                    .backoff_multiplier
                    .unwrap_or(base.redelivery.backoff_multiplier),
                use_exponential_backoff: redelivery
                    .use_exponential_backoff
                    .unwrap_or(base.redelivery.use_exponential_backoff),
                max_delay_ms: redelivery.max_delay_ms.or(base.redelivery.max_delay_ms),
                report_exhaustion: redelivery
                    .report_exhaustion
                    .unwrap_or(base.redelivery.report_exhaustion),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(base.logging.level),
            },
        }
    }
}
