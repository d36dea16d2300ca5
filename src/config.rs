//! Broker connection settings.
//!
//! Settings are read from environment variables (a `.env` file is loaded
//! first when present):
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `RABBITMQ_URLS` | comma-separated broker URLs, tried in order | required |
//! | `RABBITMQ_QUEUE` | queue consumed by the inbound handler | required |
//! | `RABBITMQ_QUEUE_DURABLE` | whether the queue survives broker restarts | `false` |
//! | `RABBITMQ_PREFETCH_COUNT` | unacknowledged deliveries per consumer | `1` |
//! | `RABBITMQ_EXCHANGE` | exchange used for publishing | default exchange |

use tracing_error::SpanTrace;

pub const URLS_VAR: &str = "RABBITMQ_URLS";
pub const QUEUE_VAR: &str = "RABBITMQ_QUEUE";
pub const QUEUE_DURABLE_VAR: &str = "RABBITMQ_QUEUE_DURABLE";
pub const PREFETCH_COUNT_VAR: &str = "RABBITMQ_PREFETCH_COUNT";
pub const EXCHANGE_VAR: &str = "RABBITMQ_EXCHANGE";

/// Validated broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker URLs, at least one.
    pub urls: Vec<String>,
    /// Queue name, also the pattern the inbound handler is bound to.
    pub queue: String,
    pub queue_durable: bool,
    pub prefetch_count: u16,
    /// Exchange used for publishing, empty for the default exchange.
    pub exchange: String,
}

impl BrokerConfig {
    /// Settings for a single broker and queue, with defaults for the rest.
    pub fn new(url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            queue: queue.into(),
            queue_durable: false,
            prefetch_count: 1,
            exchange: String::new(),
        }
    }

    /// Read the settings from the process environment.
    #[tracing::instrument]
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(error) = dotenv::dotenv() {
            tracing::debug!(%error, "No .env file loaded");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the settings through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let urls: Vec<String> = required(&lookup, URLS_VAR)?
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_owned)
            .collect();
        if urls.is_empty() {
            return Err(ConfigError::invalid(URLS_VAR, "no broker URL given"));
        }

        let queue = required(&lookup, QUEUE_VAR)?.trim().to_owned();
        if queue.is_empty() {
            return Err(ConfigError::invalid(QUEUE_VAR, "queue name is empty"));
        }

        let queue_durable = match lookup(QUEUE_DURABLE_VAR) {
            Some(value) => parse_bool(&value)
                .ok_or_else(|| ConfigError::invalid(QUEUE_DURABLE_VAR, "expected a boolean"))?,
            None => false,
        };

        let prefetch_count = match lookup(PREFETCH_COUNT_VAR) {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| {
                    ConfigError::invalid(PREFETCH_COUNT_VAR, "expected a positive integer")
                })?,
            None => 1,
        };

        let exchange = lookup(EXCHANGE_VAR)
            .map(|exchange| exchange.trim().to_owned())
            .unwrap_or_default();

        Ok(Self {
            urls,
            queue,
            queue_durable,
            prefetch_count,
            exchange,
        })
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).ok_or_else(|| ConfigError::missing(name))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Error returned when the settings are missing or malformed.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

/// Configuration errors kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A required variable is not set.
    Missing(&'static str),
    /// A variable is set to an unusable value.
    Invalid {
        name: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    fn missing(name: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Missing(name),
        }
    }

    fn invalid(name: &'static str, reason: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Invalid { name, reason },
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::Missing(name) => writeln!(f, "{name} is not set"),
            ConfigErrorKind::Invalid { name, reason } => writeln!(f, "{name} is invalid: {reason}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| vars.get(name).map(|value| value.to_string())
    }

    #[test]
    fn applies_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[
            (URLS_VAR, "amqp://localhost:5672"),
            (QUEUE_VAR, "test-queue"),
        ]))
        .unwrap();

        assert_eq!(
            config,
            BrokerConfig::new("amqp://localhost:5672", "test-queue")
        );
    }

    #[test]
    fn splits_and_trims_urls() {
        let config = BrokerConfig::from_lookup(lookup(&[
            (URLS_VAR, "amqp://a:5672, amqp://b:5672,,"),
            (QUEUE_VAR, "jobs"),
        ]))
        .unwrap();

        assert_eq!(config.urls, vec!["amqp://a:5672", "amqp://b:5672"]);
    }

    #[test]
    fn reads_optional_settings() {
        let config = BrokerConfig::from_lookup(lookup(&[
            (URLS_VAR, "amqp://a"),
            (QUEUE_VAR, "jobs"),
            (QUEUE_DURABLE_VAR, "TRUE"),
            (PREFETCH_COUNT_VAR, "10"),
            (EXCHANGE_VAR, "events"),
        ]))
        .unwrap();

        assert!(config.queue_durable);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.exchange, "events");
    }

    #[test]
    fn reports_missing_variables() {
        let err = BrokerConfig::from_lookup(lookup(&[(URLS_VAR, "amqp://a")])).unwrap_err();
        assert_eq!(err.kind(), &ConfigErrorKind::Missing(QUEUE_VAR));

        let err = BrokerConfig::from_lookup(lookup(&[(QUEUE_VAR, "jobs")])).unwrap_err();
        assert_eq!(err.kind(), &ConfigErrorKind::Missing(URLS_VAR));
        assert!(err.to_string().starts_with("RABBITMQ_URLS is not set"));
    }

    #[test]
    fn rejects_unusable_values() {
        let cases = [
            (URLS_VAR, " , ", QUEUE_VAR, "jobs"),
            (URLS_VAR, "amqp://a", QUEUE_VAR, "  "),
        ];
        for (k1, v1, k2, v2) in cases {
            let err = BrokerConfig::from_lookup(lookup(&[(k1, v1), (k2, v2)])).unwrap_err();
            assert!(matches!(err.kind(), ConfigErrorKind::Invalid { .. }));
        }

        for (name, value) in [
            (QUEUE_DURABLE_VAR, "maybe"),
            (PREFETCH_COUNT_VAR, "0"),
            (PREFETCH_COUNT_VAR, "-1"),
        ] {
            let err = BrokerConfig::from_lookup(lookup(&[
                (URLS_VAR, "amqp://a"),
                (QUEUE_VAR, "jobs"),
                (name, value),
            ]))
            .unwrap_err();
            assert!(matches!(err.kind(), ConfigErrorKind::Invalid { name: n, .. } if *n == name));
        }
    }
}
