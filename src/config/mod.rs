mod settings;


use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LoggingSettings, RetrySettings, Settings, SubscriberSettings,
};

/// Loads the configuration from the default file and environment variables.
///
/// Sources, lowest precedence first: built-in defaults, `config/default.*`,
/// then `PERIL__<SECTION>__<KEY>` environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("PERIL")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let broker = partial.broker;
    let subscriber = partial.subscriber;
    let retry = partial.retry;
    let logging = partial.logging;

    Settings {
        broker: BrokerSettings {
            url: broker
                .as_ref()
                .and_then(|b| b.url.clone())
                .unwrap_or(default.broker.url),
            exchange: broker
                .as_ref()
                .and_then(|b| b.exchange.clone())
                .unwrap_or(default.broker.exchange),
            dead_letter_exchange: broker
                .as_ref()
                .and_then(|b| b.dead_letter_exchange.clone())
                .unwrap_or(default.broker.dead_letter_exchange),
            dead_letter_queue: broker
                .as_ref()
                .and_then(|b| b.dead_letter_queue.clone())
                .unwrap_or(default.broker.dead_letter_queue),
        },
        subscriber: SubscriberSettings {
            durable_prefetch: subscriber
                .as_ref()
                .and_then(|s| s.durable_prefetch)
                .unwrap_or(default.subscriber.durable_prefetch),
            max_redeliveries: subscriber
                .as_ref()
                .and_then(|s| s.max_redeliveries)
                .unwrap_or(default.subscriber.max_redeliveries),
        },
        retry: RetrySettings {
            initial_backoff_ms: retry
                .as_ref()
                .and_then(|r| r.initial_backoff_ms)
                .unwrap_or(default.retry.initial_backoff_ms),
            max_backoff_ms: retry
                .as_ref()
                .and_then(|r| r.max_backoff_ms)
                .unwrap_or(default.retry.max_backoff_ms),
            max_attempts: retry
                .as_ref()
                .and_then(|r| r.max_attempts)
                .unwrap_or(default.retry.max_attempts),
        },
        logging: LoggingSettings {
            level: logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    }
}
