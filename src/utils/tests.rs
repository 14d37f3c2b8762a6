use super::error::PubSubError;
use super::logging;

#[test]
fn logging_init_installs_once() {
    logging::init("info");
    // the global subscriber is already in place
    assert!(!logging::init("debug"));
    assert!(!logging::init_from(&crate::config::LoggingSettings {
        level: "warn".to_string()
    }));
}

#[test]
fn test_parse_level() {
    assert_eq!(logging::parse_level("ERROR"), tracing::Level::ERROR);
    assert_eq!(logging::parse_level("warning"), tracing::Level::WARN);
    assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
}

#[test]
fn test_only_connection_errors_are_retryable() {
    assert!(PubSubError::Connection("refused".into()).is_retryable());
    assert!(!PubSubError::Topology("conflict".into()).is_retryable());
    assert!(!PubSubError::Publish("no exchange".into()).is_retryable());
    assert!(!PubSubError::Ack("unknown tag".into()).is_retryable());
}

#[test]
fn test_json_error_maps_to_serialization() {
    let err = serde_json::from_str::<u32>("not a number").unwrap_err();
    let err: PubSubError = err.into();
    assert!(matches!(err, PubSubError::Serialization(_)));
    assert!(err.to_string().starts_with("serialization error"));
}
