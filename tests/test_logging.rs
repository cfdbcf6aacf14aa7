//! Tests for logging configuration and format parsing

use tracing::Level;
use wharf_messagebus::observability::logging::{parse_level, LogFormat, LogSettings};

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for input in ["invalid", "", "xml", "yaml", "123", "  json  "] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "Failed for input: '{input}'");
    }
}

#[test]
fn test_level_defaults_to_info() {
    assert_eq!(parse_level(""), Level::INFO);
    assert_eq!(parse_level("loud"), Level::INFO);
    assert_eq!(parse_level("warn"), Level::WARN);
}

#[test]
fn test_default_filter_quiets_broker_client() {
    let settings = LogSettings::from_lookup(|key| match key {
        "LOG_LEVEL" => Some("trace".to_string()),
        _ => None,
    });

    let directives = settings.filter_directives();
    assert!(directives.starts_with("trace,"));
    assert!(directives.contains("lapin=warn"));
    assert!(directives.contains("amq_protocol=warn"));
}

#[test]
fn test_init_logging_twice_does_not_panic() {
    let settings = LogSettings::default();
    wharf_messagebus::observability::init_logging(&settings);
    wharf_messagebus::observability::init_logging(&settings);
}
