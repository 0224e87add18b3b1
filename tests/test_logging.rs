//! Tests for logging configuration and format parsing

use edgepub::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_invalid_defaults_to_json() {
    // Unknown formats fall back to machine-readable output
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    assert_eq!(LogFormat::parse("123"), LogFormat::Json);
    assert_eq!(LogFormat::parse("  json  "), LogFormat::Json);
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_default_logging_initializes_once() {
    edgepub::observability::init_default_logging();
    edgepub::observability::init_default_logging();
    tracing::info!(topic = "alerts", outcome = "sent", "logging works");
}
