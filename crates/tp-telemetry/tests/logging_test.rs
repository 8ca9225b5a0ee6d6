use tp_core::config::GeneralConfig;
use tp_telemetry::logging;

#[test]
fn test_init_logging_human() {
    // Should not panic; second call is a safe no-op.
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // The global subscriber may already be set by another test; this no-ops.
    logging::init_logging_json("test-service-json", "info");

    tracing::info!(key = "value", "json log line");
}

#[test]
fn test_init_from_config() {
    let general = GeneralConfig {
        json_logs: true,
        ..GeneralConfig::default()
    };
    logging::init_from_config("config-test", &general);
    logging::init_from_config("config-test", &GeneralConfig::default());
}
