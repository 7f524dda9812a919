use std::{
    str::FromStr,
    sync::Once,
};

use tracing_core::Level;

static INIT: Once = Once::new();

/// Environment variable for overriding the log level of tests.
pub const LOG_LEVEL_VAR: &str = "WAMP_ROUTER_TEST_LOG";

fn log_level() -> Level {
    std::env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| Level::from_str(&level).ok())
        .unwrap_or(Level::DEBUG)
}

/// Installs the global log subscriber for tests.
///
/// Records emitted through the `log` facade are forwarded to the subscriber. Safe to call from
/// every test.
pub fn setup_test_environment() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(log_level())
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    });
}
