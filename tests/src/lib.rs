//! Shared setup for the end-to-end scenarios.

use once_cell::sync::Lazy;

use flowline_core::{init_logging, LoggingConfig};
pub use flowline_test_utils::{sample_registry, TestNetwork};

static LOGGING: Lazy<()> = Lazy::new(|| {
    let config = LoggingConfig {
        filter: "flowline_core=debug,flowline_test_utils=info".to_string(),
        json: false,
    };
    // Another test binary in the same process may have installed one already
    let _ = init_logging(&config);
});

/// Install the tracing subscriber once per test binary
pub fn init_test_logging() {
    Lazy::force(&LOGGING);
}

/// Two-member network running the sample flows
pub fn alice_and_bob() -> TestNetwork {
    init_test_logging();
    TestNetwork::new(sample_registry(), &["O=Alice", "O=Bob"])
}
