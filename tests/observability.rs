//! Global subscriber installation runs in its own test binary so it never
//! races the `tracing-test` subscribers used by the unit tests.

use toolgate_core::observability::{init_tracing, init_tracing_from};
use toolgate_core::types::ObservabilityConfig;

#[test]
fn init_tracing_is_idempotent() {
    init_tracing();
    init_tracing_from(&ObservabilityConfig::default());
    tracing::info!("tracing_initialized_twice");
}
