//! Scenario suites that boot a whole kernel on the host backend.

mod helpers;
mod integration;
mod stress;

/// Sizes used by the suites.
pub(crate) struct TestConfig {
    pub(crate) stress_thread_count: usize,
    pub(crate) stress_batch: usize,
    pub(crate) lpc_clients: usize,
    pub(crate) lpc_rounds: usize,
    pub(crate) race_rounds: usize,
}

pub(crate) static TEST_CONFIG: spin::Mutex<TestConfig> = spin::Mutex::new(TestConfig {
    stress_thread_count: 1000,
    stress_batch: 50,
    lpc_clients: 8,
    lpc_rounds: 50,
    race_rounds: 30,
});
