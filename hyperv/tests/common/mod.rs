//! Shared fixtures for tests against the in-memory host.

#![allow(dead_code)]

use std::time::Duration;

use hyperv_jobs::{Generation, InMemoryHyperV, PollPolicy, Session, SessionConfig, VmHandle, VmState};

/// Fast polling and a short job timeout so stalled jobs fail quickly.
pub fn fast_config() -> SessionConfig {
    SessionConfig::local()
        .with_job_timeout(Duration::from_millis(300))
        .with_poll_policy(PollPolicy::fixed(Duration::from_millis(2)))
}

pub fn host() -> (InMemoryHyperV, Session) {
    host_with(fast_config())
}

pub fn host_with(config: SessionConfig) -> (InMemoryHyperV, Session) {
    let hv = InMemoryHyperV::new();
    let session = Session::open(config, hv.clone()).expect("valid config");
    (hv, session)
}

pub fn vm(hv: &InMemoryHyperV, session: &Session, name: &str, generation: Generation, state: VmState) -> VmHandle {
    let id = hv.add_vm(name, generation, state);
    session.get_vm(id.as_str()).expect("seeded VM is visible")
}

pub fn count_calls(hv: &InMemoryHyperV, method: &str) -> usize {
    hv.method_calls().iter().filter(|m| m.ends_with(method)).count()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
