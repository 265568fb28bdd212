//! List VMs on a host with their state.
//!
//! Run with: cargo run --example list_vms [-- <config.toml>]
//!
//! Without a config file the local host is used. Off Windows the example
//! runs against a simulated host.

use std::env;

use hyperv_jobs::{Result, Session, SessionConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match env::args().nth(1) {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::local(),
    };
    let session = open(config)?;

    let vms = session.list_vms()?;
    println!("{} VM(s) on {}", vms.len(), session.config().host_label());
    for vm in &vms {
        println!("  {:<40} {:<38} {}", vm.name(), vm.id(), vm.state()?);
    }

    session.close();
    Ok(())
}

#[cfg(windows)]
fn open(config: SessionConfig) -> Result<Session> {
    hyperv_jobs::connect(config)
}

#[cfg(not(windows))]
fn open(config: SessionConfig) -> Result<Session> {
    use hyperv_jobs::{Generation, InMemoryHyperV, VmState};

    let host = InMemoryHyperV::new();
    host.add_vm("web-01", Generation::Gen2, VmState::Running);
    host.add_vm("db-01", Generation::Gen1, VmState::Off);
    Session::open(config, host)
}
