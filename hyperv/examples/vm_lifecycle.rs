//! Define a VM, configure it and run it through a lifecycle sequence.
//!
//! Run with: cargo run --example vm_lifecycle -- <vm_name> [vhdx_path] [switch]
//!
//! Requires: Hyper-V Administrators membership on Windows. Off Windows the
//! example runs against a simulated host.

use std::env;

use hyperv_jobs::{
    DiskSpec, Generation, LifecycleRequest, NicSpec, OperationResult, Result, Session, SessionConfig, StepPolicy,
    StepReport, VmOperation, VmSpec,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }
    let name = &args[1];
    let disk = args.get(2);
    let switch = args.get(3);

    let session = open(SessionConfig::local())?;

    println!("Defining VM '{}'...", name);
    let spec = VmSpec::builder()
        .name(name)
        .generation(Generation::Gen2)
        .memory_gb(2)
        .processor_count(2)
        .notes("created by the vm_lifecycle example")
        .build()?;
    let vm = session.define_vm(&spec)?;
    println!("Defined {} ({})", vm.name(), vm.id());

    let mut request = LifecycleRequest::new();
    if let Some(path) = disk {
        request = request.step(VmOperation::AttachDisk(DiskSpec::new(path)));
    }
    let mut nic = NicSpec::new("Network Adapter");
    if let Some(switch) = switch {
        nic = nic.connected_to(switch);
    }
    request = request
        .step_with(VmOperation::AttachNic(nic), StepPolicy::BestEffort)
        .step_with(VmOperation::Start, StepPolicy::ContinueOnWarning)
        .step(VmOperation::Shutdown { force: false });

    match vm.execute(&request) {
        OperationResult::Success { warnings } => {
            println!("Lifecycle completed");
            for warning in warnings {
                println!("  warning: {}", warning);
            }
        }
        OperationResult::Failure(failure) => {
            println!("Lifecycle failed: {}", failure);
            println!("  partial completion: {:?}", failure.partial);
            failure.steps.iter().for_each(print_step);
            if let Some(job) = failure.pending_job {
                println!("  terminating job left running: {}", job);
                let _ = session.terminate_job(&job);
            }
        }
    }

    println!("Deleting VM '{}'...", name);
    match vm.delete() {
        OperationResult::Success { .. } => println!("Deleted"),
        OperationResult::Failure(failure) => println!("Delete failed: {}", failure),
    }

    session.close();
    Ok(())
}

fn print_step(step: &StepReport) {
    println!("  step {} {:<14} {:?}", step.index, step.operation, step.outcome);
}

fn print_usage() {
    println!("Usage: vm_lifecycle <vm_name> [vhdx_path] [switch]");
}

#[cfg(windows)]
fn open(config: SessionConfig) -> Result<Session> {
    hyperv_jobs::connect(config)
}

#[cfg(not(windows))]
fn open(config: SessionConfig) -> Result<Session> {
    let host = hyperv_jobs::InMemoryHyperV::new();
    host.add_switch("External");
    Session::open(config, host)
}
