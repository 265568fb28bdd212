//! Integration tests against a real Hyper-V host.
//!
//! These tests require:
//! - Windows with Hyper-V enabled
//! - Membership in Hyper-V Administrators
//! - The `integration` feature enabled
//!
//! Run with: cargo test -p hyperv-jobs --features integration --test integration_tests -- --test-threads=1

#![cfg(all(windows, feature = "integration"))]

use hyperv_jobs::{
    connect, ComPort, FailureCode, Generation, LifecycleRequest, MemorySpec, Session, SessionConfig, StepPolicy,
    VmOperation, VmSpec, VmState,
};

const TEST_VM_PREFIX: &str = "HyperVJobs_IntegTest_";

fn test_vm_name(suffix: &str) -> String {
    format!("{}{}", TEST_VM_PREFIX, suffix)
}

fn session() -> Session {
    connect(SessionConfig::local()).expect("Failed to connect")
}

fn cleanup_test_vm(session: &Session, name: &str) {
    for vm in session.find_vms(name).unwrap_or_default() {
        let _ = vm.stop();
        let _ = vm.delete();
    }
}

#[test]
fn test_connect_and_list() {
    let session = session();
    let result = session.list_vms();
    assert!(result.is_ok(), "Failed to list VMs: {:?}", result.err());
    session.close();
}

#[test]
fn test_define_and_delete_vm() {
    let session = session();
    let name = test_vm_name("DefineDelete");
    cleanup_test_vm(&session, &name);

    let spec = VmSpec::builder()
        .name(&name)
        .generation(Generation::Gen2)
        .memory_mb(512)
        .processor_count(1)
        .build()
        .expect("Failed to build VM spec");
    let vm = session.define_vm(&spec).expect("Failed to define VM");
    assert_eq!(vm.name(), name);
    assert_eq!(vm.state().unwrap(), VmState::Off);

    let found = session.get_vm(vm.id().as_str());
    assert!(found.is_ok(), "Failed to find defined VM");

    assert!(vm.delete().is_success());
    assert!(vm.delete().is_success(), "deleting twice should succeed");
    assert!(session.find_vms(&name).unwrap().is_empty());
}

#[test]
fn test_vm_power_cycle() {
    let session = session();
    let name = test_vm_name("PowerCycle");
    cleanup_test_vm(&session, &name);

    let spec = VmSpec::builder()
        .name(&name)
        .memory_mb(512)
        .processor_count(1)
        .build()
        .unwrap();
    let vm = session.define_vm(&spec).expect("Failed to define VM");

    let request = LifecycleRequest::new()
        .step(VmOperation::SetMemory(MemorySpec::fixed(1024).unwrap()))
        .step_with(VmOperation::Start, StepPolicy::ContinueOnWarning)
        .step(VmOperation::Pause)
        .step(VmOperation::Resume)
        .step(VmOperation::Stop);
    let result = vm.execute(&request);
    assert!(result.is_success(), "Power cycle failed: {:?}", result);
    assert_eq!(vm.state().unwrap(), VmState::Off);

    assert_eq!(vm.pause().code(), Some(FailureCode::InvalidState));

    cleanup_test_vm(&session, &name);
}

#[test]
fn test_list_switches_and_serial_ports() {
    let session = session();
    let switches = session.switches().expect("Failed to list switches");
    for switch in &switches {
        let found = session.switch_by_id(switch.id()).expect("listed switch is found by id");
        assert_eq!(&found, switch);
    }

    let name = test_vm_name("SerialPorts");
    cleanup_test_vm(&session, &name);
    let spec = VmSpec::builder().name(&name).memory_mb(512).processor_count(1).build().unwrap();
    let vm = session.define_vm(&spec).expect("Failed to define VM");

    let pipe = format!(r"\\.\pipe\{}", name);
    assert!(vm.connect_com_port(ComPort::Com1, Some(&pipe)).is_success());
    let ports = vm.serial_ports().unwrap();
    assert_eq!(ports[0].pipe.as_deref(), Some(pipe.as_str()));
    assert!(vm.network_adapters().unwrap().is_empty());

    cleanup_test_vm(&session, &name);
}
