//! Power-state and configuration operations against the in-memory host.

mod common;

use common::{count_calls, host, init_tracing, vm};
use hyperv_jobs::memory::JobScript;
use hyperv_jobs::{
    ControllerKind, DiskSpec, Error, FailureCode, Generation, MemorySpec, NicSpec, PartialCompletion, VmSpec,
    VmState,
};

#[test]
fn start_runs_job_and_waits_for_state() {
    init_tracing();
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);

    let result = vm.start();

    assert!(result.is_success(), "{:?}", result);
    assert!(result.warnings().is_empty());
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Running));
    assert_eq!(count_calls(&hv, "Msvm_ComputerSystem.RequestStateChange"), 1);
    assert!(hv.job_polls() >= 2);
}

#[test]
fn operations_already_in_target_state_make_no_calls() {
    let (hv, session) = host();
    let running = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Running);
    let off = vm(&hv, &session, "web-02", Generation::Gen2, VmState::Off);
    let paused = vm(&hv, &session, "web-03", Generation::Gen2, VmState::Paused);
    let saved = vm(&hv, &session, "web-04", Generation::Gen2, VmState::Saved);

    assert!(running.start().is_success());
    assert!(running.resume().is_success());
    assert!(off.stop().is_success());
    assert!(off.shutdown(false).is_success());
    assert!(paused.pause().is_success());
    assert!(saved.save().is_success());

    assert!(hv.method_calls().is_empty(), "{:?}", hv.method_calls());
}

#[test]
fn disallowed_transitions_fail_without_calls() {
    let (hv, session) = host();
    let off = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);

    let result = off.pause();
    let failure = result.failure().expect("pause of an off VM fails");
    assert_eq!(failure.code, FailureCode::InvalidState);
    assert_eq!(failure.partial, PartialCompletion::No);
    assert!(failure.message.contains("web-01"));

    assert_eq!(off.resume().code(), Some(FailureCode::InvalidState));
    assert_eq!(off.save().code(), Some(FailureCode::InvalidState));
    assert!(hv.method_calls().is_empty());
}

#[test]
fn provider_rejection_keeps_code_and_text() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.fail_next("RequestStateChange", 32774);

    let result = vm.start();

    let failure = result.failure().expect("rejected start fails");
    assert_eq!(failure.code, FailureCode::ResourceInUse);
    assert_eq!(failure.provider_code, Some(32774));
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
}

#[test]
fn invalid_state_from_provider_is_reported_when_target_not_reached() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.fail_next("RequestStateChange", 32775);

    let failure = vm.start().failure().cloned().expect("start fails");
    assert_eq!(failure.code, FailureCode::InvalidState);
    assert_eq!(failure.provider_code, Some(32775));
}

#[test]
fn failed_job_maps_error_code() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.script_next(
        "RequestStateChange",
        JobScript::fails(0x8007_0005, "'web-01' failed to start. Access denied."),
    );

    let failure = vm.start().failure().cloned().expect("start fails");

    assert_eq!(failure.code, FailureCode::AccessDenied);
    assert_eq!(failure.provider_code, Some(0x8007_0005));
    assert_eq!(failure.message, "'web-01' failed to start. Access denied.");
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
}

#[test]
fn completed_job_with_error_code_is_a_warning() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.script_next("RequestStateChange", JobScript::warns(32768, "Integration services are out of date"));

    let result = vm.start();

    assert!(result.is_success());
    assert_eq!(result.warnings().len(), 1);
    assert_eq!(result.warnings()[0].provider_code, Some(32768));
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Running));
}

#[test]
fn waits_for_transition_before_acting() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.transition(vm.id(), VmState::Starting, VmState::Running, 3);

    assert!(vm.start().is_success());
    assert!(hv.method_calls().is_empty());
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Running));
}

#[test]
fn pause_resume_save_cycle() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen1, VmState::Running);

    assert!(vm.pause().is_success());
    assert_eq!(vm.state().unwrap(), VmState::Paused);
    assert!(vm.resume().is_success());
    assert_eq!(vm.state().unwrap(), VmState::Running);
    assert!(vm.save().is_success());
    assert_eq!(vm.state().unwrap(), VmState::Saved);
    assert!(vm.start().is_success());
    assert_eq!(vm.state().unwrap(), VmState::Running);
    assert!(vm.stop().is_success());
    assert_eq!(vm.state().unwrap(), VmState::Off);
}

#[test]
fn guest_shutdown_uses_integration_service() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Running);

    let result = vm.shutdown(false);

    assert!(result.is_success());
    assert!(result.warnings().is_empty());
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
    assert_eq!(count_calls(&hv, "Msvm_ShutdownComponent.InitiateShutdown"), 1);
    assert_eq!(count_calls(&hv, "Msvm_ComputerSystem.RequestStateChange"), 0);
}

#[test]
fn shutdown_falls_back_to_power_off_when_guest_ignores_it() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Running);
    hv.guest_ignores_shutdown(vm.id());

    let result = vm.shutdown(false);

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.warnings().len(), 1);
    assert!(result.warnings()[0].message.contains("guest shutdown failed"));
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
    assert_eq!(count_calls(&hv, "Msvm_ComputerSystem.RequestStateChange"), 1);
}

#[test]
fn shutdown_without_integration_service_powers_off() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Running);
    hv.remove_shutdown_component(vm.id());

    let result = vm.shutdown(true);

    assert!(result.is_success());
    assert!(result.warnings()[0].message.contains("not available"));
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
}

#[test]
fn shutdown_of_paused_vm_turns_it_off() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Paused);

    let result = vm.shutdown(false);

    assert!(result.is_success());
    assert!(result.warnings().is_empty());
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
    assert_eq!(count_calls(&hv, "InitiateShutdown"), 0);
}

#[test]
fn delete_requires_off_and_is_idempotent() {
    let (hv, session) = host();
    let running = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Running);
    let off = vm(&hv, &session, "web-02", Generation::Gen2, VmState::Off);

    assert_eq!(running.delete().code(), Some(FailureCode::InvalidState));
    assert!(hv.vm_exists(running.id()));

    assert!(off.delete().is_success());
    assert!(!hv.vm_exists(off.id()));
    assert!(off.delete().is_success());
    assert_eq!(count_calls(&hv, "DestroySystem"), 1);

    assert!(matches!(off.state(), Err(Error::VmNotFound(_))));
    assert_eq!(off.start().code(), Some(FailureCode::NotFound));
}

#[test]
fn set_memory_and_cpu_count() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "db-01", Generation::Gen2, VmState::Off);

    assert!(vm.set_memory(MemorySpec::fixed(4096).unwrap()).is_success());
    assert!(vm.set_cpu_count(4).is_success());
    assert_eq!(hv.memory_mb(vm.id()), Some(4096));
    assert_eq!(hv.dynamic_memory(vm.id()), None);
    assert_eq!(hv.cpu_count(vm.id()), Some(4));

    assert!(vm.set_memory(MemorySpec::dynamic(2048, 512, 8192).unwrap()).is_success());
    assert_eq!(hv.memory_mb(vm.id()), Some(2048));
    assert_eq!(hv.dynamic_memory(vm.id()), Some((512, 8192)));

    let modifications = count_calls(&hv, "ModifyResourceSettings");
    assert!(vm.set_memory(MemorySpec::dynamic(2048, 512, 8192).unwrap()).is_success());
    assert!(vm.set_cpu_count(4).is_success());
    assert_eq!(count_calls(&hv, "ModifyResourceSettings"), modifications);
}

#[test]
fn invalid_cpu_count_is_rejected_before_the_provider() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "db-01", Generation::Gen2, VmState::Off);

    let failure = vm.set_cpu_count(0).failure().cloned().expect("zero processors fails");

    assert_eq!(failure.code, FailureCode::InvalidRequest);
    assert_eq!(failure.partial, PartialCompletion::No);
    assert!(hv.method_calls().is_empty());
}

#[test]
fn attach_disk_fills_free_locations() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "db-01", Generation::Gen1, VmState::Off);

    assert!(vm.attach_disk(&DiskSpec::new(r"C:\vms\os.vhdx")).is_success());
    assert!(vm.attach_disk(&DiskSpec::new(r"C:\vms\data.vhdx")).is_success());
    assert_eq!(hv.drive_locations(vm.id(), ControllerKind::Ide, 0), vec![0, 1]);
    assert_eq!(
        hv.attached_disks(vm.id()),
        vec![r"C:\vms\os.vhdx".to_string(), r"C:\vms\data.vhdx".to_string()]
    );

    let full = vm.attach_disk(&DiskSpec::new(r"C:\vms\extra.vhdx"));
    assert_eq!(full.code(), Some(FailureCode::ResourceInUse));

    let second = DiskSpec::new(r"C:\vms\extra.vhdx").on_controller(ControllerKind::Ide, 1);
    assert!(vm.attach_disk(&second).is_success());
    assert_eq!(hv.drive_locations(vm.id(), ControllerKind::Ide, 1), vec![0]);
}

#[test]
fn attach_disk_is_idempotent_by_path() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "db-01", Generation::Gen2, VmState::Off);

    assert!(vm.attach_disk(&DiskSpec::new(r"C:\vms\os.vhdx")).is_success());
    let calls = hv.method_calls().len();
    assert!(vm.attach_disk(&DiskSpec::new(r"c:\VMS\os.vhdx")).is_success());
    assert_eq!(hv.method_calls().len(), calls);
    assert_eq!(hv.attached_disks(vm.id()).len(), 1);
}

#[test]
fn attach_disk_rejects_busy_location_and_ide_on_gen2() {
    let (hv, session) = host();
    let gen2 = vm(&hv, &session, "db-01", Generation::Gen2, VmState::Off);

    assert!(gen2.attach_disk(&DiskSpec::new(r"C:\vms\os.vhdx").at_location(0)).is_success());
    let busy = gen2.attach_disk(&DiskSpec::new(r"C:\vms\data.vhdx").at_location(0));
    assert_eq!(busy.code(), Some(FailureCode::ResourceInUse));

    let ide = DiskSpec::new(r"C:\vms\data.vhdx").on_controller(ControllerKind::Ide, 0);
    assert_eq!(gen2.attach_disk(&ide).code(), Some(FailureCode::InvalidRequest));

    let not_a_disk = gen2.attach_disk(&DiskSpec::new(r"C:\vms\data.iso"));
    assert_eq!(not_a_disk.code(), Some(FailureCode::InvalidRequest));
}

#[test]
fn missing_disk_file_leaves_drive_behind() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "db-01", Generation::Gen2, VmState::Off);
    hv.missing_file(r"C:\vms\missing.vhdx");

    let failure = vm
        .attach_disk(&DiskSpec::new(r"C:\vms\missing.vhdx"))
        .failure()
        .cloned()
        .expect("attach fails");

    assert_eq!(failure.code, FailureCode::NotFound);
    assert_eq!(failure.provider_code, Some(0x8007_0002));
    assert_eq!(failure.partial, PartialCompletion::Yes);
    assert!(failure.message.starts_with("disk drive added at location 0"));
    assert_eq!(hv.drive_locations(vm.id(), ControllerKind::Scsi, 0), vec![0]);
    assert!(hv.attached_disks(vm.id()).is_empty());
}

#[test]
fn attach_nic_connects_to_switch() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.add_switch("External");

    let nic = NicSpec::new("Network Adapter")
        .with_static_mac("00:15:5D:01:02:03")
        .connected_to("External");
    assert!(vm.attach_nic(&nic).is_success());
    assert!(vm.attach_nic(&NicSpec::new("Isolated")).is_success());

    assert_eq!(hv.nics(vm.id()).len(), 2);
    assert_eq!(hv.connected_switches(vm.id()), vec!["External".to_string()]);
}

#[test]
fn attach_nic_to_unknown_switch_changes_nothing() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);

    let failure = vm
        .attach_nic(&NicSpec::new("nic0").connected_to("Missing"))
        .failure()
        .cloned()
        .expect("attach fails");

    assert_eq!(failure.code, FailureCode::NotFound);
    assert_eq!(failure.partial, PartialCompletion::No);
    assert!(hv.nics(vm.id()).is_empty());
    assert!(hv.method_calls().is_empty());
}

#[test]
fn failed_switch_connection_is_partial() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.add_switch("External");
    hv.script_next("AddResourceSettings", JobScript::completes());
    hv.script_next("AddResourceSettings", JobScript::fails(32768, "Failed to connect Ethernet switch port"));

    let failure = vm
        .attach_nic(&NicSpec::new("nic0").connected_to("External"))
        .failure()
        .cloned()
        .expect("attach fails");

    assert_eq!(failure.code, FailureCode::Unknown(32768));
    assert_eq!(failure.partial, PartialCompletion::Yes);
    assert!(failure.message.contains("Failed to connect Ethernet switch port"));
    assert_eq!(hv.nics(vm.id()), vec!["nic0".to_string()]);
    assert!(hv.connected_switches(vm.id()).is_empty());
}

#[test]
fn define_vm_applies_memory_and_processors() {
    let (hv, session) = host();
    let spec = VmSpec::builder()
        .name("db-01")
        .generation(Generation::Gen1)
        .memory_mb(2048)
        .processor_count(2)
        .notes("database")
        .build()
        .unwrap();

    let vm = session.define_vm(&spec).unwrap();

    assert_eq!(vm.name(), "db-01");
    assert_eq!(vm.state().unwrap(), VmState::Off);
    assert_eq!(hv.memory_mb(vm.id()), Some(2048));
    assert_eq!(hv.cpu_count(vm.id()), Some(2));
    assert_eq!(session.find_vms("db-01").unwrap().len(), 1);
}

#[test]
fn define_attach_start_scenario() {
    let (hv, session) = host();
    let spec = VmSpec::builder()
        .name("app-01")
        .memory_mb(2048)
        .processor_count(2)
        .build()
        .unwrap();

    let vm = session.define_vm(&spec).unwrap();
    let attached = vm.attach_disk(&DiskSpec::new(r"C:\vms\app-01.vhdx"));
    let started = vm.start();

    assert!(attached.is_success(), "{:?}", attached);
    assert!(started.is_success(), "{:?}", started);
    assert_eq!(vm.state().unwrap(), VmState::Running);
    assert_eq!(hv.attached_disks(vm.id()), vec![r"C:\vms\app-01.vhdx".to_string()]);
}

#[test]
fn stop_twice_succeeds_both_times() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Running);

    assert!(vm.stop().is_success());
    assert!(vm.stop().is_success());
    assert_eq!(count_calls(&hv, "Msvm_ComputerSystem.RequestStateChange"), 1);
}

#[test]
fn define_vm_reports_partial_when_configuration_fails() {
    let (hv, session) = host();
    hv.script_next("ModifyResourceSettings", JobScript::fails(32768, "Not enough memory in the system"));
    let spec = VmSpec::builder()
        .name("db-01")
        .memory_mb(2048)
        .processor_count(2)
        .build()
        .unwrap();

    let failure = match session.define_vm(&spec) {
        Err(Error::Operation(failure)) => failure,
        other => panic!("expected an operation failure, got {:?}", other),
    };
    assert_eq!(failure.partial, PartialCompletion::Yes);
    assert!(failure.message.contains("was defined but configuring it failed"));
    assert!(failure.message.contains("Not enough memory"));
    assert_eq!(hv.vm_ids_named("db-01").len(), 1);
}

#[test]
fn lookups_validate_ids_and_allow_duplicate_names() {
    let (hv, session) = host();
    hv.add_vm("dup", Generation::Gen2, VmState::Off);
    hv.add_vm("dup", Generation::Gen1, VmState::Running);

    assert_eq!(session.list_vms().unwrap().len(), 2);
    assert_eq!(session.find_vms("dup").unwrap().len(), 2);
    assert!(session.find_vms("other").unwrap().is_empty());

    assert!(matches!(session.get_vm("not-a-guid"), Err(Error::InvalidVmId(_))));
    assert!(matches!(
        session.get_vm("5c8f5e1a-0b3d-4f7e-9a61-2d7f3b1c9e40"),
        Err(Error::VmNotFound(_))
    ));
}

#[test]
fn names_with_quotes_and_backslashes_are_found() {
    let (hv, session) = host();
    hv.add_vm("O'Brien's VM", Generation::Gen2, VmState::Off);
    hv.add_vm(r"lab\web-01", Generation::Gen2, VmState::Off);
    hv.add_switch(r"Corp\External 'A'");
    let vm = session.find_vms(r"lab\web-01").unwrap().remove(0);

    assert_eq!(session.find_vms("O'Brien's VM").unwrap().len(), 1);
    assert!(session.find_vms("O").unwrap().is_empty());
    assert_eq!(vm.name(), r"lab\web-01");
    assert!(vm.attach_nic(&NicSpec::new("nic0").connected_to(r"Corp\External 'A'")).is_success());
    assert_eq!(hv.connected_switches(vm.id()), vec![r"Corp\External 'A'".to_string()]);
}
