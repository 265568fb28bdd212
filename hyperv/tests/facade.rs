//! Blocking and async entry points share one implementation.

mod common;

use std::time::{Duration, Instant};

use common::{count_calls, host, vm};
use hyperv_jobs::memory::JobScript;
use hyperv_jobs::{
    DiskSpec, FailureCode, Generation, LifecycleRequest, MemorySpec, PartialCompletion, StepOutcome, VmOperation,
    VmSpec, VmState,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn async_start_matches_blocking_start() {
    let (sync_hv, sync_session) = host();
    let (async_hv, async_session) = host();
    let sync_vm = vm(&sync_hv, &sync_session, "web-01", Generation::Gen2, VmState::Off);
    let async_vm = vm(&async_hv, &async_session, "web-01", Generation::Gen2, VmState::Off);
    let cancel = CancellationToken::new();

    let blocking = sync_vm.start();
    let cooperative = async_vm.start_async(&cancel).await;

    assert_eq!(blocking, cooperative);
    assert_eq!(async_hv.vm_state(async_vm.id()), Some(VmState::Running));
    assert_eq!(sync_hv.method_calls(), async_hv.method_calls());
}

#[tokio::test]
async fn async_failures_match_blocking_failures() {
    let (sync_hv, sync_session) = host();
    let (async_hv, async_session) = host();
    let sync_vm = vm(&sync_hv, &sync_session, "web-01", Generation::Gen2, VmState::Running);
    let async_vm = vm(&async_hv, &async_session, "web-01", Generation::Gen2, VmState::Running);
    for hv in [&sync_hv, &async_hv] {
        hv.script_next("RequestStateChange", JobScript::fails(32768, "Failed to save the virtual machine"));
    }
    let cancel = CancellationToken::new();

    assert_eq!(sync_vm.save(), async_vm.save_async(&cancel).await);
    assert_eq!(sync_vm.resume(), async_vm.resume_async(&cancel).await);
    assert_eq!(
        sync_vm.attach_disk(&DiskSpec::new(r"C:\vms\bad.txt")),
        async_vm.attach_disk_async(&DiskSpec::new(r"C:\vms\bad.txt"), &cancel).await
    );
}

#[tokio::test]
async fn async_sequence_and_define() {
    let (hv, session) = host();
    let cancel = CancellationToken::new();
    let spec = VmSpec::builder()
        .name("app-01")
        .memory_mb(1024)
        .processor_count(1)
        .build()
        .unwrap();

    let vm = session.define_vm_async(&spec, &cancel).await.unwrap();
    let request = LifecycleRequest::new()
        .step(VmOperation::SetMemory(MemorySpec::fixed(3072).unwrap()))
        .step(VmOperation::SetCpuCount(2))
        .step(VmOperation::Start)
        .step(VmOperation::Shutdown { force: false });
    let result = vm.execute_async(&request, &cancel).await;

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(hv.memory_mb(vm.id()), Some(3072));
    assert_eq!(hv.cpu_count(vm.id()), Some(2));
    assert_eq!(vm.state_async(&cancel).await.unwrap(), VmState::Off);
}

#[tokio::test]
async fn cancelling_a_wait_leaves_the_job_running() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.script_next("RequestStateChange", JobScript::stalls());
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = vm.start_async(&cancel).await;

    let failure = result.failure().expect("cancelled start fails");
    assert_eq!(failure.code, FailureCode::Cancelled);
    assert_eq!(failure.partial, PartialCompletion::Unknown);
    assert!(started.elapsed() < Duration::from_millis(300));
    let job = failure.pending_job.clone().expect("job is left running");
    assert_eq!(hv.job_state(&job), Some(4));

    let terminated = session.terminate_job_async(&job, &CancellationToken::new()).await;
    assert!(terminated.is_success());
    assert_eq!(hv.vm_state(vm.id()), Some(VmState::Off));
}

#[tokio::test]
async fn cancelled_token_stops_before_any_call() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = vm.start_async(&cancel).await;

    assert_eq!(result.code(), Some(FailureCode::Cancelled));
    assert!(hv.method_calls().is_empty());
    assert!(vm.state_async(&cancel).await.is_err());
}

#[tokio::test]
async fn cancelling_a_sequence_skips_later_steps() {
    let (hv, session) = host();
    let vm = vm(&hv, &session, "web-01", Generation::Gen2, VmState::Off);
    hv.script_next("RequestStateChange", JobScript::stalls());
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let request = LifecycleRequest::new()
        .step(VmOperation::Start)
        .step(VmOperation::SetCpuCount(2))
        .step(VmOperation::Pause);

    let failure = vm
        .execute_async(&request, &cancel)
        .await
        .failure()
        .cloned()
        .expect("cancelled sequence fails");

    assert_eq!(failure.code, FailureCode::Cancelled);
    assert_eq!(failure.failed_step, Some(0));
    assert_eq!(failure.steps[1].outcome, StepOutcome::NotRun);
    assert_eq!(failure.steps[2].outcome, StepOutcome::NotRun);
    assert_eq!(count_calls(&hv, "ModifyResourceSettings"), 0);
}

#[test]
fn session_is_shared_across_threads() {
    let (hv, session) = host();
    let vms: Vec<_> = (0..4)
        .map(|i| vm(&hv, &session, &format!("web-{:02}", i), Generation::Gen2, VmState::Off))
        .collect();

    std::thread::scope(|scope| {
        for vm in &vms {
            scope.spawn(move || assert!(vm.start().is_success()));
        }
    });

    for vm in &vms {
        assert_eq!(hv.vm_state(vm.id()), Some(VmState::Running));
    }
    assert_eq!(count_calls(&hv, "Msvm_ComputerSystem.RequestStateChange"), 4);
}
