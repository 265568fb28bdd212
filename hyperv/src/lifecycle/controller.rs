//! Drives lifecycle operations against the provider.
//!
//! One async implementation serves both facades: blocking callers run it
//! with [`Blocking`](crate::suspend::Blocking) under `block_on`, async
//! callers with [`Cooperative`](crate::suspend::Cooperative).

use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LifecycleRequest, Step, StepPolicy, VmOperation};
use crate::error::{Error, Result};
use crate::msvm::{self, subtype};
use crate::result::{
    Failure, FailureCode, OperationResult, PartialCompletion, PendingJob, StepOutcome, StepReport,
    Warning,
};
use crate::session::Session;
use crate::suspend::Suspend;
use crate::vm::{
    validate_pipe, CloneMode, ComPort, ControllerKind, DiskClone, DiskSpec, Generation, GuestIpSpec,
    MemorySpec, NicSpec, ProcessorCount, RequestedState, VmHandle, VmId, VmSpec, VmState,
};
use crate::wmi::job::{classify, JobState, ProviderJobState};
use crate::wmi::{MethodCall, RawCallResult, WmiObject};

type Outcome<T> = core::result::Result<T, Failure>;

pub(crate) struct Controller<'a, S> {
    session: &'a Session,
    suspend: S,
}

impl<'a, S: Suspend> Controller<'a, S> {
    pub(crate) fn new(session: &'a Session, suspend: S) -> Self {
        Self { session, suspend }
    }

    pub(crate) async fn perform(&mut self, vm: &VmHandle, operation: &VmOperation) -> OperationResult {
        self.run(vm, operation).await.into()
    }

    /// Run the steps of `request` in order under their policies.
    pub(crate) async fn execute(&mut self, vm: &VmHandle, request: &LifecycleRequest) -> OperationResult {
        let steps = request.steps();
        let mut reports = Vec::with_capacity(steps.len());
        let mut warnings = Vec::new();
        let mut completed = 0;
        let mut first_failure: Option<(usize, Failure)> = None;

        info!(vm = %vm.id(), name = vm.name(), steps = steps.len(), "executing lifecycle request");

        for (index, step) in steps.iter().enumerate() {
            let label = step.operation.label();
            match self.run(vm, &step.operation).await {
                Ok(step_warnings)
                    if step.policy == StepPolicy::AbortOnFailure && !step_warnings.is_empty() =>
                {
                    let failure = warning_failure(label, &step_warnings[0]);
                    reports.push(report(index, step, StepOutcome::Completed { warnings: step_warnings }));
                    return OperationResult::Failure(abort(vm, failure, index, completed, reports, steps));
                }
                Ok(step_warnings) => {
                    debug!(vm = %vm.id(), step = index, operation = label, "step completed");
                    completed += 1;
                    warnings.extend(step_warnings.iter().cloned());
                    reports.push(report(index, step, StepOutcome::Completed { warnings: step_warnings }));
                }
                Err(failure) => {
                    reports.push(report(
                        index,
                        step,
                        StepOutcome::Failed {
                            code: failure.code,
                            message: failure.message.clone(),
                        },
                    ));
                    if step.policy == StepPolicy::BestEffort && !failure.code.stops_sequence() {
                        warn!(
                            vm = %vm.id(),
                            step = index,
                            operation = label,
                            error = %failure,
                            "best-effort step failed, continuing"
                        );
                        first_failure.get_or_insert((index, failure));
                        continue;
                    }
                    return OperationResult::Failure(abort(vm, failure, index, completed, reports, steps));
                }
            }
        }

        match first_failure {
            Some((index, failure)) => {
                OperationResult::Failure(summarize(failure, index, completed, reports))
            }
            None => OperationResult::success_with(warnings),
        }
    }

    /// Define a VM, then size its memory and processors.
    pub(crate) async fn define(&mut self, spec: &VmSpec) -> Result<VmHandle> {
        spec.validate()?;
        let service = self.management_service().map_err(Error::Operation)?;

        let mut settings = WmiObject::new(msvm::SYSTEM_SETTINGS)
            .with("ElementName", spec.name.as_str())
            .with("VirtualSystemSubType", spec.generation.to_subtype());
        if let Some(ref notes) = spec.notes {
            settings.set("Notes", vec![notes.clone()]);
        }

        info!(name = %spec.name, generation = %spec.generation, "defining VM");
        let call = MethodCall::new(service, msvm::MANAGEMENT_SERVICE, "DefineSystem")
            .arg("SystemSettings", settings);
        let (raw, _) = self.call(call, "DefineSystem").await.map_err(Error::Operation)?;

        let vm_path = raw
            .out()
            .get_str("ResultingSystem")
            .ok_or_else(|| Error::missing_property(raw.out().class(), "ResultingSystem"))?;
        let vm = VmHandle::from_wmi(self.session.clone(), &self.session.get_object(vm_path)?)?;
        info!(vm = %vm.id(), name = vm.name(), "VM defined");

        let configure = LifecycleRequest::new()
            .step(VmOperation::SetMemory(spec.memory_spec()))
            .step(VmOperation::SetCpuCount(spec.processor_count.get()));
        match self.execute(&vm, &configure).await {
            OperationResult::Success { .. } => Ok(vm),
            OperationResult::Failure(failure) => {
                warn!(vm = %vm.id(), error = %failure, "VM defined but not fully configured");
                Err(Error::Operation(
                    failure
                        .with_partial(PartialCompletion::Yes)
                        .context(format!("VM '{}' ({}) was defined but configuring it failed", spec.name, vm.id())),
                ))
            }
        }
    }

    pub(crate) async fn terminate_job(&mut self, job: &PendingJob) -> OperationResult {
        self.terminate(job).await.into()
    }

    pub(crate) async fn clone_disk(&mut self, clone: &DiskClone) -> OperationResult {
        self.copy_disk(clone).await.into()
    }

    async fn copy_disk(&mut self, clone: &DiskClone) -> Outcome<Vec<Warning>> {
        clone.validate()?;
        let format = clone.format()?;
        let source = clone.source.trim();
        let destination = clone.destination.trim();
        let service = self
            .session
            .query_first(msvm::image_management_service())?
            .ok_or_else(|| Failure::not_found("Hyper-V image management service not found"))?;
        let service = service.require_path()?;

        let mut settings = WmiObject::new(msvm::VHD_SETTINGS)
            .with("Path", destination)
            .with("Format", format.value())
            .with("BlockSize", 0u32)
            .with("LogicalSectorSize", 0u32);
        let (call, method) = match clone.mode {
            CloneMode::Differencing => {
                settings
                    .set("Type", msvm::VHD_DIFFERENCING)
                    .set("ParentPath", source);
                let call = MethodCall::new(service, msvm::IMAGE_MANAGEMENT_SERVICE, "CreateVirtualHardDisk")
                    .arg("VirtualDiskSettingData", settings);
                (call, "CreateVirtualHardDisk")
            }
            CloneMode::Full => {
                settings.set("Type", msvm::VHD_DYNAMIC);
                let call = MethodCall::new(service, msvm::IMAGE_MANAGEMENT_SERVICE, "ConvertVirtualHardDisk")
                    .arg("SourcePath", source)
                    .arg("VirtualDiskSettingData", settings);
                (call, "ConvertVirtualHardDisk")
            }
        };

        info!(source, destination, mode = ?clone.mode, "cloning virtual hard disk");
        let (_, warnings) = self.call(call, method).await?;
        info!(destination, "virtual hard disk cloned");
        Ok(warnings)
    }

    async fn terminate(&mut self, job: &PendingJob) -> Outcome<Vec<Warning>> {
        if let Some(state) = self.finished_job_state(job)? {
            debug!(job = %job, state = %state, "job already finished");
            return Ok(vec![already_finished(&state)]);
        }

        info!(job = %job, "terminating job");
        let call = MethodCall::new(job.path(), msvm::CONCRETE_JOB, "RequestStateChange")
            .arg("RequestedState", msvm::JOB_TERMINATE);
        match self.call(call, "TerminateJob").await {
            Ok((_, warnings)) => Ok(warnings),
            Err(failure) if failure.code == FailureCode::InvalidState => {
                // Finished between the check and the request.
                match self.finished_job_state(job)? {
                    Some(state) => Ok(vec![already_finished(&state)]),
                    None => Err(failure),
                }
            }
            Err(failure) => Err(failure),
        }
    }

    /// Terminal state of the job, if it has one. The host deletes finished
    /// jobs after `TimeBeforeRemoval`, so a missing job counts as finished.
    fn finished_job_state(&self, job: &PendingJob) -> Outcome<Option<String>> {
        let object = match self.session.get_object(job.path()) {
            Ok(object) => object,
            Err(Error::Transport(e)) if e.is_not_found() => return Ok(Some("removed by the host".to_string())),
            Err(e) => return Err(e.into()),
        };
        let state = object
            .get_u16("JobState")
            .and_then(ProviderJobState::from_raw)
            .map(|raw| JobState::from_provider(raw, object.get_u32("ErrorCode").unwrap_or(0), 0));
        Ok(state.filter(JobState::is_terminal).map(|state| state.to_string()))
    }

    async fn run(&mut self, vm: &VmHandle, operation: &VmOperation) -> Outcome<Vec<Warning>> {
        if self.suspend.interrupted() {
            return Err(Failure::cancelled(format!("{} cancelled before it started", operation.label())));
        }

        match operation {
            VmOperation::Start => self.start(vm).await,
            VmOperation::Stop => self.stop(vm).await,
            VmOperation::Shutdown { force } => self.shutdown(vm, *force).await,
            VmOperation::Pause => self.pause(vm).await,
            VmOperation::Resume => self.resume(vm).await,
            VmOperation::Save => self.save(vm).await,
            VmOperation::Delete => self.delete(vm).await,
            VmOperation::AttachDisk(spec) => self.attach_disk(vm, spec).await,
            VmOperation::AttachNic(spec) => self.attach_nic(vm, spec).await,
            VmOperation::SetMemory(spec) => self.set_memory(vm, spec).await,
            VmOperation::SetCpuCount(count) => self.set_cpu_count(vm, *count).await,
            VmOperation::SetGuestIp(spec) => self.set_guest_ip(vm, spec).await,
            VmOperation::ConnectComPort { port, pipe } => {
                self.connect_com_port(vm, *port, pipe.as_deref()).await
            }
        }
    }

    // ========== Power State ==========

    async fn start(&mut self, vm: &VmHandle) -> Outcome<Vec<Warning>> {
        match self.settled(vm).await? {
            VmState::Running => Ok(already(vm, "start", VmState::Running)),
            state if state.can_start() => self.change_state(vm, RequestedState::Running, "start").await,
            state => Err(invalid(vm, "start", state)),
        }
    }

    async fn stop(&mut self, vm: &VmHandle) -> Outcome<Vec<Warning>> {
        match self.settled(vm).await? {
            VmState::Off => Ok(already(vm, "stop", VmState::Off)),
            state if state.can_stop() => self.change_state(vm, RequestedState::Off, "stop").await,
            state => Err(invalid(vm, "stop", state)),
        }
    }

    async fn pause(&mut self, vm: &VmHandle) -> Outcome<Vec<Warning>> {
        match self.settled(vm).await? {
            VmState::Paused => Ok(already(vm, "pause", VmState::Paused)),
            state if state.can_pause() => self.change_state(vm, RequestedState::Paused, "pause").await,
            state => Err(invalid(vm, "pause", state)),
        }
    }

    async fn resume(&mut self, vm: &VmHandle) -> Outcome<Vec<Warning>> {
        match self.settled(vm).await? {
            VmState::Running => Ok(already(vm, "resume", VmState::Running)),
            VmState::Paused => self.change_state(vm, RequestedState::Running, "resume").await,
            state => Err(invalid(vm, "resume", state)),
        }
    }

    async fn save(&mut self, vm: &VmHandle) -> Outcome<Vec<Warning>> {
        match self.settled(vm).await? {
            VmState::Saved => Ok(already(vm, "save", VmState::Saved)),
            state if state.can_save() => self.change_state(vm, RequestedState::Saved, "save").await,
            state => Err(invalid(vm, "save", state)),
        }
    }

    async fn shutdown(&mut self, vm: &VmHandle, force: bool) -> Outcome<Vec<Warning>> {
        match self.settled(vm).await? {
            VmState::Off => return Ok(already(vm, "shut down", VmState::Off)),
            VmState::Running => {}
            state if state.can_stop() => {
                debug!(vm = %vm.id(), state = %state, "guest is not running, turning VM off");
                return self.change_state(vm, RequestedState::Off, "shutdown").await;
            }
            state => return Err(invalid(vm, "shut down", state)),
        }

        match self.guest_shutdown(vm, force).await {
            Ok(warnings) => Ok(warnings),
            Err(failure) if failure.code.stops_sequence() => Err(failure),
            Err(failure) => {
                warn!(vm = %vm.id(), error = %failure, "guest shutdown failed, turning VM off");
                let mut warnings = self.change_state(vm, RequestedState::Off, "shutdown").await?;
                warnings.insert(
                    0,
                    Warning::new(format!("guest shutdown failed ({}); the VM was turned off", failure)),
                );
                Ok(warnings)
            }
        }
    }

    /// Ask the guest to shut down through the shutdown integration service.
    async fn guest_shutdown(&mut self, vm: &VmHandle, force: bool) -> Outcome<Vec<Warning>> {
        let component = self
            .session
            .query_first(msvm::shutdown_component(vm.id()))?
            .ok_or_else(|| Failure::not_found("shutdown integration service is not available"))?;
        if !msvm::shutdown_available(component.get("OperationalStatus").and_then(|v| v.as_u16_array())) {
            return Err(Failure::invalid_state("shutdown integration service is not responding"));
        }

        info!(vm = %vm.id(), name = vm.name(), force, "requesting guest shutdown");
        let call = MethodCall::new(component.require_path()?, msvm::SHUTDOWN_COMPONENT, "InitiateShutdown")
            .arg("Force", force)
            .arg("Reason", "Shutdown requested by hyperv-jobs");
        let (_, warnings) = self.call(call, "InitiateShutdown").await?;
        self.await_state(vm, VmState::Off).await?;
        Ok(warnings)
    }

    async fn change_state(
        &mut self,
        vm: &VmHandle,
        requested: RequestedState,
        operation: &str,
    ) -> Outcome<Vec<Warning>> {
        info!(vm = %vm.id(), name = vm.name(), operation, "requesting state change");
        let target = requested.settled_state();
        let call = MethodCall::new(vm.path(), msvm::COMPUTER_SYSTEM, "RequestStateChange")
            .arg("RequestedState", requested.value());

        let warnings = match self.call(call, operation).await {
            Ok((_, warnings)) => warnings,
            Err(failure) if failure.code == FailureCode::InvalidState => {
                // Another client may have won the race to the same state.
                if read_state(self.session, vm.id())? == Some(target) {
                    debug!(vm = %vm.id(), state = %target, "state reached by another request");
                    return Ok(Vec::new());
                }
                return Err(failure);
            }
            Err(failure) => return Err(failure),
        };

        self.await_state(vm, target).await?;
        info!(vm = %vm.id(), state = %target, "state change complete");
        Ok(warnings)
    }

    /// Current state after waiting out any transition. `None` if the VM is gone.
    async fn settled_state(&mut self, vm: &VmHandle) -> Outcome<Option<VmState>> {
        let state = match read_state(self.session, vm.id())? {
            Some(state) if state.is_transitional() => state,
            other => return Ok(other),
        };

        debug!(vm = %vm.id(), state = %state, "waiting for transition to settle");
        let id = vm.id().clone();
        self.wait_until("the VM state to settle", |session| {
            Ok(match read_state(session, &id)? {
                Some(state) if state.is_transitional() => None,
                other => Some(other),
            })
        })
        .await
    }

    async fn settled(&mut self, vm: &VmHandle) -> Outcome<VmState> {
        self.settled_state(vm).await?.ok_or_else(|| gone(vm))
    }

    /// Wait until the VM reports `target`. Provider jobs for state changes
    /// often finish before `EnabledState` catches up.
    async fn await_state(&mut self, vm: &VmHandle, target: VmState) -> Outcome<()> {
        let id = vm.id().clone();
        let what = format!("VM to reach {}", target);
        self.wait_until(&what, |session| match read_state(session, &id)? {
            Some(state) if state == target => Ok(Some(())),
            Some(_) => Ok(None),
            None => Err(Failure::not_found(format!("VM {} disappeared while waiting", id))),
        })
        .await
    }

    /// Poll `check` on the job cadence until it yields a value, bounded by
    /// the job timeout.
    async fn wait_until<T, P>(&mut self, what: &str, mut check: P) -> Outcome<T>
    where
        P: FnMut(&Session) -> Outcome<Option<T>>,
    {
        let session = self.session;
        let tracker = session.tracker();
        let deadline = Instant::now() + tracker.timeout();
        let mut interval = tracker.policy().initial_interval;

        loop {
            if let Some(value) = check(session)? {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Failure::new(
                    FailureCode::Timeout,
                    format!("timed out after {:?} waiting for {}", tracker.timeout(), what),
                )
                .with_partial(PartialCompletion::Unknown));
            }
            let delay = interval.min(deadline - now);
            interval = tracker.policy().next_interval(interval);
            if self.suspend.pause(delay).await.is_err() {
                return Err(Failure::cancelled(format!("cancelled while waiting for {}", what)));
            }
        }
    }

    async fn delete(&mut self, vm: &VmHandle) -> Outcome<Vec<Warning>> {
        let state = match self.settled_state(vm).await? {
            Some(state) => state,
            None => {
                debug!(vm = %vm.id(), "VM already deleted");
                return Ok(Vec::new());
            }
        };
        if state != VmState::Off {
            return Err(invalid(vm, "delete", state));
        }

        let service = self.management_service()?;
        info!(vm = %vm.id(), name = vm.name(), "deleting VM");
        let call = MethodCall::new(service, msvm::MANAGEMENT_SERVICE, "DestroySystem")
            .arg("AffectedSystem", vm.path());
        let (_, warnings) = self.call(call, "DestroySystem").await?;
        info!(vm = %vm.id(), "VM deleted");
        Ok(warnings)
    }

    // ========== Resources ==========

    async fn set_memory(&mut self, vm: &VmHandle, spec: &MemorySpec) -> Outcome<Vec<Warning>> {
        let settings = self.system_settings(vm)?;
        let mut memory = self.component(&settings, msvm::MEMORY_SETTINGS)?;
        let (quantity, reservation, limit) = spec.quantities();
        let dynamic = spec.dynamic.is_some();

        let unchanged = memory.get_u64("VirtualQuantity") == Some(quantity)
            && memory.get_bool("DynamicMemoryEnabled").unwrap_or(false) == dynamic
            && (!dynamic
                || (memory.get_u64("Reservation") == Some(reservation)
                    && memory.get_u64("Limit") == Some(limit)));
        if unchanged {
            debug!(vm = %vm.id(), memory_mb = quantity, "memory already configured");
            return Ok(Vec::new());
        }

        memory
            .set("VirtualQuantity", quantity)
            .set("DynamicMemoryEnabled", dynamic)
            .set("Reservation", reservation)
            .set("Limit", limit);
        info!(vm = %vm.id(), memory_mb = quantity, dynamic, "setting memory");
        self.modify(memory).await
    }

    async fn set_cpu_count(&mut self, vm: &VmHandle, count: u32) -> Outcome<Vec<Warning>> {
        let count = ProcessorCount::parse("cpu_count", count)?;
        let settings = self.system_settings(vm)?;
        let mut processor = self.component(&settings, msvm::PROCESSOR_SETTINGS)?;

        if processor.get_u64("VirtualQuantity") == Some(u64::from(count.get())) {
            debug!(vm = %vm.id(), processors = count.get(), "processor count already configured");
            return Ok(Vec::new());
        }

        processor.set("VirtualQuantity", u64::from(count.get()));
        info!(vm = %vm.id(), processors = count.get(), "setting processor count");
        self.modify(processor).await
    }

    async fn modify(&mut self, resource: WmiObject) -> Outcome<Vec<Warning>> {
        let service = self.management_service()?;
        let call = MethodCall::new(service, msvm::MANAGEMENT_SERVICE, "ModifyResourceSettings")
            .arg("ResourceSettings", vec![resource]);
        let (_, warnings) = self.call(call, "ModifyResourceSettings").await?;
        Ok(warnings)
    }

    async fn attach_disk(&mut self, vm: &VmHandle, spec: &DiskSpec) -> Outcome<Vec<Warning>> {
        spec.validate()?;
        let path = spec.path.trim();
        let settings = self.system_settings(vm)?;
        let settings_path = settings.require_path()?.to_string();

        let attached = self
            .session
            .query(msvm::settings_components(&settings_path, msvm::STORAGE_SETTINGS))?;
        let already_attached = attached.iter().any(|disk| {
            disk.get_string_array("HostResource")
                .is_some_and(|hosts| hosts.iter().any(|h| h.eq_ignore_ascii_case(path)))
        });
        if already_attached {
            debug!(vm = %vm.id(), path, "disk already attached");
            return Ok(Vec::new());
        }

        let generation = settings
            .get_str("VirtualSystemSubType")
            .map(Generation::from_subtype)
            .unwrap_or_default();
        let kind = spec.controller.unwrap_or_else(|| ControllerKind::default_for(generation));
        if generation == Generation::Gen2 && kind == ControllerKind::Ide {
            return Err(Failure::new(
                FailureCode::InvalidRequest,
                "Generation 2 VMs have no IDE controller",
            ));
        }

        let resources = self
            .session
            .query(msvm::settings_components(&settings_path, msvm::RESOURCE_SETTINGS))?;
        let mut controllers: Vec<&WmiObject> = resources
            .iter()
            .filter(|r| r.get_str("ResourceSubType") == Some(kind.subtype()))
            .collect();
        controllers.sort_by_key(|c| {
            (
                c.get_str("Address").and_then(|a| a.parse::<u32>().ok()).unwrap_or(u32::MAX),
                c.get_str("InstanceID").unwrap_or_default().to_string(),
            )
        });
        let controller_path = controllers
            .get(spec.controller_number as usize)
            .ok_or_else(|| {
                Failure::not_found(format!(
                    "{:?} controller {} not found on VM '{}'",
                    kind,
                    spec.controller_number,
                    vm.name()
                ))
            })?
            .require_path()?
            .to_string();

        let used: Vec<u32> = resources
            .iter()
            .filter(|r| r.get_str("ResourceSubType") == Some(subtype::DISK_DRIVE))
            .filter(|r| r.get_str("Parent").is_some_and(|p| p.eq_ignore_ascii_case(&controller_path)))
            .filter_map(|r| r.get_str("AddressOnParent").and_then(|a| a.parse().ok()))
            .collect();
        let location = match spec.location {
            Some(location) if used.contains(&location) => {
                return Err(Failure::new(
                    FailureCode::ResourceInUse,
                    format!(
                        "location {} on {:?} controller {} is already in use",
                        location, kind, spec.controller_number
                    ),
                ))
            }
            Some(location) => location,
            None => (0..=kind.max_location())
                .find(|l| !used.contains(l))
                .ok_or_else(|| {
                    Failure::new(
                        FailureCode::ResourceInUse,
                        format!("{:?} controller {} has no free location", kind, spec.controller_number),
                    )
                })?,
        };

        info!(vm = %vm.id(), path, controller = ?kind, location, "attaching disk");
        let mut drive = self.default_settings(subtype::DISK_DRIVE)?;
        drive
            .set("Parent", controller_path.as_str())
            .set("AddressOnParent", location.to_string());
        let (raw, mut warnings) = self.add_resource(&settings_path, drive).await?;

        let stage = format!("disk drive added at location {} but attaching '{}' failed", location, path);
        let drive_path = resulting_resource(&raw).map_err(|f| attach_stage_failed(f, &stage))?;
        let mut disk = self
            .default_settings(subtype::VIRTUAL_HARD_DISK)
            .map_err(|f| attach_stage_failed(f, &stage))?;
        disk.set("Parent", drive_path).set("HostResource", vec![path.to_string()]);
        let (_, disk_warnings) = self
            .add_resource(&settings_path, disk)
            .await
            .map_err(|f| attach_stage_failed(f, &stage))?;

        warnings.extend(disk_warnings);
        info!(vm = %vm.id(), path, "disk attached");
        Ok(warnings)
    }

    async fn attach_nic(&mut self, vm: &VmHandle, spec: &NicSpec) -> Outcome<Vec<Warning>> {
        spec.validate()?;
        let settings = self.system_settings(vm)?;
        let settings_path = settings.require_path()?.to_string();

        let switch_path = match spec.switch {
            Some(ref name) => Some(
                self.session
                    .query_first(msvm::switch_by_name(name))?
                    .ok_or_else(|| Failure::not_found(format!("virtual switch '{}' not found", name)))?
                    .require_path()?
                    .to_string(),
            ),
            None => None,
        };

        info!(vm = %vm.id(), adapter = %spec.name, switch = ?spec.switch, "adding network adapter");
        let mut port = self.default_settings(subtype::ETHERNET_PORT)?;
        port.set("ElementName", spec.name.as_str())
            .set("VirtualSystemIdentifiers", vec![format!("{{{}}}", Uuid::new_v4())]);
        match spec.static_mac {
            Some(ref mac) => port.set("StaticMacAddress", true).set("Address", mac.as_str()),
            None => port.set("StaticMacAddress", false),
        };
        let (raw, mut warnings) = self.add_resource(&settings_path, port).await?;

        let Some(switch_path) = switch_path else {
            return Ok(warnings);
        };

        let stage = format!("adapter '{}' added but connecting it to the switch failed", spec.name);
        let port_path = resulting_resource(&raw).map_err(|f| attach_stage_failed(f, &stage))?;
        let mut connection = self
            .default_settings(subtype::ETHERNET_CONNECTION)
            .map_err(|f| attach_stage_failed(f, &stage))?;
        connection
            .set("Parent", port_path)
            .set("HostResource", vec![switch_path]);
        let (_, connection_warnings) = self
            .add_resource(&settings_path, connection)
            .await
            .map_err(|f| attach_stage_failed(f, &stage))?;

        warnings.extend(connection_warnings);
        Ok(warnings)
    }

    async fn set_guest_ip(&mut self, vm: &VmHandle, spec: &GuestIpSpec) -> Outcome<Vec<Warning>> {
        spec.validate()?;
        let settings = self.system_settings(vm)?;
        let ports = self
            .session
            .query(msvm::settings_components(settings.require_path()?, msvm::PORT_SETTINGS))?;
        let port = ports
            .iter()
            .find(|p| p.get_str("ElementName") == Some(spec.adapter.as_str()))
            .ok_or_else(|| {
                Failure::not_found(format!("network adapter '{}' not found on VM '{}'", spec.adapter, vm.name()))
            })?;
        let mut config = self
            .session
            .query_first(msvm::guest_network_config(port.require_path()?))?
            .ok_or_else(|| {
                Failure::not_found(format!("adapter '{}' has no guest network configuration", spec.adapter))
            })?;

        let addresses = trimmed(&spec.addresses);
        let subnets = trimmed(&spec.subnets);
        let gateways = trimmed(&spec.gateways);
        let dns_servers = trimmed(&spec.dns_servers);
        let same = |property: &str, wanted: &[String]| {
            config.get_string_array(property).unwrap_or_default() == wanted
        };
        let unchanged = config.get_bool("DHCPEnabled") == Some(spec.dhcp)
            && same("DNSServers", &dns_servers)
            && (spec.dhcp
                || (same("IPAddresses", &addresses)
                    && same("Subnets", &subnets)
                    && same("DefaultGateways", &gateways)));
        if unchanged {
            debug!(vm = %vm.id(), adapter = %spec.adapter, "guest IP settings already applied");
            return Ok(Vec::new());
        }

        config
            .set("DHCPEnabled", spec.dhcp)
            .set("IPAddresses", addresses)
            .set("Subnets", subnets)
            .set("DefaultGateways", gateways)
            .set("DNSServers", dns_servers)
            .set("ProtocolIFType", msvm::PROTOCOL_IPV4_IPV6);
        info!(vm = %vm.id(), adapter = %spec.adapter, dhcp = spec.dhcp, "setting guest IP configuration");
        let service = self.management_service()?;
        let call = MethodCall::new(service, msvm::MANAGEMENT_SERVICE, "SetGuestNetworkAdapterConfiguration")
            .arg("ComputerSystem", vm.path())
            .arg("NetworkConfiguration", vec![config]);
        let (_, warnings) = self.call(call, "SetGuestNetworkAdapterConfiguration").await?;
        Ok(warnings)
    }

    async fn connect_com_port(
        &mut self,
        vm: &VmHandle,
        port: ComPort,
        pipe: Option<&str>,
    ) -> Outcome<Vec<Warning>> {
        if let Some(pipe) = pipe {
            validate_pipe(pipe)?;
        }
        let settings = self.system_settings(vm)?;
        let mut serial = self
            .session
            .query(msvm::settings_components(settings.require_path()?, msvm::SERIAL_PORT_SETTINGS))?
            .into_iter()
            .find(|p| p.get_str("ElementName") == Some(port.element_name()))
            .ok_or_else(|| Failure::not_found(format!("{} not found on VM '{}'", port, vm.name())))?;

        let wanted = pipe.map(str::trim).unwrap_or_default();
        let current = serial
            .get_string_array("Connection")
            .and_then(|c| c.first())
            .map(String::as_str)
            .unwrap_or_default();
        if current.eq_ignore_ascii_case(wanted) {
            debug!(vm = %vm.id(), port = %port, "serial port already connected");
            return Ok(Vec::new());
        }

        serial.set("Connection", vec![wanted.to_string()]);
        info!(vm = %vm.id(), port = %port, pipe = wanted, "connecting serial port");
        self.modify(serial).await
    }

    async fn add_resource(
        &mut self,
        settings_path: &str,
        resource: WmiObject,
    ) -> Outcome<(RawCallResult, Vec<Warning>)> {
        let service = self.management_service()?;
        let call = MethodCall::new(service, msvm::MANAGEMENT_SERVICE, "AddResourceSettings")
            .arg("AffectedConfiguration", settings_path)
            .arg("ResourceSettings", vec![resource]);
        self.call(call, "AddResourceSettings").await
    }

    // ========== Provider Calls ==========

    /// Execute a method and track its job to a terminal state.
    async fn call(&mut self, call: MethodCall, operation: &str) -> Outcome<(RawCallResult, Vec<Warning>)> {
        let session = self.session;
        let raw = session.exec(call).map_err(|e| {
            // The request may have reached the provider before the reply was lost.
            let unconfirmed = matches!(e, Error::Transport(_));
            let failure = Failure::from(e);
            if unconfirmed {
                failure.with_partial(PartialCompletion::Unknown)
            } else {
                failure
            }
        })?;

        match session
            .tracker()
            .submit(&raw, operation, |path| session.get_object(path), &mut self.suspend)
            .await
        {
            OperationResult::Success { warnings } => Ok((raw, warnings)),
            OperationResult::Failure(failure) => Err(failure),
        }
    }

    fn management_service(&self) -> Outcome<String> {
        let service = self
            .session
            .query_first(msvm::management_service())?
            .ok_or_else(|| Failure::not_found("Hyper-V management service not found"))?;
        Ok(service.require_path()?.to_string())
    }

    fn system_settings(&self, vm: &VmHandle) -> Outcome<WmiObject> {
        self.session
            .query_first(msvm::system_settings(vm.path()))?
            .ok_or_else(|| gone(vm))
    }

    fn component(&self, settings: &WmiObject, class: &str) -> Outcome<WmiObject> {
        self.session
            .query_first(msvm::settings_components(settings.require_path()?, class))?
            .ok_or_else(|| Failure::not_found(format!("{} not found for VM settings", class)))
    }

    /// Default settings for a resource subtype, read from its primordial pool.
    fn default_settings(&self, resource_subtype: &str) -> Outcome<WmiObject> {
        let missing = || Failure::not_found(format!("no default settings for '{}'", resource_subtype));

        let pool = self
            .session
            .query_first(msvm::primordial_pool(resource_subtype))?
            .ok_or_else(missing)?;
        let capabilities = self
            .session
            .query_first(msvm::pool_capabilities(pool.require_path()?))?
            .ok_or_else(missing)?;
        let references = self
            .session
            .query(msvm::capability_settings(capabilities.require_path()?))?;
        let default = references
            .iter()
            .find(|r| r.get_u16("ValueRole") == Some(msvm::VALUE_ROLE_DEFAULT))
            .and_then(|r| r.get_str("PartComponent"))
            .ok_or_else(missing)?;
        Ok(self.session.get_object(default)?)
    }
}

/// Current state of a VM, `None` if it no longer exists.
fn read_state(session: &Session, id: &VmId) -> Outcome<Option<VmState>> {
    match session.query_first(msvm::vm_by_id(id))? {
        Some(vm) => Ok(Some(VmState::from_enabled_state(vm.require_u16("EnabledState")?))),
        None => Ok(None),
    }
}

fn resulting_resource(raw: &RawCallResult) -> Outcome<String> {
    raw.out()
        .get_string_array("ResultingResourceSettings")
        .and_then(|paths| paths.first().cloned())
        .ok_or_else(|| Error::missing_property(raw.out().class(), "ResultingResourceSettings").into())
}

fn trimmed(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.trim().to_string()).collect()
}

fn attach_stage_failed(failure: Failure, stage: &str) -> Failure {
    failure.with_partial(PartialCompletion::Yes).context(stage)
}

fn already(vm: &VmHandle, operation: &str, state: VmState) -> Vec<Warning> {
    debug!(vm = %vm.id(), operation, state = %state, "already in requested state");
    Vec::new()
}

fn invalid(vm: &VmHandle, operation: &str, state: VmState) -> Failure {
    Failure::invalid_state(format!("cannot {} VM '{}' while it is {}", operation, vm.name(), state))
}

fn already_finished(state: &str) -> Warning {
    Warning::new(format!("job had already finished ({}) before it could be terminated", state))
}

fn gone(vm: &VmHandle) -> Failure {
    Failure::not_found(format!("VM '{}' ({}) no longer exists", vm.name(), vm.id()))
}

fn report(index: usize, step: &Step, outcome: StepOutcome) -> StepReport {
    StepReport {
        index,
        operation: step.operation.label().to_string(),
        policy: step.policy,
        outcome,
    }
}

/// Failure for a step that completed with warnings under `AbortOnFailure`.
fn warning_failure(label: &str, warning: &Warning) -> Failure {
    let code = warning.provider_code.map(classify).unwrap_or(FailureCode::Unknown(0));
    let mut failure = Failure::new(code, format!("{} completed with warnings: {}", label, warning.message))
        .with_partial(PartialCompletion::Yes);
    failure.provider_code = warning.provider_code;
    failure
}

fn abort(
    vm: &VmHandle,
    failure: Failure,
    index: usize,
    completed: usize,
    mut reports: Vec<StepReport>,
    steps: &[Step],
) -> Failure {
    warn!(
        vm = %vm.id(),
        step = index,
        completed,
        error = %failure,
        "lifecycle request stopped"
    );
    for (skipped, step) in steps.iter().enumerate().skip(index + 1) {
        reports.push(report(skipped, step, StepOutcome::NotRun));
    }
    summarize(failure, index, completed, reports)
}

fn summarize(mut failure: Failure, index: usize, completed: usize, reports: Vec<StepReport>) -> Failure {
    if completed > 0 {
        failure.partial = PartialCompletion::Yes;
    }
    failure.completed_steps = completed;
    failure.failed_step = Some(index);
    failure.steps = reports;
    failure
}
