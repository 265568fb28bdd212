use core::fmt;

use tokio_util::sync::CancellationToken;

use super::devices::{NetworkAdapter, SerialPort, VirtualSwitch};
use super::spec::{ComPort, DiskSpec, GuestIpSpec, MemorySpec, NicSpec};
use super::state::VmState;
use super::types::VmId;
use crate::error::{Error, Result};
use crate::lifecycle::{Controller, LifecycleRequest, VmOperation};
use crate::msvm;
use crate::result::{Failure, OperationResult};
use crate::session::Session;
use crate::suspend::{run_blocking, Blocking, Cooperative};
use crate::wmi::WmiObject;

/// A Hyper-V virtual machine.
///
/// Holds identity only; state is read from the provider on every call.
/// Every operation has a blocking form and an `_async` form that takes a
/// [`CancellationToken`]. Both run the same implementation and return the
/// same [`OperationResult`] for the same provider behavior.
#[derive(Clone)]
pub struct VmHandle {
    session: Session,
    id: VmId,
    name: String,
    path: String,
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl VmHandle {
    pub(crate) fn from_wmi(session: Session, obj: &WmiObject) -> Result<Self> {
        Ok(Self {
            id: VmId::parse(obj.require_str("Name")?)?,
            name: obj.get_str("ElementName").unwrap_or_default().to_string(),
            path: obj.require_path()?.to_string(),
            session,
        })
    }

    pub fn id(&self) -> &VmId {
        &self.id
    }

    /// Display name at the time the handle was obtained.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider object path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Current state, read fresh from the provider.
    pub fn state(&self) -> Result<VmState> {
        let vm = self
            .session
            .query_first(msvm::vm_by_id(&self.id))?
            .ok_or_else(|| Error::VmNotFound(self.id.to_string()))?;
        Ok(VmState::from_enabled_state(vm.require_u16("EnabledState")?))
    }

    pub async fn state_async(&self, cancel: &CancellationToken) -> Result<VmState> {
        if cancel.is_cancelled() {
            return Err(Error::Operation(Failure::cancelled("state query cancelled")));
        }
        self.state()
    }

    /// Network adapters with the switch each one is connected to.
    pub fn network_adapters(&self) -> Result<Vec<NetworkAdapter>> {
        let settings = self.settings_path()?;
        let ports = self
            .session
            .query(msvm::settings_components(&settings, msvm::PORT_SETTINGS))?;
        let connections = self
            .session
            .query(msvm::settings_components(&settings, msvm::CONNECTION_SETTINGS))?;

        ports
            .iter()
            .map(|port| -> Result<NetworkAdapter> {
                let port_path = port.require_path()?;
                let switch = connections
                    .iter()
                    .find(|c| c.get_str("Parent").is_some_and(|p| p.eq_ignore_ascii_case(port_path)))
                    .and_then(|c| c.get_string_array("HostResource"))
                    .and_then(|hosts| hosts.first())
                    .filter(|host| !host.is_empty())
                    .map(|host| self.switch_at(host))
                    .transpose()?
                    .flatten();
                Ok(NetworkAdapter::from_wmi(port, switch))
            })
            .collect()
    }

    /// Whether any adapter is connected to `switch`.
    pub fn is_connected_to(&self, switch: &VirtualSwitch) -> Result<bool> {
        Ok(self
            .network_adapters()?
            .iter()
            .any(|adapter| adapter.switch.as_ref() == Some(switch)))
    }

    /// Serial ports, ordered by name.
    pub fn serial_ports(&self) -> Result<Vec<SerialPort>> {
        let settings = self.settings_path()?;
        let mut ports: Vec<SerialPort> = self
            .session
            .query(msvm::settings_components(&settings, msvm::SERIAL_PORT_SETTINGS))?
            .iter()
            .map(SerialPort::from_wmi)
            .collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }

    fn settings_path(&self) -> Result<String> {
        let settings = self
            .session
            .query_first(msvm::system_settings(&self.path))?
            .ok_or_else(|| Error::VmNotFound(self.id.to_string()))?;
        Ok(settings.require_path()?.to_string())
    }

    /// Switch at `path`; `None` once the switch has been deleted.
    fn switch_at(&self, path: &str) -> Result<Option<VirtualSwitch>> {
        match self.session.get_object(path) {
            Ok(obj) => VirtualSwitch::from_wmi(&obj).map(Some),
            Err(Error::Transport(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn start(&self) -> OperationResult {
        self.perform(VmOperation::Start)
    }

    /// Hard power off.
    pub fn stop(&self) -> OperationResult {
        self.perform(VmOperation::Stop)
    }

    /// Guest shutdown; falls back to power off when the guest does not
    /// cooperate, reporting the fallback as a warning.
    pub fn shutdown(&self, force: bool) -> OperationResult {
        self.perform(VmOperation::Shutdown { force })
    }

    pub fn pause(&self) -> OperationResult {
        self.perform(VmOperation::Pause)
    }

    pub fn resume(&self) -> OperationResult {
        self.perform(VmOperation::Resume)
    }

    pub fn save(&self) -> OperationResult {
        self.perform(VmOperation::Save)
    }

    /// Delete the VM. The VM must be off; deleting a missing VM succeeds.
    pub fn delete(&self) -> OperationResult {
        self.perform(VmOperation::Delete)
    }

    pub fn attach_disk(&self, disk: &DiskSpec) -> OperationResult {
        self.perform(VmOperation::AttachDisk(disk.clone()))
    }

    pub fn attach_nic(&self, nic: &NicSpec) -> OperationResult {
        self.perform(VmOperation::AttachNic(nic.clone()))
    }

    pub fn set_memory(&self, memory: MemorySpec) -> OperationResult {
        self.perform(VmOperation::SetMemory(memory))
    }

    pub fn set_cpu_count(&self, count: u32) -> OperationResult {
        self.perform(VmOperation::SetCpuCount(count))
    }

    /// Apply IP settings inside the guest. Needs the KVP integration
    /// service in a running guest to take effect.
    pub fn set_guest_ip(&self, spec: &GuestIpSpec) -> OperationResult {
        self.perform(VmOperation::SetGuestIp(spec.clone()))
    }

    /// Connect a serial port to a named pipe, or disconnect it with `None`.
    pub fn connect_com_port(&self, port: ComPort, pipe: Option<&str>) -> OperationResult {
        self.perform(VmOperation::ConnectComPort {
            port,
            pipe: pipe.map(str::to_string),
        })
    }

    /// Run an ordered list of operations.
    pub fn execute(&self, request: &LifecycleRequest) -> OperationResult {
        let mut controller = Controller::new(&self.session, Blocking);
        run_blocking(controller.execute(self, request))
    }

    pub async fn start_async(&self, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Start, cancel).await
    }

    pub async fn stop_async(&self, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Stop, cancel).await
    }

    pub async fn shutdown_async(&self, force: bool, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Shutdown { force }, cancel).await
    }

    pub async fn pause_async(&self, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Pause, cancel).await
    }

    pub async fn resume_async(&self, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Resume, cancel).await
    }

    pub async fn save_async(&self, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Save, cancel).await
    }

    pub async fn delete_async(&self, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::Delete, cancel).await
    }

    pub async fn attach_disk_async(&self, disk: &DiskSpec, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::AttachDisk(disk.clone()), cancel).await
    }

    pub async fn attach_nic_async(&self, nic: &NicSpec, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::AttachNic(nic.clone()), cancel).await
    }

    pub async fn set_memory_async(&self, memory: MemorySpec, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::SetMemory(memory), cancel).await
    }

    pub async fn set_cpu_count_async(&self, count: u32, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::SetCpuCount(count), cancel).await
    }

    pub async fn set_guest_ip_async(&self, spec: &GuestIpSpec, cancel: &CancellationToken) -> OperationResult {
        self.perform_async(VmOperation::SetGuestIp(spec.clone()), cancel).await
    }

    pub async fn connect_com_port_async(
        &self,
        port: ComPort,
        pipe: Option<&str>,
        cancel: &CancellationToken,
    ) -> OperationResult {
        let operation = VmOperation::ConnectComPort {
            port,
            pipe: pipe.map(str::to_string),
        };
        self.perform_async(operation, cancel).await
    }

    /// Run an ordered list of operations. Cancelling the token stops the
    /// sequence at the next suspension point; the running step reports
    /// `Cancelled` and later steps are not run.
    pub async fn execute_async(
        &self,
        request: &LifecycleRequest,
        cancel: &CancellationToken,
    ) -> OperationResult {
        let mut controller = Controller::new(&self.session, Cooperative::new(cancel));
        controller.execute(self, request).await
    }

    fn perform(&self, operation: VmOperation) -> OperationResult {
        let mut controller = Controller::new(&self.session, Blocking);
        run_blocking(controller.perform(self, &operation))
    }

    async fn perform_async(&self, operation: VmOperation, cancel: &CancellationToken) -> OperationResult {
        let mut controller = Controller::new(&self.session, Cooperative::new(cancel));
        controller.perform(self, &operation).await
    }
}
