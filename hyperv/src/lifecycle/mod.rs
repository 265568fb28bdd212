//! VM lifecycle operations and ordered requests.

mod controller;

pub(crate) use controller::Controller;

use serde::Serialize;

use crate::vm::{ComPort, DiskSpec, GuestIpSpec, MemorySpec, NicSpec};

/// How a step's outcome affects the rest of a [`LifecycleRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum StepPolicy {
    /// Stop on failure, and on warnings.
    ///
    /// A step that completed with warnings did change the VM, so stopping
    /// on it reports `partial = Yes` even when it is the first step.
    #[default]
    AbortOnFailure,
    /// Stop on failure; warnings are collected and the sequence continues.
    ContinueOnWarning,
    /// Record a failure and continue with the next step.
    BestEffort,
}

/// One operation against a VM.
#[derive(Debug, Clone, PartialEq)]
pub enum VmOperation {
    Start,
    /// Hard power off.
    Stop,
    /// Guest shutdown through the integration service, falling back to
    /// power off when the guest does not cooperate.
    Shutdown {
        force: bool,
    },
    Pause,
    Resume,
    Save,
    Delete,
    AttachDisk(DiskSpec),
    AttachNic(NicSpec),
    SetMemory(MemorySpec),
    SetCpuCount(u32),
    /// Push IP settings into the guest through the KVP integration service.
    SetGuestIp(GuestIpSpec),
    /// Point a serial port at a named pipe; `None` disconnects it.
    ConnectComPort {
        port: ComPort,
        pipe: Option<String>,
    },
}

impl VmOperation {
    pub fn label(&self) -> &'static str {
        match self {
            VmOperation::Start => "start",
            VmOperation::Stop => "stop",
            VmOperation::Shutdown { .. } => "shutdown",
            VmOperation::Pause => "pause",
            VmOperation::Resume => "resume",
            VmOperation::Save => "save",
            VmOperation::Delete => "delete",
            VmOperation::AttachDisk(_) => "attach_disk",
            VmOperation::AttachNic(_) => "attach_nic",
            VmOperation::SetMemory(_) => "set_memory",
            VmOperation::SetCpuCount(_) => "set_cpu_count",
            VmOperation::SetGuestIp(_) => "set_guest_ip",
            VmOperation::ConnectComPort { .. } => "connect_com_port",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub operation: VmOperation,
    pub policy: StepPolicy,
}

/// Ordered list of operations applied to one VM.
///
/// Steps run strictly in order; a step never starts before the previous
/// step's job is terminal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LifecycleRequest {
    steps: Vec<Step>,
}

impl LifecycleRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single operation with the default policy.
    pub fn single(operation: VmOperation) -> Self {
        Self::new().step(operation)
    }

    /// Append a step with [`StepPolicy::AbortOnFailure`].
    pub fn step(self, operation: VmOperation) -> Self {
        self.step_with(operation, StepPolicy::default())
    }

    pub fn step_with(mut self, operation: VmOperation, policy: StepPolicy) -> Self {
        self.steps.push(Step { operation, policy });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromIterator<Step> for LifecycleRequest {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keeps_order_and_policies() {
        let request = LifecycleRequest::new()
            .step(VmOperation::Stop)
            .step_with(VmOperation::SetCpuCount(4), StepPolicy::BestEffort)
            .step_with(VmOperation::Start, StepPolicy::ContinueOnWarning)
            .step(VmOperation::ConnectComPort {
                port: ComPort::Com1,
                pipe: Some(r"\\.\pipe\web-01".to_string()),
            });

        let labels: Vec<_> = request.steps().iter().map(|s| s.operation.label()).collect();
        assert_eq!(labels, ["stop", "set_cpu_count", "start", "connect_com_port"]);
        assert_eq!(request.steps()[0].policy, StepPolicy::AbortOnFailure);
        assert_eq!(request.steps()[1].policy, StepPolicy::BestEffort);
        assert_eq!(request.len(), 4);
    }

    #[test]
    fn single_step_request() {
        let request = LifecycleRequest::single(VmOperation::Shutdown { force: true });
        assert_eq!(request.len(), 1);
        assert!(!request.is_empty());
        assert!(LifecycleRequest::new().is_empty());
    }
}
