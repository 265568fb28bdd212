//! # hyperv-jobs
//!
//! Job-oriented Hyper-V VM control over WMI (`root\virtualization\v2`).
//!
//! Every lifecycle or configuration change is issued as a provider method
//! call. When the provider answers with an `Msvm_ConcreteJob`, the call is
//! tracked to a terminal state under a bounded, cancellable wait and mapped
//! to a typed [`OperationResult`]. Failures carry a [`FailureCode`] and say
//! whether the host may have been left partially changed.
//!
//! ## Features
//!
//! - **Sessions**: one connection per host, shared by clone, closed once
//! - **Job tracking**: backoff polling, timeouts, transport retries, termination
//! - **Lifecycle**: start, stop, guest shutdown, pause, resume, save, delete
//! - **Configuration**: disks, network adapters, memory and processors
//! - **Guest plumbing**: guest IP injection, serial port pipes, disk clones
//! - **Inventory**: virtual switches, adapters and their connections
//! - **Sequences**: ordered steps with per-step failure policy
//! - **Sync and async**: the same implementation behind both facades
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> hyperv_jobs::Result<()> {
//! use hyperv_jobs::{connect, SessionConfig, VmOperation, LifecycleRequest, StepPolicy};
//!
//! let session = connect(SessionConfig::local())?;
//! for vm in session.list_vms()? {
//!     println!("{} {}", vm.name(), vm.state()?);
//! }
//!
//! let vm = session.get_vm("5C8F5E1A-0B3D-4F7E-9A61-2D7F3B1C9E40")?;
//! let request = LifecycleRequest::new()
//!     .step(VmOperation::SetCpuCount(4))
//!     .step_with(VmOperation::Start, StepPolicy::ContinueOnWarning);
//! match vm.execute(&request) {
//!     result if result.is_success() => println!("done"),
//!     result => println!("failed: {:?}", result.failure()),
//! }
//! session.close();
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! Off Windows, [`InMemoryHyperV`] stands in for the provider.
//!
//! ## Requirements
//!
//! - Windows 10/11 or Windows Server 2016+ with Hyper-V enabled
//! - Membership in Hyper-V Administrators (or Administrators)

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod memory;
mod msvm;
pub mod result;
mod session;
mod suspend;
pub mod vm;
pub mod wmi;

pub use config::{ConfigError, Credentials, PollPolicy, SessionConfig};
pub use error::{Error, Result, TransportError, TransportErrorKind};
pub use memory::InMemoryHyperV;
pub use result::{
    Failure, FailureCode, OperationResult, PartialCompletion, PendingJob, StepOutcome, StepReport,
    Warning,
};
#[cfg(windows)]
pub use session::connect;
pub use session::Session;

// Lifecycle types
pub use lifecycle::{LifecycleRequest, Step, StepPolicy, VmOperation};

// VM types
pub use vm::{
    CloneMode, ComPort, ControllerKind, DiskClone, DiskSpec, DynamicMemory, Generation,
    GuestIpSpec, MemoryMB, MemorySpec, NetworkAdapter, NicSpec, ProcessorCount, RequestedState,
    SerialPort, VhdFormat, VirtualSwitch, VmHandle, VmId, VmSpec, VmSpecBuilder, VmState,
};

// Job types
pub use wmi::JobState;
