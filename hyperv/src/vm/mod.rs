mod devices;
mod handle;
mod spec;
mod state;
mod types;

pub use devices::{NetworkAdapter, SerialPort, VirtualSwitch};
pub use handle::VmHandle;
pub(crate) use spec::validate_pipe;
pub use spec::{
    CloneMode, ComPort, ControllerKind, DiskClone, DiskSpec, DynamicMemory, GuestIpSpec, MemorySpec,
    NicSpec, VhdFormat, VmSpec, VmSpecBuilder,
};
pub use state::{Generation, RequestedState, VmState};
pub use types::{MemoryMB, ProcessorCount, VmId};
