use core::fmt;

use serde::Serialize;

/// VM enabled state (`Msvm_ComputerSystem.EnabledState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VmState {
    Unknown,
    Running,
    Off,
    ShuttingDown,
    Paused,
    /// Saved (hibernated) to disk.
    Saved,
    Starting,
    Saving,
    Stopping,
    Pausing,
    Resuming,
}

impl VmState {
    /// Parse from the WMI `EnabledState` value.
    ///
    /// The v2 namespace reports 6/9/10 for Saved/Paused/Starting; older hosts
    /// use the 327xx range, which is accepted as well.
    pub fn from_enabled_state(value: u16) -> Self {
        match value {
            2 => VmState::Running,
            3 => VmState::Off,
            4 => VmState::ShuttingDown,
            6 | 32769 => VmState::Saved,
            9 | 32768 => VmState::Paused,
            10 | 32770 => VmState::Starting,
            32773 => VmState::Saving,
            32774 => VmState::Stopping,
            32776 => VmState::Pausing,
            32777 => VmState::Resuming,
            _ => VmState::Unknown,
        }
    }

    /// `EnabledState` value as reported by the v2 namespace.
    pub fn to_enabled_state(&self) -> u16 {
        match self {
            VmState::Unknown => 0,
            VmState::Running => 2,
            VmState::Off => 3,
            VmState::ShuttingDown => 4,
            VmState::Saved => 6,
            VmState::Paused => 9,
            VmState::Starting => 10,
            VmState::Saving => 32773,
            VmState::Stopping => 32774,
            VmState::Pausing => 32776,
            VmState::Resuming => 32777,
        }
    }

    /// Check if VM can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::Off | VmState::Saved | VmState::Paused)
    }

    /// Check if VM can be turned off.
    pub fn can_stop(&self) -> bool {
        matches!(self, VmState::Running | VmState::Paused | VmState::Saved)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, VmState::Running)
    }

    pub fn can_save(&self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }

    /// Check if VM is in a transitional state.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Stopping
                | VmState::Saving
                | VmState::Pausing
                | VmState::Resuming
                | VmState::ShuttingDown
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Unknown => "Unknown",
            VmState::Running => "Running",
            VmState::Off => "Off",
            VmState::ShuttingDown => "Shutting Down",
            VmState::Paused => "Paused",
            VmState::Saved => "Saved",
            VmState::Starting => "Starting",
            VmState::Saving => "Saving",
            VmState::Stopping => "Stopping",
            VmState::Pausing => "Pausing",
            VmState::Resuming => "Resuming",
        };
        write!(f, "{}", s)
    }
}

/// VM generation (Gen1 = BIOS, Gen2 = UEFI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Generation {
    /// Generation 1 VM (BIOS-based, IDE boot).
    Gen1,
    /// Generation 2 VM (UEFI-based, SCSI boot).
    #[default]
    Gen2,
}

impl Generation {
    /// Get the WMI VirtualSystemSubType value.
    pub fn to_subtype(&self) -> &'static str {
        match self {
            Generation::Gen1 => "Microsoft:Hyper-V:SubType:1",
            Generation::Gen2 => "Microsoft:Hyper-V:SubType:2",
        }
    }

    /// Parse from WMI VirtualSystemSubType value.
    pub fn from_subtype(subtype: &str) -> Self {
        if subtype.ends_with(":2") {
            Generation::Gen2
        } else {
            Generation::Gen1
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Gen1 => write!(f, "Generation 1"),
            Generation::Gen2 => write!(f, "Generation 2"),
        }
    }
}

/// Requested state for `RequestStateChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestedState {
    /// Start or resume the VM.
    Running = 2,
    /// Power off the VM (hard stop).
    Off = 3,
    /// Save the VM state to disk.
    Saved = 6,
    /// Pause the VM.
    Paused = 9,
    /// Reset the VM.
    Reset = 11,
}

impl RequestedState {
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Stable state the VM reports once the request took effect.
    pub fn settled_state(self) -> VmState {
        match self {
            RequestedState::Running | RequestedState::Reset => VmState::Running,
            RequestedState::Off => VmState::Off,
            RequestedState::Saved => VmState::Saved,
            RequestedState::Paused => VmState::Paused,
        }
    }

    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            2 => Some(RequestedState::Running),
            3 => Some(RequestedState::Off),
            6 => Some(RequestedState::Saved),
            9 => Some(RequestedState::Paused),
            11 => Some(RequestedState::Reset),
            _ => None,
        }
    }
}
