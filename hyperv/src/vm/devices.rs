//! Host switches and the devices a VM exposes, as read from the provider.

use serde::Serialize;

use crate::error::Result;
use crate::wmi::WmiObject;

/// A Hyper-V virtual Ethernet switch.
///
/// Two switches are equal when their ids match, whatever their display
/// names.
#[derive(Debug, Clone, Eq, Serialize)]
pub struct VirtualSwitch {
    id: String,
    name: String,
    #[serde(skip)]
    path: String,
}

impl PartialEq for VirtualSwitch {
    fn eq(&self, other: &Self) -> bool {
        self.id.eq_ignore_ascii_case(&other.id)
    }
}

impl VirtualSwitch {
    pub(crate) fn from_wmi(obj: &WmiObject) -> Result<Self> {
        Ok(Self {
            id: obj.require_str("Name")?.to_string(),
            name: obj.get_str("ElementName").unwrap_or_default().to_string(),
            path: obj.require_path()?.to_string(),
        })
    }

    /// Switch GUID (`Name`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A VM's synthetic network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAdapter {
    pub name: String,
    /// MAC address as 12 hex digits, once one is assigned.
    pub address: Option<String>,
    pub static_mac: bool,
    /// Switch the adapter is connected to, if any.
    pub switch: Option<VirtualSwitch>,
}

impl NetworkAdapter {
    pub(crate) fn from_wmi(port: &WmiObject, switch: Option<VirtualSwitch>) -> Self {
        Self {
            name: port.get_str("ElementName").unwrap_or_default().to_string(),
            address: port
                .get_str("Address")
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            static_mac: port.get_bool("StaticMacAddress").unwrap_or(false),
            switch,
        }
    }
}

/// A VM's serial port and the named pipe it is connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPort {
    /// `COM 1` or `COM 2`.
    pub name: String,
    pub pipe: Option<String>,
}

impl SerialPort {
    pub(crate) fn from_wmi(port: &WmiObject) -> Self {
        Self {
            name: port.get_str("ElementName").unwrap_or_default().to_string(),
            pipe: port
                .get_string_array("Connection")
                .and_then(|c| c.first())
                .filter(|c| !c.is_empty())
                .cloned(),
        }
    }
}
