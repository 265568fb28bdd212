//! Msvm_* classes, subtypes and queries used against `root\virtualization\v2`.

use crate::vm::VmId;
use crate::wmi::Query;

pub(crate) const COMPUTER_SYSTEM: &str = "Msvm_ComputerSystem";
pub(crate) const MANAGEMENT_SERVICE: &str = "Msvm_VirtualSystemManagementService";
pub(crate) const SYSTEM_SETTINGS: &str = "Msvm_VirtualSystemSettingData";
pub(crate) const MEMORY_SETTINGS: &str = "Msvm_MemorySettingData";
pub(crate) const PROCESSOR_SETTINGS: &str = "Msvm_ProcessorSettingData";
pub(crate) const RESOURCE_SETTINGS: &str = "Msvm_ResourceAllocationSettingData";
pub(crate) const STORAGE_SETTINGS: &str = "Msvm_StorageAllocationSettingData";
pub(crate) const PORT_SETTINGS: &str = "Msvm_SyntheticEthernetPortSettingData";
pub(crate) const CONNECTION_SETTINGS: &str = "Msvm_EthernetPortAllocationSettingData";
pub(crate) const CONCRETE_JOB: &str = "Msvm_ConcreteJob";
pub(crate) const SHUTDOWN_COMPONENT: &str = "Msvm_ShutdownComponent";
pub(crate) const ETHERNET_SWITCH: &str = "Msvm_VirtualEthernetSwitch";
pub(crate) const RESOURCE_POOL: &str = "Msvm_ResourcePool";
pub(crate) const ALLOCATION_CAPABILITIES: &str = "Msvm_AllocationCapabilities";
pub(crate) const ELEMENT_CAPABILITIES: &str = "Msvm_ElementCapabilities";
pub(crate) const SETTINGS_DEFINE_CAPABILITIES: &str = "Msvm_SettingsDefineCapabilities";
pub(crate) const SETTINGS_DEFINE_STATE: &str = "Msvm_SettingsDefineState";
pub(crate) const SETTINGS_COMPONENT: &str = "Msvm_VirtualSystemSettingDataComponent";
pub(crate) const SETTING_DATA_COMPONENT: &str = "Msvm_SettingDataComponent";
pub(crate) const GUEST_NETWORK_CONFIG: &str = "Msvm_GuestNetworkAdapterConfiguration";
pub(crate) const SERIAL_PORT_SETTINGS: &str = "Msvm_SerialPortSettingData";
pub(crate) const IMAGE_MANAGEMENT_SERVICE: &str = "Msvm_ImageManagementService";
pub(crate) const VHD_SETTINGS: &str = "Msvm_VirtualHardDiskSettingData";

/// `Caption` of `Msvm_ComputerSystem` instances that are VMs (not the host).
pub(crate) const VM_CAPTION: &str = "Virtual Machine";

/// `ResourceSubType` values.
pub(crate) mod subtype {
    pub(crate) const DISK_DRIVE: &str = "Microsoft:Hyper-V:Synthetic Disk Drive";
    pub(crate) const VIRTUAL_HARD_DISK: &str = "Microsoft:Hyper-V:Virtual Hard Disk";
    pub(crate) const ETHERNET_PORT: &str = "Microsoft:Hyper-V:Synthetic Ethernet Port";
    pub(crate) const ETHERNET_CONNECTION: &str = "Microsoft:Hyper-V:Ethernet Connection";
}

/// `Msvm_SettingsDefineCapabilities.ValueRole` of the default settings.
pub(crate) const VALUE_ROLE_DEFAULT: u16 = 0;

/// `Msvm_VirtualHardDiskSettingData.Type` values.
pub(crate) const VHD_DYNAMIC: u16 = 3;
pub(crate) const VHD_DIFFERENCING: u16 = 4;

/// `ProtocolIFType` for a guest adapter carrying IPv4 and IPv6.
pub(crate) const PROTOCOL_IPV4_IPV6: u16 = 4096;

/// `RequestStateChange` value that terminates a `CIM_ConcreteJob`.
pub(crate) const JOB_TERMINATE: u16 = 4;

/// Shutdown component accepts requests only when OK (2) or Degraded (3).
pub(crate) fn shutdown_available(operational_status: Option<&[u16]>) -> bool {
    matches!(operational_status.and_then(|s| s.first()), Some(2) | Some(3))
}

pub(crate) fn vms() -> Query {
    Query::select(COMPUTER_SYSTEM).filter("Caption", VM_CAPTION)
}

pub(crate) fn vms_named(name: &str) -> Query {
    vms().filter("ElementName", name)
}

pub(crate) fn vm_by_id(id: &VmId) -> Query {
    vms().filter("Name", id.as_str())
}

pub(crate) fn management_service() -> Query {
    Query::select(MANAGEMENT_SERVICE)
}

/// Active settings of a VM.
pub(crate) fn system_settings(vm_path: &str) -> Query {
    Query::associators(vm_path, SYSTEM_SETTINGS).via(SETTINGS_DEFINE_STATE)
}

/// Resource settings of a given class that belong to a VM's settings.
pub(crate) fn settings_components(settings_path: &str, class: &str) -> Query {
    Query::associators(settings_path, class).via(SETTINGS_COMPONENT)
}

pub(crate) fn shutdown_component(id: &VmId) -> Query {
    Query::select(SHUTDOWN_COMPONENT).filter("SystemName", id.as_str())
}

pub(crate) fn switch_by_name(name: &str) -> Query {
    Query::select(ETHERNET_SWITCH).filter("ElementName", name)
}

pub(crate) fn switches() -> Query {
    Query::select(ETHERNET_SWITCH)
}

pub(crate) fn switch_by_id(id: &str) -> Query {
    Query::select(ETHERNET_SWITCH).filter("Name", id)
}

/// Guest-side IP configuration of a synthetic adapter.
pub(crate) fn guest_network_config(port_path: &str) -> Query {
    Query::associators(port_path, GUEST_NETWORK_CONFIG)
}

pub(crate) fn image_management_service() -> Query {
    Query::select(IMAGE_MANAGEMENT_SERVICE)
}

pub(crate) fn primordial_pool(subtype: &str) -> Query {
    Query::select(RESOURCE_POOL)
        .filter("ResourceSubType", subtype)
        .filter("Primordial", true)
}

pub(crate) fn pool_capabilities(pool_path: &str) -> Query {
    Query::associators(pool_path, ALLOCATION_CAPABILITIES).via(ELEMENT_CAPABILITIES)
}

pub(crate) fn capability_settings(capabilities_path: &str) -> Query {
    Query::references(capabilities_path, SETTINGS_DEFINE_CAPABILITIES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_queries() {
        let id = VmId::parse("5c8f5e1a-0b3d-4f7e-9a61-2d7f3b1c9e40").unwrap();
        assert_eq!(
            vm_by_id(&id).to_string(),
            "SELECT * FROM Msvm_ComputerSystem WHERE Caption = 'Virtual Machine' AND Name = '5C8F5E1A-0B3D-4F7E-9A61-2D7F3B1C9E40'"
        );
        assert_eq!(
            primordial_pool(subtype::DISK_DRIVE).to_string(),
            "SELECT * FROM Msvm_ResourcePool WHERE ResourceSubType = 'Microsoft:Hyper-V:Synthetic Disk Drive' AND Primordial = TRUE"
        );
    }

    #[test]
    fn device_queries() {
        assert_eq!(
            switch_by_id("0C8B6E21-7D8A-4A0B-9F3E-1D2C3B4A5F60").to_string(),
            "SELECT * FROM Msvm_VirtualEthernetSwitch WHERE Name = '0C8B6E21-7D8A-4A0B-9F3E-1D2C3B4A5F60'"
        );
        assert_eq!(
            guest_network_config("port").to_string(),
            "ASSOCIATORS OF {port} WHERE ResultClass=Msvm_GuestNetworkAdapterConfiguration"
        );
    }

    #[test]
    fn shutdown_status() {
        assert!(shutdown_available(Some(&[2])));
        assert!(shutdown_available(Some(&[3, 32775])));
        assert!(!shutdown_available(Some(&[12])));
        assert!(!shutdown_available(None));
    }
}
