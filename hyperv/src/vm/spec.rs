//! Inputs for defining and reconfiguring VMs.

use core::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;

use super::state::Generation;
use super::types::{MemoryMB, ProcessorCount};
use crate::error::{Error, Result};

/// Settings for a new VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmSpec {
    pub name: String,
    pub generation: Generation,
    pub memory: MemoryMB,
    pub processor_count: ProcessorCount,
    pub notes: Option<String>,
}

impl VmSpec {
    pub fn builder() -> VmSpecBuilder {
        VmSpecBuilder::default()
    }

    /// Check cross-field constraints and name rules.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)
    }

    pub(crate) fn memory_spec(&self) -> MemorySpec {
        MemorySpec {
            startup: self.memory,
            dynamic: None,
        }
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("name", "VM name cannot be empty"));
    }

    if name.chars().count() > 100 {
        return Err(Error::validation(
            "name",
            "VM name cannot exceed 100 characters",
        ));
    }

    if name
        .chars()
        .any(|c| matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
    {
        return Err(Error::validation(
            "name",
            "VM name contains invalid characters",
        ));
    }

    Ok(())
}

/// Builder for [`VmSpec`] with required field enforcement.
#[derive(Debug, Default)]
pub struct VmSpecBuilder {
    name: Option<String>,
    generation: Option<Generation>,
    memory_mb: Option<u64>,
    processor_count: Option<u32>,
    notes: Option<String>,
}

impl VmSpecBuilder {
    /// Set VM name (required).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set generation (defaults to Gen2).
    pub fn generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn memory(mut self, memory: MemoryMB) -> Self {
        self.memory_mb = Some(memory.as_mb());
        self
    }

    /// Set startup memory in MB (required, min 32, max 12 TB).
    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn memory_gb(mut self, gb: u64) -> Self {
        self.memory_mb = Some(gb.saturating_mul(1024));
        self
    }

    pub fn processors(mut self, count: ProcessorCount) -> Self {
        self.processor_count = Some(count.get());
        self
    }

    /// Set number of virtual processors (required, 1-240).
    pub fn processor_count(mut self, count: u32) -> Self {
        self.processor_count = Some(count);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Build and validate the spec.
    pub fn build(self) -> Result<VmSpec> {
        let spec = VmSpec {
            name: self.name.ok_or(Error::MissingRequired("name"))?,
            generation: self.generation.unwrap_or_default(),
            memory: MemoryMB::parse(
                "memory",
                self.memory_mb.ok_or(Error::MissingRequired("memory"))?,
            )?,
            processor_count: ProcessorCount::parse(
                "processor_count",
                self.processor_count
                    .ok_or(Error::MissingRequired("processor_count"))?,
            )?,
            notes: self.notes,
        };

        spec.validate()?;
        Ok(spec)
    }
}

/// Storage controller type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerKind {
    Ide,
    Scsi,
}

impl ControllerKind {
    /// `ResourceSubType` of the controller's allocation settings.
    pub fn subtype(&self) -> &'static str {
        match self {
            ControllerKind::Ide => "Microsoft:Hyper-V:Emulated IDE Controller",
            ControllerKind::Scsi => "Microsoft:Hyper-V:Synthetic SCSI Controller",
        }
    }

    /// Highest drive location on one controller.
    pub fn max_location(&self) -> u32 {
        match self {
            ControllerKind::Ide => 1,
            ControllerKind::Scsi => 63,
        }
    }

    /// Boot controller type for a generation (Gen2 has no IDE).
    pub fn default_for(generation: Generation) -> Self {
        match generation {
            Generation::Gen1 => ControllerKind::Ide,
            Generation::Gen2 => ControllerKind::Scsi,
        }
    }
}

/// A virtual hard disk to attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskSpec {
    pub path: String,
    /// Controller type; `None` picks the generation default.
    pub controller: Option<ControllerKind>,
    pub controller_number: u32,
    /// Location on the controller; `None` picks the first free slot.
    pub location: Option<u32>,
}

impl DiskSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            controller: None,
            controller_number: 0,
            location: None,
        }
    }

    pub fn on_controller(mut self, kind: ControllerKind, number: u32) -> Self {
        self.controller = Some(kind);
        self.controller_number = number;
        self
    }

    pub fn at_location(mut self, location: u32) -> Self {
        self.location = Some(location);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let path = self.path.trim();
        if path.is_empty() {
            return Err(Error::validation("path", "disk path cannot be empty"));
        }
        let lower = path.to_ascii_lowercase();
        if !(lower.ends_with(".vhd") || lower.ends_with(".vhdx")) {
            return Err(Error::validation(
                "path",
                format!("'{}' is not a .vhd or .vhdx file", path),
            ));
        }
        if let (Some(kind), Some(location)) = (self.controller, self.location) {
            if location > kind.max_location() {
                return Err(Error::validation(
                    "location",
                    format!(
                        "location {} exceeds the {:?} controller maximum of {}",
                        location,
                        kind,
                        kind.max_location()
                    ),
                ));
            }
        }
        if self.controller == Some(ControllerKind::Ide) && self.controller_number > 1 {
            return Err(Error::validation(
                "controller_number",
                "IDE controller number must be 0 or 1",
            ));
        }
        Ok(())
    }
}

/// A network adapter to add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NicSpec {
    pub name: String,
    /// Static MAC as 12 hex digits; `None` lets the host assign one.
    pub static_mac: Option<String>,
    /// Virtual switch to connect to.
    pub switch: Option<String>,
}

impl NicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            static_mac: None,
            switch: None,
        }
    }

    /// Static MAC address; separators (`:`/`-`) are stripped.
    pub fn with_static_mac(mut self, mac: impl AsRef<str>) -> Self {
        let mac: String = mac
            .as_ref()
            .chars()
            .filter(|c| !matches!(c, ':' | '-'))
            .collect();
        self.static_mac = Some(mac.to_ascii_uppercase());
        self
    }

    pub fn connected_to(mut self, switch: impl Into<String>) -> Self {
        self.switch = Some(switch.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name", "adapter name cannot be empty"));
        }
        if let Some(ref mac) = self.static_mac {
            if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::validation(
                    "static_mac",
                    format!("'{}' is not a 12-digit MAC address", mac),
                ));
            }
        }
        if let Some(ref switch) = self.switch {
            if switch.trim().is_empty() {
                return Err(Error::validation("switch", "switch name cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Guest IP configuration for one adapter, applied through the KVP
/// integration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestIpSpec {
    /// `ElementName` of the VM's network adapter.
    pub adapter: String,
    pub dhcp: bool,
    pub addresses: Vec<String>,
    /// One per address: a dotted mask or a prefix length.
    pub subnets: Vec<String>,
    pub gateways: Vec<String>,
    pub dns_servers: Vec<String>,
}

impl GuestIpSpec {
    pub fn dhcp(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            dhcp: true,
            addresses: Vec::new(),
            subnets: Vec::new(),
            gateways: Vec::new(),
            dns_servers: Vec::new(),
        }
    }

    /// Static addressing; add at least one [`address`](Self::address).
    pub fn fixed(adapter: impl Into<String>) -> Self {
        Self {
            dhcp: false,
            ..Self::dhcp(adapter)
        }
    }

    pub fn address(mut self, ip: impl Into<String>, subnet: impl Into<String>) -> Self {
        self.addresses.push(ip.into());
        self.subnets.push(subnet.into());
        self
    }

    pub fn gateway(mut self, ip: impl Into<String>) -> Self {
        self.gateways.push(ip.into());
        self
    }

    pub fn dns(mut self, ip: impl Into<String>) -> Self {
        self.dns_servers.push(ip.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.adapter.trim().is_empty() {
            return Err(Error::validation("adapter", "adapter name cannot be empty"));
        }
        if self.dhcp {
            if !(self.addresses.is_empty() && self.gateways.is_empty()) {
                return Err(Error::validation(
                    "addresses",
                    "a DHCP configuration cannot carry static addresses or gateways",
                ));
            }
        } else if self.addresses.is_empty() {
            return Err(Error::validation(
                "addresses",
                "a static configuration needs at least one address",
            ));
        }

        if self.addresses.len() != self.subnets.len() {
            return Err(Error::validation("subnets", "every address needs exactly one subnet"));
        }
        for (address, subnet) in self.addresses.iter().zip(&self.subnets) {
            let ip = parse_ip("addresses", address)?;
            if !valid_subnet(ip, subnet.trim()) {
                return Err(Error::validation(
                    "subnets",
                    format!("'{}' is not a valid subnet for {}", subnet, ip),
                ));
            }
        }
        for gateway in &self.gateways {
            parse_ip("gateways", gateway)?;
        }
        for server in &self.dns_servers {
            parse_ip("dns_servers", server)?;
        }
        Ok(())
    }
}

fn parse_ip(field: &'static str, text: &str) -> Result<IpAddr> {
    text.trim()
        .parse()
        .map_err(|_| Error::validation(field, format!("'{}' is not an IP address", text)))
}

fn valid_subnet(ip: IpAddr, subnet: &str) -> bool {
    if let Ok(prefix) = subnet.parse::<u8>() {
        return prefix <= if ip.is_ipv4() { 32 } else { 128 };
    }
    match (ip, subnet.parse::<Ipv4Addr>()) {
        (IpAddr::V4(_), Ok(mask)) => {
            let bits = u32::from(mask);
            bits.leading_ones() + bits.trailing_zeros() == 32
        }
        _ => false,
    }
}

/// Serial port of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComPort {
    Com1,
    Com2,
}

impl ComPort {
    /// `ElementName` of the port's `Msvm_SerialPortSettingData`.
    pub fn element_name(&self) -> &'static str {
        match self {
            ComPort::Com1 => "COM 1",
            ComPort::Com2 => "COM 2",
        }
    }
}

impl fmt::Display for ComPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_name())
    }
}

/// Named pipe a serial port connects to, e.g. `\\.\pipe\vm-console`.
pub(crate) fn validate_pipe(pipe: &str) -> Result<()> {
    let lower = pipe.trim().to_ascii_lowercase();
    let valid = lower
        .strip_prefix(r"\\")
        .and_then(|rest| rest.split_once('\\'))
        .and_then(|(server, rest)| rest.strip_prefix(r"pipe\").map(|name| (server, name)))
        .is_some_and(|(server, name)| !server.is_empty() && !name.is_empty());
    if !valid {
        return Err(Error::validation(
            "pipe",
            format!(r"'{}' is not a named pipe path (\\server\pipe\name)", pipe),
        ));
    }
    Ok(())
}

/// Virtual hard disk file format, from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VhdFormat {
    Vhd,
    Vhdx,
}

impl VhdFormat {
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.trim().to_ascii_lowercase();
        if lower.ends_with(".vhdx") {
            Some(VhdFormat::Vhdx)
        } else if lower.ends_with(".vhd") {
            Some(VhdFormat::Vhd)
        } else {
            None
        }
    }

    /// `Msvm_VirtualHardDiskSettingData.Format`.
    pub(crate) fn value(&self) -> u16 {
        match self {
            VhdFormat::Vhd => 2,
            VhdFormat::Vhdx => 3,
        }
    }
}

/// How a disk is cloned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloneMode {
    /// Thin child disk that records changes against the source.
    Differencing,
    /// Independent dynamically expanding copy.
    Full,
}

/// Clone of a virtual hard disk file on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskClone {
    pub source: String,
    pub destination: String,
    pub mode: CloneMode,
}

impl DiskClone {
    pub fn differencing(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mode: CloneMode::Differencing,
        }
    }

    pub fn full(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            mode: CloneMode::Full,
            ..Self::differencing(source, destination)
        }
    }

    /// Format of the destination file.
    pub fn format(&self) -> Result<VhdFormat> {
        VhdFormat::from_path(&self.destination).ok_or_else(|| {
            Error::validation(
                "destination",
                format!("'{}' is not a .vhd or .vhdx file", self.destination),
            )
        })
    }

    pub fn validate(&self) -> Result<()> {
        let source = VhdFormat::from_path(&self.source).ok_or_else(|| {
            Error::validation("source", format!("'{}' is not a .vhd or .vhdx file", self.source))
        })?;
        let destination = self.format()?;
        if self.source.trim().eq_ignore_ascii_case(self.destination.trim()) {
            return Err(Error::validation(
                "destination",
                "clone destination must differ from the source",
            ));
        }
        if self.mode == CloneMode::Differencing && source != destination {
            return Err(Error::validation(
                "destination",
                "a differencing disk must use its parent's format",
            ));
        }
        Ok(())
    }
}

/// Dynamic memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DynamicMemory {
    pub minimum: MemoryMB,
    pub maximum: MemoryMB,
}

/// Memory configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySpec {
    pub startup: MemoryMB,
    pub dynamic: Option<DynamicMemory>,
}

impl MemorySpec {
    /// Static memory.
    pub fn fixed(mb: u64) -> Result<Self> {
        Ok(Self {
            startup: MemoryMB::parse("startup", mb)?,
            dynamic: None,
        })
    }

    /// Dynamic memory with a startup value inside `[min_mb, max_mb]`.
    pub fn dynamic(startup_mb: u64, min_mb: u64, max_mb: u64) -> Result<Self> {
        let startup = MemoryMB::parse("startup", startup_mb)?;
        let minimum = MemoryMB::parse("dynamic_memory_min", min_mb)?;
        let maximum = MemoryMB::parse("dynamic_memory_max", max_mb)?;

        if minimum > startup {
            return Err(Error::validation(
                "dynamic_memory_min",
                "Minimum memory cannot exceed startup memory",
            ));
        }
        if maximum < startup {
            return Err(Error::validation(
                "dynamic_memory_max",
                "Maximum memory cannot be less than startup memory",
            ));
        }

        Ok(Self {
            startup,
            dynamic: Some(DynamicMemory { minimum, maximum }),
        })
    }

    /// Values for `VirtualQuantity`, `Reservation` and `Limit`.
    pub(crate) fn quantities(&self) -> (u64, u64, u64) {
        match self.dynamic {
            Some(range) => (
                self.startup.as_mb(),
                range.minimum.as_mb(),
                range.maximum.as_mb(),
            ),
            None => (
                self.startup.as_mb(),
                self.startup.as_mb(),
                self.startup.as_mb(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_builder() -> VmSpecBuilder {
        VmSpec::builder()
            .name("TestVM")
            .generation(Generation::Gen2)
            .memory_mb(4096)
            .processor_count(2)
    }

    #[test]
    fn test_builder_valid_spec() {
        let spec = valid_builder().notes("built by tests").build().unwrap();
        assert_eq!(spec.name, "TestVM");
        assert_eq!(spec.generation, Generation::Gen2);
        assert_eq!(spec.memory.as_mb(), 4096);
        assert_eq!(spec.processor_count.get(), 2);
        assert_eq!(spec.notes.as_deref(), Some("built by tests"));
    }

    #[test]
    fn test_builder_defaults_to_gen2() {
        let spec = VmSpec::builder()
            .name("NoGen")
            .memory(MemoryMB::gb_1())
            .processors(ProcessorCount::one())
            .build()
            .unwrap();
        assert_eq!(spec.generation, Generation::Gen2);
    }

    #[test]
    fn test_builder_missing_fields() {
        assert!(matches!(
            VmSpec::builder().memory_mb(1024).processor_count(1).build(),
            Err(Error::MissingRequired("name"))
        ));
        assert!(matches!(
            VmSpec::builder().name("x").processor_count(1).build(),
            Err(Error::MissingRequired("memory"))
        ));
        assert!(matches!(
            VmSpec::builder().name("x").memory_mb(1024).build(),
            Err(Error::MissingRequired("processor_count"))
        ));
    }

    #[test]
    fn test_builder_out_of_range_values() {
        assert!(matches!(
            valid_builder().memory_mb(16).build(),
            Err(Error::Validation { field: "memory", .. })
        ));
        assert!(matches!(
            valid_builder().processor_count(0).build(),
            Err(Error::Validation { field: "processor_count", .. })
        ));
        assert!(matches!(
            valid_builder().processor_count(241).build(),
            Err(Error::Validation { field: "processor_count", .. })
        ));
    }

    #[test]
    fn test_name_rules() {
        assert!(valid_builder().name("").build().is_err());
        assert!(valid_builder().name("a".repeat(101)).build().is_err());
        for bad in ["a/b", "a:b", "a*b", "a?b", "a|b", "a\"b"] {
            assert!(
                matches!(
                    valid_builder().name(bad).build(),
                    Err(Error::Validation { field: "name", .. })
                ),
                "{} should be rejected",
                bad
            );
        }
        assert!(valid_builder().name("web-01 (prod)").build().is_ok());
    }

    #[test]
    fn test_disk_spec_validation() {
        assert!(DiskSpec::new(r"D:\vm\os.vhdx").validate().is_ok());
        assert!(DiskSpec::new(r"D:\vm\OS.VHD").validate().is_ok());
        assert!(DiskSpec::new("").validate().is_err());
        assert!(DiskSpec::new(r"D:\vm\os.iso").validate().is_err());
        assert!(DiskSpec::new(r"D:\vm\os.vhdx")
            .on_controller(ControllerKind::Ide, 0)
            .at_location(2)
            .validate()
            .is_err());
        assert!(DiskSpec::new(r"D:\vm\os.vhdx")
            .on_controller(ControllerKind::Scsi, 0)
            .at_location(63)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_controller_defaults() {
        assert_eq!(ControllerKind::default_for(Generation::Gen1), ControllerKind::Ide);
        assert_eq!(ControllerKind::default_for(Generation::Gen2), ControllerKind::Scsi);
    }

    #[test]
    fn test_nic_spec() {
        let nic = NicSpec::new("eth0")
            .with_static_mac("00:15:5d:01:02:03")
            .connected_to("External");
        assert_eq!(nic.static_mac.as_deref(), Some("00155D010203"));
        assert!(nic.validate().is_ok());
        assert!(NicSpec::new("eth0").with_static_mac("xyz").validate().is_err());
        assert!(NicSpec::new(" ").validate().is_err());
    }

    #[test]
    fn test_memory_spec() {
        let fixed = MemorySpec::fixed(2048).unwrap();
        assert_eq!(fixed.quantities(), (2048, 2048, 2048));

        let dynamic = MemorySpec::dynamic(2048, 512, 8192).unwrap();
        assert_eq!(dynamic.quantities(), (2048, 512, 8192));

        assert!(matches!(
            MemorySpec::dynamic(2048, 4096, 8192),
            Err(Error::Validation { field: "dynamic_memory_min", .. })
        ));
        assert!(matches!(
            MemorySpec::dynamic(2048, 512, 1024),
            Err(Error::Validation { field: "dynamic_memory_max", .. })
        ));
        assert!(MemorySpec::fixed(8).is_err());
    }

    #[test]
    fn test_guest_ip_spec() {
        let spec = GuestIpSpec::fixed("eth0")
            .address("10.0.0.5", "255.255.255.0")
            .address("fd00::5", "64")
            .gateway("10.0.0.1")
            .dns("10.0.0.2");
        assert!(spec.validate().is_ok());
        assert!(GuestIpSpec::dhcp("eth0").dns("1.1.1.1").validate().is_ok());

        assert!(matches!(
            GuestIpSpec::fixed("eth0").validate(),
            Err(Error::Validation { field: "addresses", .. })
        ));
        assert!(matches!(
            GuestIpSpec::dhcp("eth0").address("10.0.0.5", "24").validate(),
            Err(Error::Validation { field: "addresses", .. })
        ));
        assert!(matches!(
            GuestIpSpec::fixed("eth0").address("10.0.0.300", "24").validate(),
            Err(Error::Validation { field: "addresses", .. })
        ));
        assert!(matches!(
            GuestIpSpec::fixed("eth0").address("10.0.0.5", "255.0.255.0").validate(),
            Err(Error::Validation { field: "subnets", .. })
        ));
        assert!(matches!(
            GuestIpSpec::fixed("eth0").address("10.0.0.5", "33").validate(),
            Err(Error::Validation { field: "subnets", .. })
        ));
        assert!(matches!(
            GuestIpSpec::fixed("eth0").address("10.0.0.5", "24").gateway("router").validate(),
            Err(Error::Validation { field: "gateways", .. })
        ));
    }

    #[test]
    fn test_pipe_paths() {
        assert!(validate_pipe(r"\\.\pipe\web-01-com1").is_ok());
        assert!(validate_pipe(r"\\build-host\PIPE\console").is_ok());
        assert!(validate_pipe(r"C:\pipe\console").is_err());
        assert!(validate_pipe(r"\\.\pipe\").is_err());
        assert!(validate_pipe("").is_err());
        assert_eq!(ComPort::Com2.to_string(), "COM 2");
    }

    #[test]
    fn test_disk_clone_validation() {
        let clone = DiskClone::differencing(r"D:\base\os.vhdx", r"D:\vm\web-01.vhdx");
        assert!(clone.validate().is_ok());
        assert_eq!(clone.format().unwrap(), VhdFormat::Vhdx);

        assert!(DiskClone::differencing(r"D:\base\os.vhdx", r"D:\vm\web-01.vhd").validate().is_err());
        assert!(DiskClone::full(r"D:\base\os.vhdx", r"D:\vm\web-01.vhd").validate().is_ok());
        assert!(DiskClone::full(r"D:\base\os.vhdx", r"d:\BASE\os.vhdx").validate().is_err());
        assert!(DiskClone::full(r"D:\base\os.iso", r"D:\vm\os.vhdx").validate().is_err());
    }
}
