//! Strong types for VM configuration values.
//!
//! These types provide construction-time validation and clear semantics for
//! VM configuration parameters.

use core::fmt;
use core::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Memory size in megabytes.
///
/// Validates that memory is within Hyper-V limits:
/// - Minimum: 32 MB
/// - Maximum: 12 TB (12,582,912 MB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MemoryMB(u64);

impl MemoryMB {
    /// Minimum memory in MB (32 MB).
    pub const MIN: u64 = 32;
    /// Maximum memory in MB (12 TB).
    pub const MAX: u64 = 12 * 1024 * 1024; // 12 TB in MB

    /// Returns `None` if outside valid range (32 MB - 12 TB).
    pub fn new(mb: u64) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&mb) {
            Some(Self(mb))
        } else {
            None
        }
    }

    pub fn from_gb(gb: u64) -> Option<Self> {
        Self::new(gb.saturating_mul(1024))
    }

    pub(crate) fn parse(field: &'static str, mb: u64) -> Result<Self> {
        Self::new(mb).ok_or_else(|| {
            Error::validation(
                field,
                format!(
                    "{} MB is outside the supported range ({}-{} MB)",
                    mb,
                    Self::MIN,
                    Self::MAX
                ),
            )
        })
    }

    pub fn as_mb(&self) -> u64 {
        self.0
    }

    /// Get value in gigabytes (rounded down).
    pub fn as_gb(&self) -> u64 {
        self.0 / 1024
    }

    pub const fn gb_1() -> Self {
        Self(1024)
    }
    pub const fn gb_2() -> Self {
        Self(2048)
    }
    pub const fn gb_4() -> Self {
        Self(4096)
    }
}

impl fmt::Display for MemoryMB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} GB", self.0 / 1024)
        } else {
            write!(f, "{} MB", self.0)
        }
    }
}

/// Virtual processor count.
///
/// Validates that processor count is within Hyper-V limits:
/// - Minimum: 1
/// - Maximum: 240
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProcessorCount(u32);

impl ProcessorCount {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 240;

    /// Returns `None` if outside valid range (1-240).
    pub fn new(count: u32) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&count) {
            Some(Self(count))
        } else {
            None
        }
    }

    pub(crate) fn parse(field: &'static str, count: u32) -> Result<Self> {
        Self::new(count).ok_or_else(|| {
            Error::validation(
                field,
                format!(
                    "{} processors is outside the supported range ({}-{})",
                    count,
                    Self::MIN,
                    Self::MAX
                ),
            )
        })
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub const fn one() -> Self {
        Self(1)
    }
    pub const fn two() -> Self {
        Self(2)
    }
}

impl fmt::Display for ProcessorCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vCPU{}", self.0, if self.0 == 1 { "" } else { "s" })
    }
}

/// Provider identity of a VM (`Msvm_ComputerSystem.Name`), a GUID.
///
/// Stored in the provider's canonical form: uppercase, hyphenated, no braces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    pub fn parse(value: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(value.trim())
            .map_err(|_| Error::InvalidVmId(value.to_string()))?;
        Ok(Self::from_uuid(uuid))
    }

    pub(crate) fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.hyphenated().to_string().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VmId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_mb_bounds() {
        assert!(MemoryMB::new(31).is_none());
        assert_eq!(MemoryMB::new(32).map(|m| m.as_mb()), Some(32));
        assert!(MemoryMB::new(MemoryMB::MAX).is_some());
        assert!(MemoryMB::new(MemoryMB::MAX + 1).is_none());
        assert_eq!(MemoryMB::from_gb(2), Some(MemoryMB::gb_2()));
        assert_eq!(MemoryMB::gb_4().to_string(), "4 GB");
        assert_eq!(MemoryMB::new(1536).unwrap().to_string(), "1536 MB");
    }

    #[test]
    fn test_memory_parse_reports_field() {
        let err = MemoryMB::parse("memory", 16).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "memory", .. }));
    }

    #[test]
    fn test_processor_count_bounds() {
        assert!(ProcessorCount::new(0).is_none());
        assert_eq!(ProcessorCount::new(240).map(|p| p.get()), Some(240));
        assert!(ProcessorCount::new(241).is_none());
        assert_eq!(ProcessorCount::one().to_string(), "1 vCPU");
        assert_eq!(ProcessorCount::two().to_string(), "2 vCPUs");
    }

    #[test]
    fn test_vm_id_normalizes() {
        let id = VmId::parse("{5c8f5e1a-0b3d-4f7e-9a61-2d7f3b1c9e40}").unwrap();
        assert_eq!(id.as_str(), "5C8F5E1A-0B3D-4F7E-9A61-2D7F3B1C9E40");
        assert_eq!(id, "5c8f5e1a-0b3d-4f7e-9a61-2d7f3b1c9e40".parse().unwrap());
    }

    #[test]
    fn test_vm_id_rejects_non_guid() {
        assert!(matches!(
            VmId::parse("web-01"),
            Err(Error::InvalidVmId(ref s)) if s == "web-01"
        ));
    }
}
