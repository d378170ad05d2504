//! Register Snapshot
//! Raw `cpuid` output for every leaf feature detection and topology need.
//!
//! Nothing here interprets the bits beyond deciding which leaves exist.

pub mod registers;
pub mod source;

use registers::*;
use serde::{Deserialize, Serialize};
use source::{CpuidSource, HardwareCpuid};
use tracing::debug;

/// Leaf selectors.
pub mod leaf {
    pub const VENDOR: u32 = 0x0000_0000;
    pub const BASIC_FEATURES: u32 = 0x0000_0001;
    pub const CACHE_PARAMETERS: u32 = 0x0000_0004;
    pub const EXTENDED_FEATURES: u32 = 0x0000_0007;
    pub const TOPOLOGY: u32 = 0x0000_000B;
    pub const EXT_MAX: u32 = 0x8000_0000;
    pub const EXT_FEATURES: u32 = 0x8000_0001;
    pub const EXT_L1_CACHE: u32 = 0x8000_0005;
    pub const EXT_POWER_MANAGEMENT: u32 = 0x8000_0007;
    pub const EXT_ADDRESS_SIZES: u32 = 0x8000_0008;
    pub const EXT_COMPUTE_UNIT: u32 = 0x8000_001E;
}

/// Everything one detection pass read from the processor.
///
/// Leaves beyond the advertised maximum are never queried and stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub std_max_function: u32,
    /// Vendor string dwords as returned in EBX, ECX, EDX.
    pub vendor: [u32; 3],
    pub std_cpuid1: StdLeaf1,
    pub xcr0: u64,
    pub dcp_cpuid4: CacheLeaf,
    pub sef_cpuid7: ExtendedFeatures,
    pub sefsl1_cpuid7: ExtendedFeaturesSub1,
    /// Leaf 0xB sub-leaves 0 (threads), 1 (cores), 2 (package).
    pub topology: [TopologyLevel; 3],
    pub ext_max_function: u32,
    pub ext_cpuid1: ExtLeaf1,
    pub ext_cpuid5: ExtLeaf5,
    pub ext_cpuid7: ExtLeaf7,
    pub ext_cpuid8: ExtLeaf8,
    pub ext_cpuid1e: ExtLeaf1E,
}

impl Snapshot {
    /// The 12-character vendor identification, e.g. `GenuineIntel`.
    pub fn vendor_string(&self) -> String {
        let [ebx, ecx, edx] = self.vendor;
        let mut bytes = Vec::with_capacity(12);
        for dword in [ebx, edx, ecx] {
            bytes.extend_from_slice(&dword.to_le_bytes());
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn xcr0(&self) -> XFeatures {
        XFeatures::from_bits_retain(self.xcr0)
    }
}

/// Captures a snapshot of the processor the calling thread currently runs on.
///
/// The thread is not pinned. On hybrid parts the caller must make sure it cannot be
/// migrated mid-capture (see `core::runtime::capture_on_core`).
pub fn capture() -> Snapshot {
    capture_from(&HardwareCpuid)
}

pub fn capture_from<S: CpuidSource + ?Sized>(source: &S) -> Snapshot {
    let mut snap = Snapshot::default();

    let r = source.cpuid(leaf::VENDOR, 0);
    snap.std_max_function = r.eax;
    snap.vendor = [r.ebx, r.ecx, r.edx];
    let max_level = r.eax;

    if max_level >= leaf::BASIC_FEATURES {
        snap.std_cpuid1 = source.cpuid(leaf::BASIC_FEATURES, 0).into();

        let ecx = snap.std_cpuid1.ecx;
        if ecx.osxsave() && ecx.avx() {
            snap.xcr0 = source.xgetbv0();
        }
    }

    if max_level >= leaf::CACHE_PARAMETERS {
        let r = source.cpuid(leaf::CACHE_PARAMETERS, 0);
        // eax[4:0] == 0 means no cache at this index
        if r.eax & 0x1f != 0 {
            snap.dcp_cpuid4 = r.into();
        }
    }

    if max_level >= leaf::EXTENDED_FEATURES {
        snap.sef_cpuid7 = source.cpuid(leaf::EXTENDED_FEATURES, 0).into();
        snap.sefsl1_cpuid7 = source.cpuid(leaf::EXTENDED_FEATURES, 1).into();
    }

    if max_level >= leaf::TOPOLOGY {
        snap.topology[0] = source.cpuid(leaf::TOPOLOGY, 0).into();
        for level in 1..3 {
            let candidate = TopologyLevel::from(source.cpuid(leaf::TOPOLOGY, level));
            if candidate.is_valid() {
                snap.topology[level as usize] = candidate;
            }
        }
    }

    let ext_level = source.cpuid(leaf::EXT_MAX, 0).eax;
    snap.ext_max_function = ext_level;

    if ext_level >= leaf::EXT_FEATURES {
        snap.ext_cpuid1 = source.cpuid(leaf::EXT_FEATURES, 0).into();
    }
    if ext_level >= leaf::EXT_L1_CACHE {
        snap.ext_cpuid5 = source.cpuid(leaf::EXT_L1_CACHE, 0).into();
    }
    if ext_level >= leaf::EXT_POWER_MANAGEMENT {
        snap.ext_cpuid7 = source.cpuid(leaf::EXT_POWER_MANAGEMENT, 0).into();
    }
    if ext_level >= leaf::EXT_ADDRESS_SIZES {
        snap.ext_cpuid8 = source.cpuid(leaf::EXT_ADDRESS_SIZES, 0).into();
    }
    if ext_level >= leaf::EXT_COMPUTE_UNIT {
        snap.ext_cpuid1e = source.cpuid(leaf::EXT_COMPUTE_UNIT, 0).into();
    }

    debug!(
        vendor = %snap.vendor_string(),
        max_leaf = max_level,
        max_ext_leaf = ext_level,
        "captured cpuid snapshot"
    );

    snap
}

#[cfg(test)]
mod tests {
    use super::*;
    use source::RecordedCpuid;

    #[test]
    fn test_leaf0_only_queries_vendor_and_ext_max() {
        let source = RecordedCpuid::new().with_vendor(0, b"GenuineIntel");
        let snap = capture_from(&source);

        assert_eq!(source.queries(), vec![(leaf::VENDOR, 0), (leaf::EXT_MAX, 0)]);
        assert_eq!(snap.vendor_string(), "GenuineIntel");
        assert_eq!(snap.std_cpuid1, StdLeaf1::default());
    }

    #[test]
    fn test_queries_respect_advertised_bounds() {
        let source = RecordedCpuid::new()
            .with_vendor(7, b"AuthenticAMD")
            .with_leaf(leaf::EXT_MAX, 0, Registers::new(0x8000_0007, 0, 0, 0));
        capture_from(&source);

        for (l, _) in source.queries() {
            if l < leaf::EXT_MAX {
                assert!(l <= 7, "queried standard leaf {:#x} past max 7", l);
            } else {
                assert!(l <= 0x8000_0007, "queried extended leaf {:#x} past max", l);
            }
        }
        assert!(source.queries().contains(&(leaf::EXTENDED_FEATURES, 1)));
        assert!(!source.queries().iter().any(|&(l, _)| l == leaf::TOPOLOGY));
    }

    #[test]
    fn test_xcr0_read_only_with_osxsave_and_avx() {
        let avx_only = RecordedCpuid::new()
            .with_vendor(1, b"GenuineIntel")
            .with_leaf(1, 0, Registers::new(0, 0, 1 << 28, 0))
            .with_xcr0(0x7);
        assert_eq!(capture_from(&avx_only).xcr0, 0);

        let both = RecordedCpuid::new()
            .with_vendor(1, b"GenuineIntel")
            .with_leaf(1, 0, Registers::new(0, 0, (1 << 27) | (1 << 28), 0))
            .with_xcr0(0x7);
        assert_eq!(capture_from(&both).xcr0, 0x7);
    }

    #[test]
    fn test_invalid_topology_levels_are_dropped() {
        let source = RecordedCpuid::new()
            .with_vendor(0xB, b"GenuineIntel")
            .with_leaf(leaf::TOPOLOGY, 0, Registers::new(1, 2, 0x100, 0))
            .with_leaf(leaf::TOPOLOGY, 1, Registers::new(5, 16, 0x201, 0))
            // Package level present but both validity ranges zero.
            .with_leaf(leaf::TOPOLOGY, 2, Registers::new(0, 0, 0x2, 7));
        let snap = capture_from(&source);

        assert_eq!(snap.topology[0].ebx.logical_cpus(), 2);
        assert_eq!(snap.topology[1].ebx.logical_cpus(), 16);
        assert_eq!(snap.topology[2], TopologyLevel::default());
    }

    #[test]
    fn test_empty_cache_leaf_is_dropped() {
        let source = RecordedCpuid::new()
            .with_vendor(4, b"GenuineIntel")
            .with_leaf(leaf::CACHE_PARAMETERS, 0, Registers::new(0xFC00_0000, 1, 2, 3));
        let snap = capture_from(&source);
        assert_eq!(snap.dcp_cpuid4, CacheLeaf::default());
    }

    #[test]
    fn test_snapshot_json_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let source = RecordedCpuid::new()
            .with_vendor(1, b"HygonGenuine")
            .with_leaf(1, 0, Registers::new(0x0090_0F22, 0x0010_0800, 0x7ED8_320B, 0x178B_FBFF));
        let snap = capture_from(&source);

        let json = serde_json::to_string(&snap)?;
        let back: Snapshot = serde_json::from_str(&json)?;
        assert_eq!(back, snap);
        assert_eq!(back.vendor_string(), "HygonGenuine");
        Ok(())
    }
}
