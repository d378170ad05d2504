//! Vendor & Topology Classification
//! Pure predicates over a captured snapshot.

use crate::cpuid::Snapshot;
use serde::Serialize;

/// First vendor dword (EBX of leaf 0).
pub mod signature {
    /// "Genu"
    pub const INTEL: u32 = 0x756E_6547;
    /// "Auth"
    pub const AMD: u32 = 0x6874_7541;
    /// "Hygo"
    pub const HYGON: u32 = 0x6F67_7948;
    /// "Cent" (CentaurHauls)
    pub const ZX_CENTAUR: u32 = 0x746E_6543;
    /// "  Sh" (  Shanghai  )
    pub const ZX_SHANGHAI: u32 = 0x6853_2020;
}

pub const CPU_FAMILY_INTEL_CORE: u32 = 0x06;
pub const CPU_FAMILY_AMD_11H: u32 = 0x11;
/// First family that reports threads per core in leaf 0x8000001E.
pub const CPU_FAMILY_AMD_ZEN: u32 = 0x17;

pub const CPU_MODEL_NEHALEM_EP: u32 = 0x1A;
pub const CPU_MODEL_WESTMERE_EP: u32 = 0x2C;
pub const CPU_MODEL_SANDYBRIDGE_EP: u32 = 0x2D;
pub const CPU_MODEL_IVYBRIDGE_EP: u32 = 0x3A;

const ATOM_MODELS: [u32; 3] = [0x36, 0x37, 0x4D];
const KNIGHTS_MODELS: [u32; 2] = [0x57, 0x85];
const TSC_SYNCHED_MODELS: [u32; 4] = [
    CPU_MODEL_NEHALEM_EP,
    CPU_MODEL_WESTMERE_EP,
    CPU_MODEL_SANDYBRIDGE_EP,
    CPU_MODEL_IVYBRIDGE_EP,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Vendor {
    Intel,
    Amd,
    Hygon,
    Zx,
    Unknown,
}

impl Vendor {
    pub fn of(snapshot: &Snapshot) -> Self {
        match snapshot.vendor[0] {
            signature::INTEL => Vendor::Intel,
            signature::AMD => Vendor::Amd,
            signature::HYGON => Vendor::Hygon,
            signature::ZX_CENTAUR | signature::ZX_SHANGHAI => Vendor::Zx,
            _ => Vendor::Unknown,
        }
    }

    /// AMD and Hygon share every feature-gating rule.
    pub fn is_amd_family(self) -> bool {
        matches!(self, Vendor::Amd | Vendor::Hygon)
    }
}

/// Microarchitecture families that carry their own rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MicroArch {
    /// Silvermont and Centerton.
    Atom,
    /// Xeon Phi.
    Knights,
    /// AMD family 11h.
    Barcelona,
    /// Any other Intel family 6 part.
    Core,
    Other,
}

impl MicroArch {
    pub fn of(snapshot: &Snapshot) -> Self {
        let vendor = Vendor::of(snapshot);
        if vendor == Vendor::Intel && is_knights_family(snapshot) {
            MicroArch::Knights
        } else if vendor == Vendor::Intel && is_atom_family(snapshot) {
            MicroArch::Atom
        } else if is_intel_family_core(snapshot) {
            MicroArch::Core
        } else if is_amd_barcelona(snapshot) {
            MicroArch::Barcelona
        } else {
            MicroArch::Other
        }
    }
}

pub fn extended_cpu_family(snapshot: &Snapshot) -> u32 {
    let sig = snapshot.std_cpuid1.eax;
    if sig.family() == 0xF {
        sig.family() + sig.ext_family()
    } else {
        sig.family()
    }
}

pub fn extended_cpu_model(snapshot: &Snapshot) -> u32 {
    let sig = snapshot.std_cpuid1.eax;
    sig.model() | (sig.ext_model() << 4)
}

pub fn is_atom_family(snapshot: &Snapshot) -> bool {
    extended_cpu_family(snapshot) == CPU_FAMILY_INTEL_CORE
        && ATOM_MODELS.contains(&extended_cpu_model(snapshot))
}

pub fn is_knights_family(snapshot: &Snapshot) -> bool {
    extended_cpu_family(snapshot) == CPU_FAMILY_INTEL_CORE
        && KNIGHTS_MODELS.contains(&extended_cpu_model(snapshot))
}

pub fn is_amd_barcelona(snapshot: &Snapshot) -> bool {
    Vendor::of(snapshot) == Vendor::Amd && extended_cpu_family(snapshot) == CPU_FAMILY_AMD_11H
}

pub fn is_intel_family_core(snapshot: &Snapshot) -> bool {
    Vendor::of(snapshot) == Vendor::Intel && extended_cpu_family(snapshot) == CPU_FAMILY_INTEL_CORE
}

/// Two-socket EP parts whose timestamp counters are synchronized at reset.
///
/// EX parts usually sit in larger systems and don't synchronize, so they are left out.
pub fn is_intel_tsc_synched_at_init(snapshot: &Snapshot) -> bool {
    is_intel_family_core(snapshot) && TSC_SYNCHED_MODELS.contains(&extended_cpu_model(snapshot))
}

/// Some CPUs report max leaf >= 0xB without filling in the topology leaf.
pub fn supports_processor_topology(snapshot: &Snapshot) -> bool {
    snapshot.std_max_function >= crate::cpuid::leaf::TOPOLOGY && snapshot.topology[0].is_valid()
}

fn topology_cores_per_cpu(snapshot: &Snapshot) -> u32 {
    let threads = snapshot.topology[0].ebx.logical_cpus();
    let per_package = snapshot.topology[1].ebx.logical_cpus();
    let ratio = if supports_processor_topology(snapshot) {
        per_package.checked_div(threads).unwrap_or(0)
    } else {
        0
    };
    if ratio == 0 {
        snapshot.dcp_cpuid4.eax.cores_per_cpu() + 1
    } else {
        ratio
    }
}

pub fn cores_per_cpu(snapshot: &Snapshot) -> u32 {
    let vendor = Vendor::of(snapshot);
    let result = match vendor {
        Vendor::Intel | Vendor::Zx => topology_cores_per_cpu(snapshot),
        Vendor::Amd | Vendor::Hygon => snapshot.ext_cpuid8.ecx.cores_per_cpu() + 1,
        Vendor::Unknown => 1,
    };
    result.max(1)
}

pub fn threads_per_core(snapshot: &Snapshot) -> u32 {
    let vendor = Vendor::of(snapshot);
    let result = if matches!(vendor, Vendor::Intel | Vendor::Zx) && supports_processor_topology(snapshot) {
        snapshot.topology[0].ebx.logical_cpus()
    } else if snapshot.std_cpuid1.edx.ht() {
        if extended_cpu_family(snapshot) >= CPU_FAMILY_AMD_ZEN {
            snapshot.ext_cpuid1e.ebx.threads_per_core() + 1
        } else {
            snapshot.std_cpuid1.ebx.threads_per_cpu() / cores_per_cpu(snapshot)
        }
    } else {
        1
    };
    result.max(1)
}
