//! Hardware Detection Module
//! Queries the CPU at runtime and bundles everything derived from one snapshot.

use crate::core::classify::{self, MicroArch, Vendor};
use crate::core::features::{self, FeatureVector};
use crate::cpuid::source::CpuidSource;
use crate::cpuid::{self, Snapshot};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HostCpu {
    pub vendor: Vendor,
    pub vendor_string: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    pub microarch: MicroArch,
    pub threads_per_core: u32,
    pub cores_per_cpu: u32,
    pub features: FeatureVector,
    pub snapshot: Snapshot,
}

impl HostCpu {
    pub fn detect() -> Self {
        Self::from_snapshot(cpuid::capture())
    }

    pub fn detect_with<S: CpuidSource + ?Sized>(source: &S) -> Self {
        Self::from_snapshot(cpuid::capture_from(source))
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            vendor: Vendor::of(&snapshot),
            vendor_string: snapshot.vendor_string(),
            family: classify::extended_cpu_family(&snapshot),
            model: classify::extended_cpu_model(&snapshot),
            stepping: snapshot.std_cpuid1.eax.stepping(),
            microarch: MicroArch::of(&snapshot),
            threads_per_core: classify::threads_per_core(&snapshot),
            cores_per_cpu: classify::cores_per_cpu(&snapshot),
            features: features::derive(&snapshot),
            snapshot,
        }
    }
}

/// Captures the current processor and derives its feature vector.
pub fn capture_and_derive_features() -> FeatureVector {
    features::derive(&cpuid::capture())
}
