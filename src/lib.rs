//! Host CPU feature detection and a fail-fast startup gate.
//!
//! `cpuid` → [`cpuid::Snapshot`] → [`core::features::derive`] → [`core::gate`].

pub mod core;
pub mod cpuid;
pub mod storage;

pub use crate::core::features::{Feature, FeatureVector};
pub use crate::core::gate::{check_compatibility, check_compatibility_or_abort, AssumedFeatures, GateError, Verdict};
pub use crate::core::hardware::capture_and_derive_features;
