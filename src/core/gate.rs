//! Compatibility Gate
//! Checks, once per process, that the host has every feature a build depends on.

use crate::core::diagnostics::Diagnostics;
use crate::core::features::{self, Feature, FeatureVector, FEATURE_COUNT, PADDED_LEN};
use crate::cpuid::source::{CpuidSource, HardwareCpuid};
use crate::cpuid;
use bytemuck::{Pod, Zeroable};
use std::io::Write;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{error, info};

const WORD: usize = std::mem::size_of::<u64>();
const WORDS: usize = PADDED_LEN / WORD;

/// Byte value meaning "the build tolerates absence of this feature".
pub const TOLERATED: u8 = 0xFF;
/// Byte value meaning "the build requires this feature". OR-ed with a present host
/// flag (1) it gives `TOLERATED`.
pub const REQUIRED: u8 = !1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    #[error("Assumed feature mask is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Compatible = 0,
    Incompatible = 1,
}

/// The build-time feature assumptions, in the `FeatureVector` layout.
///
/// Each bit set to 1 tolerates a 0 in the host vector at that position.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AssumedFeatures {
    bits: [u8; PADDED_LEN],
}

impl AssumedFeatures {
    /// Takes a caller-supplied buffer as is. Only the length is checked.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GateError> {
        if bytes.len() != PADDED_LEN {
            return Err(GateError::SizeMismatch { expected: PADDED_LEN, actual: bytes.len() });
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Depends on nothing.
    pub fn tolerate_all() -> Self {
        let mut bits = [0u8; PADDED_LEN];
        bits[..FEATURE_COUNT].fill(TOLERATED);
        Self { bits }
    }

    /// Depends on exactly `required`.
    pub fn requiring(required: &[Feature]) -> Self {
        let mut mask = Self::tolerate_all();
        for &f in required {
            mask.bits[f.offset()] = REQUIRED;
        }
        mask
    }

    /// Depends on everything `host` has.
    pub fn from_host(host: &FeatureVector) -> Self {
        let required: Vec<Feature> = host.iter().collect();
        Self::requiring(&required)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Whether a host lacking `feature` fails this mask.
    pub fn requires(&self, feature: Feature) -> bool {
        self.bits[feature.offset()] != TOLERATED
    }

    /// Features this mask depends on.
    pub fn required(&self) -> Vec<Feature> {
        Feature::ALL.iter().copied().filter(|&f| self.requires(f)).collect()
    }
}

impl std::fmt::Debug for AssumedFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssumedFeatures").field("required", &self.required()).finish()
    }
}

/// Bits of word `index` that belong to padding rather than a flag.
fn padding_mask(index: usize) -> u64 {
    let mut bytes = [0u8; WORD];
    for (i, b) in bytes.iter_mut().enumerate() {
        if index * WORD + i >= FEATURE_COUNT {
            *b = 0xFF;
        }
    }
    u64::from_ne_bytes(bytes)
}

/// Compares a host vector against a mask, one 64-bit word at a time.
///
/// Each word passes when `assumed | host` is all ones; padding bits always pass.
pub fn compare(host: &FeatureVector, assumed: &AssumedFeatures) -> Verdict {
    let host = host.as_bytes().chunks_exact(WORD);
    let assumed = assumed.as_bytes().chunks_exact(WORD);
    debug_assert_eq!(host.len(), WORDS);

    for (index, (h, a)) in host.zip(assumed).enumerate() {
        let h: u64 = bytemuck::pod_read_unaligned(h);
        let a: u64 = bytemuck::pod_read_unaligned(a);
        if (a | h | padding_mask(index)) != u64::MAX {
            return Verdict::Incompatible;
        }
    }
    Verdict::Compatible
}

/// The process-wide verdict cell.
///
/// Set at most once, by whichever caller evaluates first; read many times. Racing
/// callers block until the first evaluation is published.
pub struct CompatibilityGate {
    verdict: OnceLock<Verdict>,
}

impl CompatibilityGate {
    pub const fn new() -> Self {
        Self { verdict: OnceLock::new() }
    }

    /// The cached verdict, or `None` while unchecked.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict.get().copied()
    }

    pub fn evaluate(&self, assumed: &[u8]) -> Result<Verdict, GateError> {
        self.evaluate_with(&HardwareCpuid, assumed)
    }

    /// Evaluates against `source` on first use, then returns the cached verdict.
    ///
    /// The mask length is checked on every call.
    pub fn evaluate_with<S: CpuidSource + ?Sized>(&self, source: &S, assumed: &[u8]) -> Result<Verdict, GateError> {
        let assumed = AssumedFeatures::from_slice(assumed)?;
        let verdict = *self.verdict.get_or_init(|| {
            let host = features::derive(&cpuid::capture_from(source));
            compare(&host, &assumed)
        });
        Ok(verdict)
    }

    /// Like `evaluate_with`, but an incompatible host is an error carrying the
    /// message to report.
    pub fn require_with<S: CpuidSource + ?Sized>(
        &self,
        source: &S,
        assumed: &[u8],
        message: &str,
    ) -> Result<(), GateFailure> {
        match self.evaluate_with(source, assumed)? {
            Verdict::Compatible => {
                info!("host CPU provides every feature this build assumes");
                Ok(())
            }
            Verdict::Incompatible => {
                // The verdict is cached; the missing list is only for the report.
                let host = features::derive(&cpuid::capture_from(source));
                let missing = AssumedFeatures::from_slice(assumed)
                    .map(|mask| Diagnostics::missing_features(&host, &mask))
                    .unwrap_or_default();
                Err(GateFailure::Incompatible { message: message.to_string(), missing })
            }
        }
    }

    /// Returns only if the host is compatible. Otherwise writes `message` to stderr
    /// and exits with status 1.
    pub fn evaluate_or_abort(&self, assumed: &[u8], message: &str) {
        if let Err(failure) = self.require_with(&HardwareCpuid, assumed, message) {
            abort(&failure);
        }
    }
}

impl Default for CompatibilityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the fail-fast gate refused to continue.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateFailure {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("{message}")]
    Incompatible { message: String, missing: Vec<Feature> },
}

fn abort(failure: &GateFailure) -> ! {
    if let GateFailure::Incompatible { missing, .. } = failure {
        let names: Vec<&str> = missing.iter().map(|f| f.name()).collect();
        error!(missing = ?names, "host CPU is missing features this build depends on");
    } else {
        error!(%failure, "CPU feature check could not run");
    }
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", failure);
    let _ = stderr.flush();
    std::process::exit(1);
}

static GATE: CompatibilityGate = CompatibilityGate::new();

/// Checks the host against `assumed` once per process and caches the verdict.
pub fn check_compatibility(assumed: &[u8]) -> Result<Verdict, GateError> {
    GATE.evaluate(assumed)
}

/// Fail-fast startup check: returns only if the host is compatible.
pub fn check_compatibility_or_abort(assumed: &[u8], message: &str) {
    GATE.evaluate_or_abort(assumed, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuid::registers::Registers;
    use crate::cpuid::source::RecordedCpuid;

    fn without(missing: Feature) -> FeatureVector {
        FeatureVector::from_features(Feature::ALL.iter().copied().filter(|&f| f != missing))
    }

    /// A Westmere-era Intel part: SSE through SSE4.2, AES, CLMUL, POPCNT, no AVX.
    fn westmere() -> RecordedCpuid {
        let ecx = (1 << 0) | (1 << 1) | (1 << 9) | (1 << 19) | (1 << 20) | (1 << 23) | (1 << 25);
        let edx = (1 << 4) | (1 << 8) | (1 << 15) | (1 << 19) | (1 << 23) | (1 << 24) | (1 << 25) | (1 << 26);
        RecordedCpuid::new()
            .with_vendor(0xB, b"GenuineIntel")
            .with_leaf(1, 0, Registers::new(0x0002_06C2, 0, ecx, edx))
    }

    #[test]
    fn test_tolerate_all_accepts_any_host() {
        let mask = AssumedFeatures::tolerate_all();
        assert_eq!(compare(&FeatureVector::empty(), &mask), Verdict::Compatible);
        assert_eq!(compare(&FeatureVector::all(), &mask), Verdict::Compatible);
    }

    #[test]
    fn test_zero_mask_rejects_empty_host() {
        let mask = AssumedFeatures::zeroed();
        assert_eq!(compare(&FeatureVector::empty(), &mask), Verdict::Incompatible);
    }

    #[test]
    fn test_single_required_feature() {
        let mask = AssumedFeatures::requiring(&[Feature::Aes]);
        assert_eq!(mask.required(), vec![Feature::Aes]);
        assert_eq!(compare(&without(Feature::Aes), &mask), Verdict::Incompatible);
        assert_eq!(compare(&FeatureVector::all(), &mask), Verdict::Compatible);
        assert_eq!(compare(&FeatureVector::from_features([Feature::Aes]), &mask), Verdict::Compatible);
    }

    #[test]
    fn test_one_cleared_bit_in_raw_mask() {
        // Hand-built buffer: all ones except bit 0 of the AES byte.
        let mut raw = [0xFFu8; PADDED_LEN];
        raw[Feature::Aes.offset()] &= !1;
        let mask = AssumedFeatures::from_slice(&raw).expect("correct size");
        assert!(mask.requires(Feature::Aes));
        assert!(!mask.requires(Feature::Avx));
        assert_eq!(compare(&without(Feature::Aes), &mask), Verdict::Incompatible);
        assert_eq!(compare(&FeatureVector::all(), &mask), Verdict::Compatible);
    }

    #[test]
    fn test_last_flag_in_padded_word() {
        let mask = AssumedFeatures::requiring(&[Feature::ApxF]);
        assert_eq!(compare(&without(Feature::ApxF), &mask), Verdict::Incompatible);
        assert_eq!(compare(&FeatureVector::from_features([Feature::ApxF]), &mask), Verdict::Compatible);
    }

    #[test]
    fn test_self_compatibility_through_layout() {
        let source = westmere();
        let host = features::derive(&cpuid::capture_from(&source));
        let reread = FeatureVector::from_bytes(host.as_bytes()).expect("valid layout");

        assert_eq!(compare(&reread, &AssumedFeatures::tolerate_all()), Verdict::Compatible);
        assert_eq!(compare(&reread, &AssumedFeatures::from_host(&host)), Verdict::Compatible);
    }

    #[test]
    fn test_size_mismatch() {
        let gate = CompatibilityGate::new();
        let short = [0xFFu8; PADDED_LEN - 8];
        assert_eq!(
            gate.evaluate_with(&westmere(), &short),
            Err(GateError::SizeMismatch { expected: PADDED_LEN, actual: PADDED_LEN - 8 })
        );
        // A rejected call leaves the gate unchecked.
        assert_eq!(gate.verdict(), None);
    }

    #[test]
    fn test_verdict_is_cached() {
        let gate = CompatibilityGate::new();
        let source = westmere();
        let avx = AssumedFeatures::requiring(&[Feature::Avx]);

        assert_eq!(gate.evaluate_with(&source, avx.as_bytes()), Ok(Verdict::Incompatible));
        let queries_after_first = source.queries().len();

        let nothing = AssumedFeatures::tolerate_all();
        assert_eq!(gate.evaluate_with(&source, nothing.as_bytes()), Ok(Verdict::Incompatible));
        assert_eq!(gate.evaluate_with(&source, nothing.as_bytes()), Ok(Verdict::Incompatible));
        assert_eq!(source.queries().len(), queries_after_first, "cached verdict recomputed");
        assert_eq!(gate.verdict(), Some(Verdict::Incompatible));
        assert_eq!(Verdict::Incompatible as u8, 1);
    }

    #[test]
    fn test_concurrent_first_evaluation() {
        let gate = CompatibilityGate::new();
        let aes = AssumedFeatures::requiring(&[Feature::Aes]);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let source = westmere();
                    assert_eq!(gate.evaluate_with(&source, aes.as_bytes()), Ok(Verdict::Compatible));
                });
            }
        });
        assert_eq!(gate.verdict(), Some(Verdict::Compatible));
    }

    #[test]
    fn test_process_wide_gate() {
        // The only test touching the global cell.
        let nothing = AssumedFeatures::tolerate_all();
        assert_eq!(check_compatibility(nothing.as_bytes()), Ok(Verdict::Compatible));

        let everything = AssumedFeatures::zeroed();
        assert_eq!(check_compatibility(everything.as_bytes()), Ok(Verdict::Compatible));
        assert!(matches!(check_compatibility(&[0xFF; 3]), Err(GateError::SizeMismatch { actual: 3, .. })));

        // Already compatible, so this returns instead of exiting.
        check_compatibility_or_abort(everything.as_bytes(), "unreachable");
    }

    #[test]
    fn test_require_reports_missing_features() {
        let gate = CompatibilityGate::new();
        let mask = AssumedFeatures::requiring(&[Feature::Aes, Feature::Avx2, Feature::Sse4_2, Feature::Bmi2]);

        let failure = gate.require_with(&westmere(), mask.as_bytes(), "needs Haswell").unwrap_err();
        assert_eq!(
            failure,
            GateFailure::Incompatible {
                message: "needs Haswell".to_string(),
                missing: vec![Feature::Avx2, Feature::Bmi2],
            }
        );
        assert_eq!(failure.to_string(), "needs Haswell");
    }
}
