//! Feature Derivation
//! Turns a register snapshot into the normalized feature vector.
//!
//! The vector is one byte per flag (0 = absent, 1 = present) in `Feature` order,
//! zero-padded to a whole number of 64-bit words. Assumed-feature masks produced at
//! build time use exactly this layout, so the order of `feature_table!` below is a
//! wire contract: append only, never reorder.

use crate::core::classify::{self, MicroArch, Vendor};
use crate::cpuid::registers::XFeatures;
use crate::cpuid::{leaf, Snapshot};
use bytemuck::{Pod, Zeroable};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

macro_rules! feature_table {
    ($($variant:ident => $name:literal,)+) => {
        /// A recognized processor capability.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Feature {
            $($variant,)+
        }

        impl Feature {
            /// Every feature, in layout order.
            pub const ALL: &'static [Feature] = &[$(Feature::$variant,)+];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Feature::$variant => $name,)+
                }
            }
        }
    };
}

feature_table! {
    Cx8 => "CX8",
    Cmov => "CMOV",
    Fxsr => "FXSR",
    Ht => "HT",
    Mmx => "MMX",
    Amd3dnowPrefetch => "AMD_3DNOW_PREFETCH",
    Sse => "SSE",
    Sse2 => "SSE2",
    Sse3 => "SSE3",
    Ssse3 => "SSSE3",
    Sse4a => "SSE4A",
    Sse4_1 => "SSE4_1",
    Sse4_2 => "SSE4_2",
    Popcnt => "POPCNT",
    Lzcnt => "LZCNT",
    Tsc => "TSC",
    TscInv => "TSCINV",
    TscInvBit => "TSCINV_BIT",
    Avx => "AVX",
    Avx2 => "AVX2",
    Aes => "AES",
    Erms => "ERMS",
    Clmul => "CLMUL",
    Bmi1 => "BMI1",
    Bmi2 => "BMI2",
    Rtm => "RTM",
    Adx => "ADX",
    Avx512F => "AVX512F",
    Avx512Dq => "AVX512DQ",
    Avx512Pf => "AVX512PF",
    Avx512Er => "AVX512ER",
    Avx512Cd => "AVX512CD",
    Avx512Bw => "AVX512BW",
    Avx512Vl => "AVX512VL",
    Sha => "SHA",
    Fma => "FMA",
    VzeroUpper => "VZEROUPPER",
    Avx512Vpopcntdq => "AVX512_VPOPCNTDQ",
    Avx512Vpclmulqdq => "AVX512_VPCLMULQDQ",
    Avx512Vaes => "AVX512_VAES",
    Avx512Vnni => "AVX512_VNNI",
    Flush => "FLUSH",
    FlushOpt => "FLUSHOPT",
    Clwb => "CLWB",
    Avx512Vbmi2 => "AVX512_VBMI2",
    Avx512Vbmi => "AVX512_VBMI",
    Hv => "HV",
    Serialize => "SERIALIZE",
    Rdtscp => "RDTSCP",
    Rdpid => "RDPID",
    Fsrm => "FSRM",
    Gfni => "GFNI",
    Avx512Bitalg => "AVX512_BITALG",
    F16c => "F16C",
    Pku => "PKU",
    Ospke => "OSPKE",
    CetIbt => "CET_IBT",
    CetSs => "CET_SS",
    Avx512Ifma => "AVX512_IFMA",
    AvxIfma => "AVX_IFMA",
    ApxF => "APX_F",
}

/// Number of real flags in the layout.
pub const FEATURE_COUNT: usize = Feature::ALL.len();
/// Byte size of the layout, rounded up to whole 64-bit words.
pub const PADDED_LEN: usize = (FEATURE_COUNT + 7) / 8 * 8;

const _: () = assert!(PADDED_LEN == 64);
const _: () = assert!(PADDED_LEN % std::mem::size_of::<u64>() == 0);

impl Feature {
    /// Byte offset of this flag in the layout.
    pub const fn offset(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown CPU feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownFeature(wanted.to_string()))
    }
}

impl Serialize for Feature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// The host's capabilities, one byte per `Feature`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FeatureVector {
    flags: [u8; PADDED_LEN],
}

impl FeatureVector {
    /// All flags absent.
    pub fn empty() -> Self {
        Self::zeroed()
    }

    pub fn from_features<I: IntoIterator<Item = Feature>>(features: I) -> Self {
        let mut v = Self::empty();
        for f in features {
            v.insert(f);
        }
        v
    }

    /// Every flag present.
    pub fn all() -> Self {
        Self::from_features(Feature::ALL.iter().copied())
    }

    /// Reads a vector back from its layout bytes.
    ///
    /// Returns `None` if the length is wrong or a byte holds anything but 0 or 1
    /// (padding must be zero).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PADDED_LEN {
            return None;
        }
        let v: Self = bytemuck::pod_read_unaligned(bytes);
        let flags_ok = v.flags[..FEATURE_COUNT].iter().all(|&b| b <= 1);
        let padding_ok = v.flags[FEATURE_COUNT..].iter().all(|&b| b == 0);
        (flags_ok && padding_ok).then_some(v)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.flags[feature.offset()] != 0
    }

    pub(crate) fn insert(&mut self, feature: Feature) {
        self.flags[feature.offset()] = 1;
    }

    pub(crate) fn remove(&mut self, feature: Feature) {
        self.flags[feature.offset()] = 0;
    }

    /// Present features, in layout order.
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.iter().copied().filter(move |&f| self.has(f))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Features present in both vectors.
    pub fn intersection(&self, other: &Self) -> Self {
        Self::from_features(self.iter().filter(|&f| other.has(f)))
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Feature::name)).finish()
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FEATURE_COUNT))?;
        for &f in Feature::ALL {
            map.serialize_entry(f.name(), &self.has(f))?;
        }
        map.end()
    }
}

/// Flags known to be mis-reported, keyed by microarchitecture.
///
/// This is a maintained list, not a rule. Add entries as errata turn up.
const UNRELIABLE_FEATURES: &[(MicroArch, &[Feature])] = &[(
    MicroArch::Knights,
    &[
        Feature::VzeroUpper,
        Feature::Avx512Bw,
        Feature::Avx512Vl,
        Feature::Avx512Dq,
        Feature::Avx512Vnni,
        Feature::Avx512Vaes,
        Feature::Avx512Vpopcntdq,
        Feature::Avx512Vpclmulqdq,
        Feature::Avx512Vbmi,
        Feature::Avx512Vbmi2,
        Feature::Clwb,
        Feature::FlushOpt,
        Feature::Gfni,
        Feature::Avx512Bitalg,
        Feature::Avx512Ifma,
    ],
)];

/// The override list for one microarchitecture (empty if it has none).
pub fn unreliable_features(arch: MicroArch) -> &'static [Feature] {
    UNRELIABLE_FEATURES
        .iter()
        .find(|(a, _)| *a == arch)
        .map(|(_, list)| *list)
        .unwrap_or(&[])
}

/// Derives the feature vector for a snapshot.
///
/// A processor without leaf 1 reports nothing, whatever the extended leaves say.
pub fn derive(snapshot: &Snapshot) -> FeatureVector {
    if snapshot.std_max_function < leaf::BASIC_FEATURES {
        debug!(std_max = snapshot.std_max_function, "no basic feature leaf");
        return FeatureVector::empty();
    }

    let mut features = derive_raw(snapshot);

    let arch = MicroArch::of(snapshot);
    for &f in unreliable_features(arch) {
        if features.has(f) {
            warn!(feature = f.name(), microarch = ?arch, "suppressing feature reported by cpuid");
            features.remove(f);
        }
    }

    debug!(count = features.count(), "derived host features");
    features
}

fn derive_raw(s: &Snapshot) -> FeatureVector {
    let mut f = FeatureVector::empty();
    let vendor = Vendor::of(s);
    let std1_ecx = s.std_cpuid1.ecx;
    let std1_edx = s.std_cpuid1.edx;
    let sef_ebx = s.sef_cpuid7.ebx;
    let sef_ecx = s.sef_cpuid7.ecx;
    let sef_edx = s.sef_cpuid7.edx;
    let ext1_ecx = s.ext_cpuid1.ecx;
    let ext1_edx = s.ext_cpuid1.edx;
    let xcr0 = s.xcr0();

    let mut set = |feature: Feature, present: bool| {
        if present {
            f.insert(feature);
        }
    };

    set(Feature::Cx8, std1_edx.cmpxchg8());
    set(Feature::Cmov, std1_edx.cmov());
    set(Feature::Flush, std1_edx.clflush());
    set(Feature::Fxsr, std1_edx.fxsr() || (vendor.is_amd_family() && ext1_edx.fxsr()));
    // The raw HT bit is also set on plain multi-core parts.
    set(Feature::Ht, classify::threads_per_core(s) > 1);
    set(Feature::Mmx, std1_edx.mmx() || (vendor.is_amd_family() && ext1_edx.mmx()));
    set(Feature::Sse, std1_edx.sse());
    set(Feature::Sse2, std1_edx.sse2());
    set(Feature::Sse3, std1_ecx.sse3());
    set(Feature::Ssse3, std1_ecx.ssse3());
    set(Feature::Sse4_1, std1_ecx.sse4_1());
    set(Feature::Sse4_2, std1_ecx.sse4_2());
    set(Feature::Popcnt, std1_ecx.popcnt());

    let avx = std1_ecx.avx() && std1_ecx.osxsave() && xcr0.contains(XFeatures::AVX_STATE);
    if avx {
        set(Feature::Avx, true);
        set(Feature::VzeroUpper, true);
        set(Feature::F16c, std1_ecx.f16c());
        set(Feature::Avx2, sef_ebx.avx2());
        set(Feature::AvxIfma, s.sefsl1_cpuid7.eax.avx_ifma());

        if sef_ebx.avx512f() && xcr0.contains(XFeatures::AVX512_STATE) {
            set(Feature::Avx512F, true);
            set(Feature::Avx512Cd, sef_ebx.avx512cd());
            set(Feature::Avx512Dq, sef_ebx.avx512dq());
            set(Feature::Avx512Ifma, sef_ebx.avx512ifma());
            set(Feature::Avx512Pf, sef_ebx.avx512pf());
            set(Feature::Avx512Er, sef_ebx.avx512er());
            set(Feature::Avx512Bw, sef_ebx.avx512bw());
            set(Feature::Avx512Vl, sef_ebx.avx512vl());
            set(Feature::Avx512Vpopcntdq, sef_ecx.avx512_vpopcntdq());
            set(Feature::Avx512Vpclmulqdq, sef_ecx.avx512_vpclmulqdq());
            set(Feature::Avx512Vaes, sef_ecx.vaes());
            set(Feature::Gfni, sef_ecx.gfni());
            set(Feature::Avx512Vnni, sef_ecx.avx512_vnni());
            set(Feature::Avx512Bitalg, sef_ecx.avx512_bitalg());
            set(Feature::Avx512Vbmi, sef_ecx.avx512_vbmi());
            set(Feature::Avx512Vbmi2, sef_ecx.avx512_vbmi2());
        }
    }

    set(Feature::Hv, std1_ecx.hv());
    set(Feature::Bmi1, sef_ebx.bmi1());
    set(Feature::Tsc, std1_edx.tsc());
    set(Feature::TscInvBit, s.ext_cpuid7.edx.tsc_invariance());
    set(Feature::Aes, std1_ecx.aes());
    set(Feature::Erms, sef_ebx.erms());
    set(Feature::Fsrm, sef_edx.fast_short_rep_mov());
    set(Feature::Clmul, std1_ecx.clmul());
    set(Feature::Rtm, sef_ebx.rtm());
    set(Feature::Adx, sef_ebx.adx());
    set(Feature::Bmi2, sef_ebx.bmi2());
    set(Feature::Sha, sef_ebx.sha());
    set(Feature::Fma, std1_ecx.fma());
    set(Feature::FlushOpt, sef_ebx.clflushopt());
    set(Feature::Rdtscp, ext1_edx.rdtscp());
    set(Feature::Rdpid, sef_ecx.rdpid());
    set(Feature::ApxF, s.sefsl1_cpuid7.edx.apx_f() && xcr0.contains(XFeatures::APX_F));

    match vendor {
        Vendor::Amd | Vendor::Hygon => {
            set(Feature::Amd3dnowPrefetch, ext1_edx.tdnow() || ext1_ecx.prefetchw());
            set(Feature::Lzcnt, ext1_ecx.lzcnt());
            set(Feature::Sse4a, ext1_ecx.sse4a());
        }
        Vendor::Intel => {
            set(Feature::Lzcnt, ext1_ecx.lzcnt());
            set(Feature::Amd3dnowPrefetch, ext1_ecx.prefetchw());
            set(Feature::Clwb, sef_ebx.clwb());
            set(Feature::Serialize, sef_edx.serialize());
        }
        Vendor::Zx => {
            set(Feature::Lzcnt, ext1_ecx.lzcnt());
            set(Feature::Amd3dnowPrefetch, ext1_ecx.prefetchw());
        }
        Vendor::Unknown => {}
    }

    // Protection keys
    set(Feature::Pku, sef_ecx.pku());
    set(Feature::Ospke, sef_ecx.ospke());

    // Control-flow enforcement
    set(Feature::CetSs, sef_ecx.cet_ss());
    set(Feature::CetIbt, sef_edx.cet_ibt());

    // An invariant TSC is only trusted where counters are known to be synchronized
    // across sockets.
    let tsc_trusted = (vendor.is_amd_family() && !classify::is_amd_barcelona(s))
        || classify::is_intel_tsc_synched_at_init(s);
    set(Feature::TscInv, s.ext_cpuid7.edx.tsc_invariance() && tsc_trusted);

    f
}
