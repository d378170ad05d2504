//! Register Views
//! Named accessors over raw `cpuid` output.
//!
//! Every view is a plain `u32` newtype. Sub-ranges are extracted with shift + mask,
//! so the raw value and its bit fields are always the same datum.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Raw output of a single `cpuid` query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl Registers {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

#[inline]
const fn field(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & ((1u32 << width) - 1)
}

#[inline]
const fn bit(value: u32, n: u32) -> bool {
    (value >> n) & 1 != 0
}

macro_rules! register_view {
    (
        $(#[$meta:meta])*
        $name:ident {
            $(flags { $($flag:ident = $bit:expr),* $(,)? })?
            $(fields { $($field:ident = ($shift:expr, $width:expr)),* $(,)? })?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub const fn value(self) -> u32 {
                self.0
            }
            $($(
                #[inline]
                pub const fn $flag(self) -> bool {
                    bit(self.0, $bit)
                }
            )*)?
            $($(
                #[inline]
                pub const fn $field(self) -> u32 {
                    field(self.0, $shift, $width)
                }
            )*)?
        }
    };
}

register_view! {
    /// CPUID.1:EAX, the processor signature.
    Signature {
        fields {
            stepping = (0, 4),
            model = (4, 4),
            family = (8, 4),
            proc_type = (12, 2),
            ext_model = (16, 4),
            ext_family = (20, 8),
        }
    }
}

register_view! {
    /// CPUID.1:EBX
    Cpuid1Ebx {
        fields {
            brand_id = (0, 8),
            clflush_size = (8, 8),
            threads_per_cpu = (16, 8),
            apic_id = (24, 8),
        }
    }
}

register_view! {
    /// CPUID.1:ECX
    Cpuid1Ecx {
        flags {
            sse3 = 0,
            clmul = 1,
            monitor = 3,
            vmx = 5,
            ssse3 = 9,
            fma = 12,
            cmpxchg16 = 13,
            sse4_1 = 19,
            sse4_2 = 20,
            x2apic = 21,
            movbe = 22,
            popcnt = 23,
            aes = 25,
            xsave = 26,
            osxsave = 27,
            avx = 28,
            f16c = 29,
            rdrand = 30,
            hv = 31,
        }
    }
}

register_view! {
    /// CPUID.1:EDX
    Cpuid1Edx {
        flags {
            fpu = 0,
            tsc = 4,
            msr = 5,
            cmpxchg8 = 8,
            cmov = 15,
            clflush = 19,
            mmx = 23,
            fxsr = 24,
            sse = 25,
            sse2 = 26,
            ht = 28,
        }
    }
}

register_view! {
    /// CPUID.4.0:EAX, deterministic cache parameters.
    Cpuid4Eax {
        fields {
            cache_type = (0, 5),
            cache_level = (5, 3),
            threads_per_cache = (14, 12),
            cores_per_cpu = (26, 6),
        }
    }
}

register_view! {
    /// CPUID.7.0:EBX
    Cpuid7Ebx {
        flags {
            fsgsbase = 0,
            bmi1 = 3,
            hle = 4,
            avx2 = 5,
            bmi2 = 8,
            erms = 9,
            rtm = 11,
            avx512f = 16,
            avx512dq = 17,
            rdseed = 18,
            adx = 19,
            avx512ifma = 21,
            clflushopt = 23,
            clwb = 24,
            avx512pf = 26,
            avx512er = 27,
            avx512cd = 28,
            sha = 29,
            avx512bw = 30,
            avx512vl = 31,
        }
    }
}

register_view! {
    /// CPUID.7.0:ECX
    Cpuid7Ecx {
        flags {
            prefetchwt1 = 0,
            avx512_vbmi = 1,
            umip = 2,
            pku = 3,
            ospke = 4,
            avx512_vbmi2 = 6,
            cet_ss = 7,
            gfni = 8,
            vaes = 9,
            avx512_vpclmulqdq = 10,
            avx512_vnni = 11,
            avx512_bitalg = 12,
            avx512_vpopcntdq = 14,
            rdpid = 22,
        }
    }
}

register_view! {
    /// CPUID.7.0:EDX
    Cpuid7Edx {
        flags {
            fast_short_rep_mov = 4,
            serialize = 14,
            hybrid = 15,
            cet_ibt = 20,
        }
    }
}

register_view! {
    /// CPUID.7.1:EAX
    Cpuid7Sub1Eax {
        flags {
            avx_vnni = 4,
            avx_ifma = 23,
        }
    }
}

register_view! {
    /// CPUID.7.1:EDX
    Cpuid7Sub1Edx {
        flags {
            apx_f = 21,
        }
    }
}

register_view! {
    /// CPUID.B.n:EBX, logical processors at this topology level.
    TopologyEbx {
        fields {
            logical_cpus = (0, 16),
        }
    }
}

register_view! {
    /// CPUID.80000001:ECX
    ExtCpuid1Ecx {
        flags {
            lahf_sahf = 0,
            cmp_legacy = 1,
            svm = 2,
            lzcnt = 5,
            sse4a = 6,
            misalignsse = 7,
            prefetchw = 8,
        }
    }
}

register_view! {
    /// CPUID.80000001:EDX
    ExtCpuid1Edx {
        flags {
            nx = 20,
            mmx = 23,
            fxsr = 24,
            rdtscp = 27,
            long_mode = 29,
            tdnow2 = 30,
            tdnow = 31,
        }
    }
}

register_view! {
    /// CPUID.80000005:ECX/EDX, L1 data and instruction cache descriptors (AMD).
    L1CacheDescriptor {
        fields {
            line_size = (0, 8),
            lines_per_tag = (8, 8),
            associativity = (16, 8),
            size_kb = (24, 8),
        }
    }
}

register_view! {
    /// CPUID.80000007:EDX, advanced power management.
    ExtCpuid7Edx {
        flags {
            tsc_invariance = 8,
        }
    }
}

register_view! {
    /// CPUID.80000008:ECX
    ExtCpuid8Ecx {
        fields {
            cores_per_cpu = (0, 8),
            apic_id_size = (12, 4),
        }
    }
}

register_view! {
    /// CPUID.8000001E:EBX, AMD compute unit identifiers.
    ExtCpuid1EEbx {
        fields {
            compute_unit_id = (0, 8),
            threads_per_core = (8, 8),
        }
    }
}

bitflags! {
    /// XCR0 state components enabled by the OS.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XFeatures: u64 {
        const X87 = 1 << 0;
        const SSE = 1 << 1;
        const YMM = 1 << 2;
        const OPMASK = 1 << 5;
        const ZMM_HI256 = 1 << 6;
        const HI16_ZMM = 1 << 7;
        const PKRU = 1 << 9;
        const APX_F = 1 << 19;
    }
}

impl XFeatures {
    /// State needed before any AVX instruction may be issued.
    pub const AVX_STATE: Self = Self::SSE.union(Self::YMM);
    /// State needed before any AVX-512 instruction may be issued.
    pub const AVX512_STATE: Self = Self::OPMASK.union(Self::ZMM_HI256).union(Self::HI16_ZMM);
}

// Leaf groupings as stored in the snapshot.

/// Leaf 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdLeaf1 {
    pub eax: Signature,
    pub ebx: Cpuid1Ebx,
    pub ecx: Cpuid1Ecx,
    pub edx: Cpuid1Edx,
}

impl From<Registers> for StdLeaf1 {
    fn from(r: Registers) -> Self {
        Self { eax: Signature(r.eax), ebx: Cpuid1Ebx(r.ebx), ecx: Cpuid1Ecx(r.ecx), edx: Cpuid1Edx(r.edx) }
    }
}

/// Leaf 4, sub-leaf 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLeaf {
    pub eax: Cpuid4Eax,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl From<Registers> for CacheLeaf {
    fn from(r: Registers) -> Self {
        Self { eax: Cpuid4Eax(r.eax), ebx: r.ebx, ecx: r.ecx, edx: r.edx }
    }
}

/// Leaf 7, sub-leaf 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedFeatures {
    pub eax: u32,
    pub ebx: Cpuid7Ebx,
    pub ecx: Cpuid7Ecx,
    pub edx: Cpuid7Edx,
}

impl From<Registers> for ExtendedFeatures {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: Cpuid7Ebx(r.ebx), ecx: Cpuid7Ecx(r.ecx), edx: Cpuid7Edx(r.edx) }
    }
}

/// Leaf 7, sub-leaf 1. Only EAX and EDX carry bits we read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedFeaturesSub1 {
    pub eax: Cpuid7Sub1Eax,
    pub edx: Cpuid7Sub1Edx,
}

impl From<Registers> for ExtendedFeaturesSub1 {
    fn from(r: Registers) -> Self {
        Self { eax: Cpuid7Sub1Eax(r.eax), edx: Cpuid7Sub1Edx(r.edx) }
    }
}

/// One level of leaf 0xB (thread, core, package).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyLevel {
    pub eax: u32,
    pub ebx: TopologyEbx,
    pub ecx: u32,
    pub edx: u32,
}

impl TopologyLevel {
    /// eax[4:0] and ebx[15:0] both zero marks an invalid level.
    pub const fn is_valid(&self) -> bool {
        (self.eax & 0x1f) != 0 || self.ebx.logical_cpus() != 0
    }
}

impl From<Registers> for TopologyLevel {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: TopologyEbx(r.ebx), ecx: r.ecx, edx: r.edx }
    }
}

/// Leaf 0x80000001.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtLeaf1 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: ExtCpuid1Ecx,
    pub edx: ExtCpuid1Edx,
}

impl From<Registers> for ExtLeaf1 {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: r.ebx, ecx: ExtCpuid1Ecx(r.ecx), edx: ExtCpuid1Edx(r.edx) }
    }
}

/// Leaf 0x80000005.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtLeaf5 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: L1CacheDescriptor,
    pub edx: L1CacheDescriptor,
}

impl From<Registers> for ExtLeaf5 {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: r.ebx, ecx: L1CacheDescriptor(r.ecx), edx: L1CacheDescriptor(r.edx) }
    }
}

/// Leaf 0x80000007.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtLeaf7 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: ExtCpuid7Edx,
}

impl From<Registers> for ExtLeaf7 {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: r.ebx, ecx: r.ecx, edx: ExtCpuid7Edx(r.edx) }
    }
}

/// Leaf 0x80000008.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtLeaf8 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: ExtCpuid8Ecx,
    pub edx: u32,
}

impl From<Registers> for ExtLeaf8 {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: r.ebx, ecx: ExtCpuid8Ecx(r.ecx), edx: r.edx }
    }
}

/// Leaf 0x8000001E.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtLeaf1E {
    pub eax: u32,
    pub ebx: ExtCpuid1EEbx,
    pub ecx: u32,
    pub edx: u32,
}

impl From<Registers> for ExtLeaf1E {
    fn from(r: Registers) -> Self {
        Self { eax: r.eax, ebx: ExtCpuid1EEbx(r.ebx), ecx: r.ecx, edx: r.edx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_fields() {
        // Skylake-SP: family 6, model 5, ext model 5, stepping 4
        let sig = Signature(0x0005_0654);
        assert_eq!(sig.stepping(), 4);
        assert_eq!(sig.model(), 5);
        assert_eq!(sig.family(), 6);
        assert_eq!(sig.ext_model(), 5);
        assert_eq!(sig.ext_family(), 0);
    }

    #[test]
    fn test_flag_accessors() {
        let ecx = Cpuid1Ecx((1 << 27) | (1 << 28));
        assert!(ecx.osxsave());
        assert!(ecx.avx());
        assert!(!ecx.aes());

        let ebx = Cpuid7Ebx(1 << 31);
        assert!(ebx.avx512vl());
        assert!(!ebx.avx512f());
    }

    #[test]
    fn test_topology_level_validity() {
        assert!(!TopologyLevel::default().is_valid());
        // Only the upper half of EBX set: still invalid.
        assert!(!TopologyLevel::from(Registers::new(0, 0xFFFF_0000, 0x100, 0)).is_valid());
        assert!(TopologyLevel::from(Registers::new(1, 2, 0x100, 0)).is_valid());
        assert!(TopologyLevel::from(Registers::new(0, 2, 0, 0)).is_valid());
    }

    #[test]
    fn test_xcr0_state_masks() {
        let xcr0 = XFeatures::from_bits_retain(0xE7);
        assert!(xcr0.contains(XFeatures::AVX_STATE));
        assert!(xcr0.contains(XFeatures::AVX512_STATE));
        assert!(!XFeatures::from_bits_retain(0x7).contains(XFeatures::AVX512_STATE));
    }
}
