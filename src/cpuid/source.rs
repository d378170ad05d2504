use crate::cpuid::registers::Registers;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Anything that can answer `cpuid` and `xgetbv(0)` queries.
///
/// The snapshot code only talks to this trait, so recorded register dumps can stand
/// in for the physical processor.
pub trait CpuidSource {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers;

    /// Reads XCR0. Only called after CPUID.1:ECX reports OSXSAVE.
    fn xgetbv0(&self) -> u64;
}

/// The processor the current thread runs on.
///
/// On targets without `cpuid` every query answers zero, which derives an all-false
/// feature vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareCpuid;

#[cfg(target_arch = "x86")]
use std::arch::x86 as arch;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64 as arch;

impl CpuidSource for HardwareCpuid {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers {
        // SAFETY: every processor rustc targets for x86/x86_64 implements cpuid.
        #[allow(unused_unsafe)]
        let r = unsafe { arch::__cpuid_count(leaf, subleaf) };
        Registers::new(r.eax, r.ebx, r.ecx, r.edx)
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn cpuid(&self, _leaf: u32, _subleaf: u32) -> Registers {
        Registers::default()
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn xgetbv0(&self) -> u64 {
        // SAFETY: callers only get here once CPUID.1:ECX.OSXSAVE is set, which
        // guarantees xgetbv is enabled.
        unsafe { read_xcr0() }
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn xgetbv0(&self) -> u64 {
        0
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[target_feature(enable = "xsave")]
unsafe fn read_xcr0() -> u64 {
    arch::_xgetbv(0)
}

/// A canned set of `cpuid` answers.
///
/// Leaves that were never recorded answer zero. Every query is logged so callers can
/// check which leaves a capture touched.
///
/// Serializes as `{"leaves": [{"leaf", "subleaf", "registers"}, ...], "xcr0"}`; the
/// query log is not part of the recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedCpuid {
    #[serde(with = "leaf_list")]
    leaves: BTreeMap<(u32, u32), Registers>,
    #[serde(default)]
    xcr0: u64,
    #[serde(skip)]
    queries: RefCell<Vec<(u32, u32)>>,
}

/// JSON object keys must be strings, so the leaf map goes over the wire as a list.
mod leaf_list {
    use super::Registers;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct RecordedLeaf {
        leaf: u32,
        #[serde(default)]
        subleaf: u32,
        registers: Registers,
    }

    pub fn serialize<S: Serializer>(leaves: &BTreeMap<(u32, u32), Registers>, serializer: S) -> Result<S::Ok, S::Error> {
        leaves
            .iter()
            .map(|(&(leaf, subleaf), &registers)| RecordedLeaf { leaf, subleaf, registers })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<(u32, u32), Registers>, D::Error> {
        let list = Vec::<RecordedLeaf>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|l| ((l.leaf, l.subleaf), l.registers)).collect())
    }
}

impl RecordedCpuid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf 0 with the given maximum standard leaf and 12-byte vendor string.
    pub fn with_vendor(self, max_leaf: u32, vendor: &[u8; 12]) -> Self {
        let dword = |i: usize| u32::from_le_bytes([vendor[i], vendor[i + 1], vendor[i + 2], vendor[i + 3]]);
        // The vendor string is laid out EBX, EDX, ECX.
        self.with_leaf(0, 0, Registers::new(max_leaf, dword(0), dword(8), dword(4)))
    }

    pub fn with_leaf(mut self, leaf: u32, subleaf: u32, registers: Registers) -> Self {
        self.leaves.insert((leaf, subleaf), registers);
        self
    }

    pub fn with_xcr0(mut self, xcr0: u64) -> Self {
        self.xcr0 = xcr0;
        self
    }

    /// Every (leaf, subleaf) queried so far, in order.
    pub fn queries(&self) -> Vec<(u32, u32)> {
        self.queries.borrow().clone()
    }
}

impl CpuidSource for RecordedCpuid {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers {
        self.queries.borrow_mut().push((leaf, subleaf));
        self.leaves.get(&(leaf, subleaf)).copied().unwrap_or_default()
    }

    fn xgetbv0(&self) -> u64 {
        self.xcr0
    }
}
