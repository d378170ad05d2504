use crate::core::features::FeatureVector;
use crate::core::hardware::HostCpu;
use core_affinity::CoreId;
use tracing::{debug, warn};

/// Per-core detection.
///
/// `cpuid` answers for whichever core the thread happens to run on. On hybrid parts
/// the cores disagree (topology leaves, sometimes feature bits), so these helpers run
/// detection on a thread pinned to one core at a time.
pub struct RuntimeConfig;

impl RuntimeConfig {
    /// Logical core IDs this process may run on.
    pub fn core_ids() -> Vec<CoreId> {
        core_affinity::get_core_ids().unwrap_or_default()
    }
}

/// Detects on a fresh thread pinned to the core the OS calls `core_id`.
///
/// Core IDs are the ones `core_affinity` reports (the same values
/// `capture_all_cores` returns), not positions in the allowed-core list. The caller's
/// own affinity is untouched. Returns `None` if this process may not run on that core
/// or the thread could not be pinned.
pub fn capture_on_core(core_id: usize) -> Option<HostCpu> {
    let core = RuntimeConfig::core_ids().into_iter().find(|c| c.id == core_id)?;
    std::thread::scope(|s| s.spawn(move || detect_pinned(core)).join().ok().flatten())
}

/// Detects on every allowed core, one pinned thread each.
///
/// Each entry carries the OS core ID it ran on. Cores that could not be pinned are
/// left out.
pub fn capture_all_cores() -> Vec<(usize, HostCpu)> {
    let cores = RuntimeConfig::core_ids();
    let results: Vec<(usize, HostCpu)> = std::thread::scope(|s| {
        let handles: Vec<_> = cores
            .iter()
            .map(|&core| s.spawn(move || detect_pinned(core).map(|cpu| (core.id, cpu))))
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok().flatten()).collect()
    });
    debug!(cores = results.len(), "captured per-core features");
    results
}

fn detect_pinned(core: CoreId) -> Option<HostCpu> {
    if !core_affinity::set_for_current(core) {
        warn!(core = core.id, "could not pin detection thread");
        return None;
    }
    Some(HostCpu::detect())
}

/// Features every listed core has. Empty input yields an empty vector.
pub fn common_features<'a, I: IntoIterator<Item = &'a FeatureVector>>(vectors: I) -> FeatureVector {
    let mut iter = vectors.into_iter();
    let Some(first) = iter.next() else {
        return FeatureVector::empty();
    };
    iter.fold(*first, |acc, v| acc.intersection(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::Feature;

    #[test]
    fn test_common_features() {
        let p_core = FeatureVector::from_features([Feature::Avx2, Feature::Ht, Feature::Aes]);
        let e_core = FeatureVector::from_features([Feature::Avx2, Feature::Aes]);

        let common = common_features([&p_core, &e_core]);
        assert_eq!(common, FeatureVector::from_features([Feature::Avx2, Feature::Aes]));
        assert!(common_features(std::iter::empty()).is_empty());
        assert_eq!(common_features([&p_core]), p_core);
    }

    #[test]
    fn test_capture_on_missing_core() {
        assert!(capture_on_core(usize::MAX).is_none());
    }

    #[test]
    fn test_all_cores_report_os_ids() {
        let per_core = capture_all_cores();
        if per_core.is_empty() {
            println!("Skipping per-core test (affinity not available)");
            return;
        }
        let allowed: Vec<usize> = RuntimeConfig::core_ids().iter().map(|c| c.id).collect();
        for (id, _) in &per_core {
            assert!(allowed.contains(id), "core {} not in the allowed set", id);
        }

        let (first_id, _) = per_core[0];
        let single = capture_on_core(first_id).expect("allowed core should be pinnable");
        assert_eq!(single.vendor, per_core[0].1.vendor);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_all_cores_share_x86_64_baseline() {
        let per_core = capture_all_cores();
        if per_core.is_empty() {
            println!("Skipping per-core test (affinity not available)");
            return;
        }
        // SSE and SSE2 are architectural on x86_64.
        let common = common_features(per_core.iter().map(|(_, cpu)| &cpu.features));
        for f in [Feature::Sse, Feature::Sse2, Feature::Fxsr, Feature::Cx8] {
            assert!(common.has(f), "{} missing from the common set", f);
        }
    }
}
