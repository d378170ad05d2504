use crate::core::features::{Feature, FeatureVector};
use crate::core::gate::{AssumedFeatures, TOLERATED};

#[derive(Debug, PartialEq, Eq)]
pub enum HostStatus {
    Capable,
    /// The host lacks these required features.
    Lacking(Vec<Feature>),
}

pub struct Diagnostics;

impl Diagnostics {
    /// Lists, in layout order, every flag whose byte fails `assumed | host == 0xFF`.
    pub fn missing_features(host: &FeatureVector, assumed: &AssumedFeatures) -> Vec<Feature> {
        let host = host.as_bytes();
        let assumed = assumed.as_bytes();
        Feature::ALL
            .iter()
            .copied()
            .filter(|f| host[f.offset()] | assumed[f.offset()] != TOLERATED)
            .collect()
    }

    /// Per-feature health check of a host against a build's assumptions.
    pub fn check_host(host: &FeatureVector, assumed: &AssumedFeatures) -> HostStatus {
        let missing = Self::missing_features(host, assumed);
        if missing.is_empty() {
            HostStatus::Capable
        } else {
            HostStatus::Lacking(missing)
        }
    }

    /// One line for logs, e.g. `missing: AVX2, BMI2`.
    pub fn describe(status: &HostStatus) -> String {
        match status {
            HostStatus::Capable => "host provides every assumed feature".to_string(),
            HostStatus::Lacking(missing) => {
                let names: Vec<&str> = missing.iter().map(|f| f.name()).collect();
                format!("missing: {}", names.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::{compare, Verdict};

    #[test]
    fn test_check_host() {
        let host = FeatureVector::from_features([Feature::Sse2, Feature::Aes, Feature::Popcnt]);

        let ok = AssumedFeatures::requiring(&[Feature::Sse2, Feature::Aes]);
        assert_eq!(Diagnostics::check_host(&host, &ok), HostStatus::Capable);

        let too_much = AssumedFeatures::requiring(&[Feature::Aes, Feature::Avx2, Feature::Fma]);
        let status = Diagnostics::check_host(&host, &too_much);
        assert_eq!(status, HostStatus::Lacking(vec![Feature::Avx2, Feature::Fma]));
        assert_eq!(Diagnostics::describe(&status), "missing: AVX2, FMA");
    }

    #[test]
    fn test_agrees_with_wordwise_compare() {
        let host = FeatureVector::from_features([Feature::Cmov, Feature::Sse4_2, Feature::ApxF]);
        for &f in Feature::ALL {
            let mask = AssumedFeatures::requiring(&[f]);
            let capable = Diagnostics::check_host(&host, &mask) == HostStatus::Capable;
            assert_eq!(capable, compare(&host, &mask) == Verdict::Compatible, "disagreement on {}", f);
        }
    }
}
