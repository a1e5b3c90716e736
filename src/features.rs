//! Image feature flags and the order in which they can be flipped
//!
//! Some features depend on others:
//!
//! - `object-map` and `journaling` require `exclusive-lock`
//! - `fast-diff` requires `object-map`
//!
//! Enabling must therefore go prerequisite first and disabling dependent
//! first. Reporting the current state never goes through this ordering.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fixed vocabulary of image capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Layering,
    Striping,
    ExclusiveLock,
    ObjectMap,
    FastDiff,
    DeepFlatten,
    Journaling,
    DataPool,
    Operations,
    Migrating,
    NonPrimary,
}

impl Feature {
    pub const ALL: [Feature; 11] = [
        Feature::Layering,
        Feature::Striping,
        Feature::ExclusiveLock,
        Feature::ObjectMap,
        Feature::FastDiff,
        Feature::DeepFlatten,
        Feature::Journaling,
        Feature::DataPool,
        Feature::Operations,
        Feature::Migrating,
        Feature::NonPrimary,
    ];

    /// Bit used by the storage engine
    pub fn bit(&self) -> u64 {
        match self {
            Feature::Layering => 1,
            Feature::Striping => 1 << 1,
            Feature::ExclusiveLock => 1 << 2,
            Feature::ObjectMap => 1 << 3,
            Feature::FastDiff => 1 << 4,
            Feature::DeepFlatten => 1 << 5,
            Feature::Journaling => 1 << 6,
            Feature::DataPool => 1 << 7,
            Feature::Operations => 1 << 8,
            Feature::Migrating => 1 << 9,
            Feature::NonPrimary => 1 << 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Feature::Layering => "layering",
            Feature::Striping => "striping",
            Feature::ExclusiveLock => "exclusive-lock",
            Feature::ObjectMap => "object-map",
            Feature::FastDiff => "fast-diff",
            Feature::DeepFlatten => "deep-flatten",
            Feature::Journaling => "journaling",
            Feature::DataPool => "data-pool",
            Feature::Operations => "operations",
            Feature::Migrating => "migrating",
            Feature::NonPrimary => "non-primary",
        }
    }

    /// Features that must be enabled before this one
    pub fn requires(&self) -> &'static [Feature] {
        match self {
            Feature::ObjectMap | Feature::Journaling => &[Feature::ExclusiveLock],
            Feature::FastDiff => &[Feature::ObjectMap],
            _ => &[],
        }
    }

    /// Position in the dependency order; `None` for features outside it
    fn priority(&self) -> Option<u8> {
        match self {
            Feature::ExclusiveLock => Some(0),
            Feature::Journaling => Some(1),
            Feature::ObjectMap => Some(2),
            Feature::FastDiff => Some(3),
            _ => None,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s.trim())
            .ok_or_else(|| Error::UnknownFeature(s.to_string()))
    }
}

/// Features that can be enabled on an existing image
pub const ALLOW_ENABLE: [Feature; 4] = [
    Feature::ExclusiveLock,
    Feature::ObjectMap,
    Feature::FastDiff,
    Feature::Journaling,
];

/// Features that can be disabled on an existing image
pub const ALLOW_DISABLE: [Feature; 5] = [
    Feature::ExclusiveLock,
    Feature::ObjectMap,
    Feature::FastDiff,
    Feature::DeepFlatten,
    Feature::Journaling,
];

/// Set of features, stored as the engine bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureSet(u64);

impl FeatureSet {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Keep only the bits of known features
    pub fn from_bits(bits: u64) -> Self {
        let known = Feature::ALL.iter().fold(0, |acc, f| acc | f.bit());
        Self(bits & known)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Parse feature names; unknown names are rejected
    pub fn parse_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        names
            .iter()
            .filter(|n| !n.as_ref().trim().is_empty())
            .map(|n| n.as_ref().parse::<Feature>())
            .collect()
    }

    /// Parse a comma separated list, as cluster settings carry it
    pub fn parse_list(list: &str) -> Result<Self> {
        let names: Vec<&str> = list.split(',').collect();
        Self::parse_names(&names)
    }

    /// Parse a cluster setting that is either a bitmask or a list of names
    pub fn parse_setting(raw: &str) -> Result<Self> {
        match raw.trim().parse::<u64>() {
            Ok(bits) => Ok(Self::from_bits(bits)),
            Err(_) => Self::parse_list(raw),
        }
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn insert(&mut self, feature: Feature) {
        self.0 |= feature.bit();
    }

    pub fn remove(&mut self, feature: Feature) {
        self.0 &= !feature.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Features in bit order
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.iter().copied().filter(move |f| self.contains(*f))
    }

    /// Names in policy (enable) order
    pub fn names(&self) -> Vec<String> {
        order_for_enable(self).iter().map(|f| f.name().to_string()).collect()
    }

    /// First dependency violation in this set, if any
    pub fn missing_prerequisite(&self) -> Option<(Feature, Feature)> {
        self.iter().find_map(|f| {
            f.requires()
                .iter()
                .find(|req| !self.contains(**req))
                .map(|req| (f, *req))
        })
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        let mut set = FeatureSet::empty();
        for f in iter {
            set.insert(f);
        }
        set
    }
}

impl Serialize for FeatureSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(order_for_enable(self).iter().map(|f| f.name()))
    }
}

impl<'de> Deserialize<'de> for FeatureSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        FeatureSet::parse_names(&names).map_err(serde::de::Error::custom)
    }
}

/// Sort key: ranked features by their dependency priority, the rest after them by bit
fn rank(feature: &Feature) -> (u8, u64) {
    match feature.priority() {
        Some(p) => (0, p as u64),
        None => (1, feature.bit()),
    }
}

/// Order in which features can be enabled: prerequisites first
pub fn order_for_enable(features: &FeatureSet) -> Vec<Feature> {
    let mut ordered: Vec<Feature> = features.iter().collect();
    ordered.sort_by_key(rank);
    ordered
}

/// Order in which features can be disabled: dependents first
///
/// Features without a dependency rank stay at the end, as when enabling.
pub fn order_for_disable(features: &FeatureSet) -> Vec<Feature> {
    let mut ordered: Vec<Feature> = features.iter().collect();
    ordered.sort_by_key(|f| match f.priority() {
        Some(p) => (0, u8::MAX - p, 0),
        None => (1, 0, f.bit()),
    });
    ordered
}

/// Feature names for a raw engine bitmask
pub fn format_bitmask(bits: u64) -> Vec<String> {
    FeatureSet::from_bits(bits).names()
}

/// Bitmask for a list of names; `None` leaves the choice to the engine
pub fn format_features<S: AsRef<str>>(names: Option<&[S]>) -> Result<Option<u64>> {
    names
        .map(|names| FeatureSet::parse_names(names).map(|set| set.bits()))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_subsets() -> impl Iterator<Item = FeatureSet> {
        (0u64..(1 << Feature::ALL.len())).map(|mask| {
            Feature::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, f)| *f)
                .collect()
        })
    }

    fn position(order: &[Feature], f: Feature) -> Option<usize> {
        order.iter().position(|x| *x == f)
    }

    #[test]
    fn test_enable_order_never_puts_dependent_first() {
        for set in all_subsets() {
            let order = order_for_enable(&set);
            assert_eq!(order.len(), set.len());
            for f in &order {
                for req in f.requires() {
                    if let (Some(p_req), Some(p_f)) = (position(&order, *req), position(&order, *f)) {
                        assert!(p_req < p_f, "{req} must precede {f} in {order:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_disable_order_never_puts_prerequisite_first() {
        for set in all_subsets() {
            let order = order_for_disable(&set);
            for f in &order {
                for req in f.requires() {
                    if let (Some(p_req), Some(p_f)) = (position(&order, *req), position(&order, *f)) {
                        assert!(p_f < p_req, "{f} must precede {req} in {order:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_order_is_independent_of_input_order() {
        let a = FeatureSet::parse_names(&["object-map", "exclusive-lock", "fast-diff"]).unwrap();
        let b = FeatureSet::parse_names(&["fast-diff", "exclusive-lock", "object-map"]).unwrap();
        assert_eq!(order_for_enable(&a), order_for_enable(&b));
        assert_eq!(
            order_for_enable(&a),
            vec![Feature::ExclusiveLock, Feature::ObjectMap, Feature::FastDiff]
        );
        assert_eq!(
            order_for_disable(&a),
            vec![Feature::FastDiff, Feature::ObjectMap, Feature::ExclusiveLock]
        );
    }

    #[test]
    fn test_unranked_features_sort_last() {
        let set = FeatureSet::parse_names(&["deep-flatten", "layering", "journaling", "exclusive-lock"]).unwrap();
        assert_eq!(
            order_for_enable(&set),
            vec![Feature::ExclusiveLock, Feature::Journaling, Feature::Layering, Feature::DeepFlatten]
        );
        assert_eq!(
            order_for_disable(&set),
            vec![Feature::Journaling, Feature::ExclusiveLock, Feature::Layering, Feature::DeepFlatten]
        );
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err = FeatureSet::parse_names(&["exclusive-lock", "teleport"]).unwrap_err();
        assert!(matches!(err, Error::UnknownFeature(name) if name == "teleport"));
    }

    #[test]
    fn test_bitmask_conversions() {
        assert_eq!(format_features(Some(&["exclusive-lock", "object-map"][..])).unwrap(), Some(12));
        assert_eq!(format_features::<&str>(None).unwrap(), None);
        assert_eq!(format_bitmask(61), vec!["exclusive-lock", "object-map", "fast-diff", "layering", "deep-flatten"]);
        assert_eq!(FeatureSet::from_bits(1 << 40).bits(), 0);
        assert_eq!(FeatureSet::parse_list("layering, exclusive-lock").unwrap().bits(), 5);
    }

    #[test]
    fn test_missing_prerequisite() {
        let ok = FeatureSet::parse_names(&["exclusive-lock", "object-map", "fast-diff"]).unwrap();
        assert_eq!(ok.missing_prerequisite(), None);
        let bad = FeatureSet::parse_names(&["fast-diff", "exclusive-lock"]).unwrap();
        assert_eq!(bad.missing_prerequisite(), Some((Feature::FastDiff, Feature::ObjectMap)));
    }

    #[test]
    fn test_serde_uses_names() {
        let set = FeatureSet::parse_names(&["object-map", "exclusive-lock"]).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["exclusive-lock","object-map"]"#);
        let back: FeatureSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_parse_setting_accepts_bits_or_names() {
        assert_eq!(FeatureSet::parse_setting("61").unwrap().bits(), 61);
        let set = FeatureSet::parse_setting("layering, exclusive-lock").unwrap();
        assert_eq!(set.bits(), 5);
        assert!(FeatureSet::parse_setting("layering,warp-drive").is_err());
    }
}
