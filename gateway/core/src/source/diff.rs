//! Symmetric difference between the running and the desired source sets.

use super::identity::SourceIdentity;
use std::collections::{BTreeMap, HashMap};

/// Keys to stop and keys to start after a reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Running sources absent from the desired set.
    pub stale: Vec<String>,
    /// Desired sources absent from the running set.
    pub new: Vec<String>,
}

impl Diff {
    /// Returns true when nothing has to be started or stopped.
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.new.is_empty()
    }
}

/// Builds identities for every entry of a configuration map, keyed by source ID.
pub fn identities(
    configs: &BTreeMap<String, String>,
    time_id: &str,
) -> HashMap<String, SourceIdentity> {
    configs
        .iter()
        .map(|(name, raw_config)| {
            let identity = SourceIdentity::new(name.as_str(), raw_config.as_str(), time_id);
            (identity.id.clone(), identity)
        })
        .collect()
}

/// Computes which keys are stale and which are new.
///
/// Entries with equal keys on both sides are left untouched. Both lists are sorted.
pub fn diff<A, B>(current: &HashMap<String, A>, desired: &HashMap<String, B>) -> Diff {
    let mut stale: Vec<String> = current
        .keys()
        .filter(|id| !desired.contains_key(*id))
        .cloned()
        .collect();
    let mut new: Vec<String> = desired
        .keys()
        .filter(|id| !current.contains_key(*id))
        .cloned()
        .collect();
    stale.sort();
    new.sort();
    Diff { stale, new }
}
