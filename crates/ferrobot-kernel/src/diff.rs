//! Config Differ – partitions two complete snapshots into added, modified,
//! removed and unchanged declarations, per category.
//!
//! Pure: no side effects, no access to the live graph. Order follows the
//! new snapshot, except for removals which follow the old one.

use std::collections::HashMap;
use std::hash::Hash;

use ferrobot_types::{ProcessConfig, RemoteConfig, ResourceConfig, RobotConfig};

/// The four disjoint sets for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition<T> {
    pub added: Vec<T>,
    /// Holds the *new* declaration.
    pub modified: Vec<T>,
    /// Holds the *old* declaration.
    pub removed: Vec<T>,
    pub unchanged: Vec<T>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<T> Partition<T> {
    /// True when nothing was added, modified or removed.
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub processes: Partition<ProcessConfig>,
    pub remotes: Partition<RemoteConfig>,
    pub components: Partition<ResourceConfig>,
    pub services: Partition<ResourceConfig>,
}

impl ConfigDiff {
    pub fn is_unchanged(&self) -> bool {
        self.processes.is_unchanged()
            && self.remotes.is_unchanged()
            && self.components.is_unchanged()
            && self.services.is_unchanged()
    }

    /// Removed components and services.
    pub fn removed_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.components.removed.iter().chain(&self.services.removed)
    }

    pub fn modified_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.components.modified.iter().chain(&self.services.modified)
    }

    pub fn added_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.components.added.iter().chain(&self.services.added)
    }

    /// One line per non-empty set, for logs.
    pub fn summary(&self) -> String {
        fn line<T>(out: &mut Vec<String>, kind: &str, p: &Partition<T>) {
            if !p.is_unchanged() {
                out.push(format!(
                    "{kind}: +{} ~{} -{}",
                    p.added.len(),
                    p.modified.len(),
                    p.removed.len()
                ));
            }
        }
        let mut out = Vec::new();
        line(&mut out, "processes", &self.processes);
        line(&mut out, "remotes", &self.remotes);
        line(&mut out, "components", &self.components);
        line(&mut out, "services", &self.services);
        if out.is_empty() {
            "unchanged".to_string()
        } else {
            out.join("; ")
        }
    }
}

/// Compare two snapshots.
pub fn diff(old: &RobotConfig, new: &RobotConfig) -> ConfigDiff {
    ConfigDiff {
        processes: partition(&old.processes, &new.processes, |p| p.id.clone(), |a, b| a == b),
        remotes: partition(&old.remotes, &new.remotes, |r| r.name.clone(), |a, b| a == b),
        components: partition(
            &old.components,
            &new.components,
            ResourceConfig::resource_name,
            ResourceConfig::normalized_eq,
        ),
        services: partition(
            &old.services,
            &new.services,
            ResourceConfig::resource_name,
            ResourceConfig::normalized_eq,
        ),
    }
}

fn partition<T, K>(
    old: &[T],
    new: &[T],
    key: impl Fn(&T) -> K,
    same: impl Fn(&T, &T) -> bool,
) -> Partition<T>
where
    T: Clone,
    K: Eq + Hash,
{
    let old_by_key: HashMap<K, &T> = old.iter().map(|t| (key(t), t)).collect();
    let new_keys: HashMap<K, ()> = new.iter().map(|t| (key(t), ())).collect();

    let mut out = Partition::default();
    for item in new {
        match old_by_key.get(&key(item)) {
            None => out.added.push(item.clone()),
            Some(previous) if same(*previous, item) => out.unchanged.push(item.clone()),
            Some(_) => out.modified.push(item.clone()),
        }
    }
    out.removed = old
        .iter()
        .filter(|t| !new_keys.contains_key(&key(*t)))
        .cloned()
        .collect();
    out
}

/// True when two declarations of the same resource name different models.
/// Such resources are always rebuilt, never reconfigured in place.
pub fn model_changed(old: &ResourceConfig, new: &ResourceConfig) -> bool {
    old.model != new.model
}
