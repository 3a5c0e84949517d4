//! [`Mirror`] – the snapshot of a peer's resources owned by one
//! [`RemoteNode`][crate::federation::RemoteNode], and the [`Naming`] rule
//! that maps peer names into the parent's flattened namespace.
//!
//! A mirror is replaced wholesale on every refresh; readers hold an
//! `Arc<Mirror>` and never see a half-built one.

use ferrobot_resource::StableHandle;
use ferrobot_types::{RemoteConfig, ResourceName};

/// Maps names between the peer's view and the parent's view.
///
/// The remote's name is always prepended as the outermost hop, so
/// `pieceArm` on remote `foo` reads `foo:pieceArm`. When the remote config
/// carries a `prefix`, it is also prepended to the simple name
/// (`foo:left.pieceArm` for prefix `left.`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    remote: String,
    prefix: Option<String>,
}

impl Naming {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            remote: config.name.clone(),
            prefix: config.prefix.clone().filter(|p| !p.is_empty()),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Peer view → parent view.
    pub fn to_local(&self, peer_name: &ResourceName) -> ResourceName {
        let renamed = match &self.prefix {
            Some(prefix) => peer_name.with_name(format!("{prefix}{}", peer_name.name)),
            None => peer_name.clone(),
        };
        renamed.prepend_remote(&self.remote)
    }

    /// Parent view → peer view. `None` when `local` is not owned by this
    /// remote.
    pub fn to_peer(&self, local: &ResourceName) -> Option<ResourceName> {
        if local.first_remote() != Some(self.remote.as_str()) {
            return None;
        }
        let popped = local.pop_remote();
        match &self.prefix {
            Some(prefix) => {
                let bare = popped.name.strip_prefix(prefix.as_str())?;
                Some(popped.with_name(bare))
            }
            None => Some(popped),
        }
    }
}

/// One mirrored resource.
#[derive(Clone, Debug)]
pub struct MirrorEntry {
    /// Name in the parent's view.
    pub local_name: ResourceName,
    /// Name in the peer's view.
    pub peer_name: ResourceName,
    pub handle: StableHandle,
}

/// Immutable snapshot of a peer's resources, in the peer's order.
#[derive(Clone, Debug, Default)]
pub struct Mirror {
    entries: Vec<MirrorEntry>,
}

impl Mirror {
    pub fn new(entries: Vec<MirrorEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[MirrorEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<ResourceName> {
        self.entries.iter().map(|e| e.local_name.clone()).collect()
    }

    pub fn get(&self, local_name: &ResourceName) -> Option<&MirrorEntry> {
        self.entries.iter().find(|e| &e.local_name == local_name)
    }

    /// Entries whose local name ends with `query` (see
    /// [`ResourceName::matches_suffix`]).
    pub fn matching(&self, query: &ResourceName) -> Vec<&MirrorEntry> {
        self.entries
            .iter()
            .filter(|e| e.local_name.matches_suffix(query))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobot_resource::OperationManager;
    use std::sync::Arc;

    fn remote(prefix: Option<&str>) -> RemoteConfig {
        let mut cfg = RemoteConfig::new("foo", "foo.local");
        cfg.prefix = prefix.map(str::to_string);
        cfg
    }

    #[test]
    fn remote_name_is_the_outermost_hop() {
        let naming = Naming::new(&remote(None));
        let local = naming.to_local(&ResourceName::component("arm", "pieceArm"));
        assert_eq!(local.short_name(), "foo:pieceArm");
        assert_eq!(
            naming.to_peer(&local),
            Some(ResourceName::component("arm", "pieceArm"))
        );
    }

    #[test]
    fn chained_peer_names_keep_their_hops() {
        let naming = Naming::new(&remote(None));
        let peer = ResourceName::component("arm", "pieceArm").prepend_remote("bar");
        assert_eq!(naming.to_local(&peer).short_name(), "foo:bar:pieceArm");
    }

    #[test]
    fn prefix_is_applied_and_stripped() {
        let naming = Naming::new(&remote(Some("left.")));
        let local = naming.to_local(&ResourceName::component("arm", "pieceArm"));
        assert_eq!(local.short_name(), "foo:left.pieceArm");
        assert_eq!(
            naming.to_peer(&local),
            Some(ResourceName::component("arm", "pieceArm"))
        );
    }

    #[test]
    fn names_of_other_remotes_do_not_translate() {
        let naming = Naming::new(&remote(None));
        let other = ResourceName::component("arm", "pieceArm").prepend_remote("bar");
        assert_eq!(naming.to_peer(&other), None);
        assert_eq!(naming.to_peer(&ResourceName::component("arm", "pieceArm")), None);
    }

    #[test]
    fn matching_finds_suffixes() {
        let ops = Arc::new(OperationManager::new());
        let entry = |short: &str| {
            let local = ResourceName::from_short(ferrobot_types::Api::component("arm"), short);
            MirrorEntry {
                peer_name: local.pop_remote(),
                handle: StableHandle::new(local.clone(), Arc::clone(&ops)),
                local_name: local,
            }
        };
        let mirror = Mirror::new(vec![entry("foo:arm1"), entry("foo:bar:arm1"), entry("foo:arm2")]);
        assert_eq!(mirror.matching(&ResourceName::component("arm", "arm1")).len(), 2);
        assert_eq!(
            mirror
                .matching(&ResourceName::from_short(ferrobot_types::Api::component("arm"), "bar:arm1"))
                .len(),
            1
        );
    }
}
