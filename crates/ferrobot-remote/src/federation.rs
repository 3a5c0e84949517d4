//! [`RemoteNode`] – a peer robot incorporated as a local sub-graph.
//!
//! A remote node owns one [`Peer`] connection, a [`Mirror`] of the peer's
//! resources, and one supervised watcher task.
//!
//! # Lifecycle
//!
//! 1. [`RemoteNode::connect`] dials the peer (bounded attempts), builds the
//!    initial mirror and starts the watcher.
//! 2. The watcher listens on the peer's change channel and polls
//!    `connected()` on the configured interval. On every change while
//!    connected it rebuilds the mirror and reconciles each entry with
//!    [`reconcile`], so handles held elsewhere survive the refresh.
//! 3. While disconnected, names are hidden, lookups fail with
//!    [`RobotError::Disconnected`], every mirrored handle is vacated, and
//!    `reconnect()` is attempted on the reconnect interval.
//! 4. [`RemoteNode::close`] cancels the watcher, waits for it, then closes
//!    the peer connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ferrobot_resource::{Dependencies, OperationManager, Resource, StableHandle, reconcile};
use ferrobot_types::{
    ExtrasByName, Model, NodeStatus, RemoteConfig, ResourceConfig, ResourceName, RobotError,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::mirror::{Mirror, MirrorEntry, Naming};
use crate::notifier::{ChangeNotifier, PeerEvent, recv_coalesced};
use crate::proxy::RemoteResource;
use crate::robot::{Dialer, Peer, Robot};

// ─────────────────────────────────────────────────────────────────────────────
// Dialing
// ─────────────────────────────────────────────────────────────────────────────

/// Dial `config.address`, trying `config.dial_attempts` times (at least
/// once) and sleeping the reconnect interval between attempts.
///
/// # Errors
///
/// Returns the last dial error wrapped as [`RobotError::Remote`].
#[instrument(skip(dialer, config), fields(remote = %config.name))]
pub async fn dial_with_retries(
    dialer: &dyn Dialer,
    config: &RemoteConfig,
) -> Result<Arc<dyn Peer>, RobotError> {
    let attempts = config.dial_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match dialer.dial(config).await {
            Ok(peer) => {
                debug!(attempt, "dialed remote");
                return Ok(peer);
            }
            Err(e) => {
                warn!(attempt, attempts, error = %e, "dial attempt failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(config.reconnect_interval()).await;
                }
            }
        }
    }
    Err(RobotError::Remote {
        remote: config.name.clone(),
        reason: format!(
            "could not dial {} after {attempts} attempt(s): {}",
            config.address,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

struct Shared {
    name: String,
    config: RwLock<RemoteConfig>,
    peer: RwLock<Arc<dyn Peer>>,
    mirror: RwLock<Arc<Mirror>>,
    /// Serializes mirror rebuilds between the watcher and explicit refreshes.
    sync_lock: Mutex<()>,
    connected: AtomicBool,
    operations: Arc<OperationManager>,
    events: ChangeNotifier,
    parent: Option<ChangeNotifier>,
}

struct Watcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Shared {
    fn peer(&self) -> Arc<dyn Peer> {
        Arc::clone(&self.peer.read())
    }

    fn naming(&self) -> Naming {
        Naming::new(&self.config.read())
    }

    fn mirror(&self) -> Arc<Mirror> {
        Arc::clone(&self.mirror.read())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish_change(&self) {
        self.events.publish(PeerEvent::ResourcesChanged);
        if let Some(parent) = &self.parent {
            parent.publish(PeerEvent::ResourcesChanged);
        }
    }

    /// Rebuild the mirror from the peer and reconcile it against the current
    /// one.
    async fn refresh(&self) -> Result<(), RobotError> {
        let _sync = self.sync_lock.lock().await;
        let peer = self.peer();
        if !peer.connected() {
            self.vacate_all(RobotError::disconnected(self.name.clone())).await;
            return Ok(());
        }

        let naming = self.naming();
        let current = self.mirror();
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for peer_name in peer.resource_names() {
            // The peer's own remote robots are not resources; their
            // resources already appear under chained names.
            if peer_name.api.is_remote() {
                continue;
            }
            let local_name = naming.to_local(&peer_name);
            if !seen.insert(local_name.clone()) {
                continue;
            }
            let handle = match current.get(&local_name) {
                Some(existing) => existing.handle.clone(),
                None => StableHandle::new(local_name.clone(), Arc::clone(&self.operations)),
            };
            match peer.resource_by_name(&peer_name).await {
                Ok(target) => {
                    let proxy: Arc<dyn Resource> = Arc::new(RemoteResource::new(
                        local_name.clone(),
                        self.name.clone(),
                        target,
                        Arc::clone(&peer),
                    ));
                    let conf = proxy_config(&local_name);
                    if let Err(e) = reconcile(&handle, &Dependencies::new(), &conf, true, || async {
                        Ok(proxy)
                    })
                    .await
                    {
                        warn!(remote = %self.name, resource = %local_name, error = %e, "failed to refresh mirrored resource");
                    }
                }
                Err(e) => {
                    debug!(remote = %self.name, resource = %local_name, error = %e, "peer resource unavailable");
                    if let Some(old) = handle.vacate(e).await {
                        ferrobot_resource::handle::close_detached(&local_name, old).await;
                    }
                }
            }
            entries.push(MirrorEntry {
                local_name,
                peer_name,
                handle,
            });
        }

        for gone in current.entries().iter().filter(|e| !seen.contains(&e.local_name)) {
            if let Some(old) = gone.handle.vacate(RobotError::not_found(&gone.local_name)).await {
                ferrobot_resource::handle::close_detached(&gone.local_name, old).await;
            }
        }

        let fresh = Mirror::new(entries);
        let changed = !self.is_connected() || fresh.names() != current.names();
        *self.mirror.write() = Arc::new(fresh);
        self.connected.store(true, Ordering::SeqCst);
        if changed {
            info!(remote = %self.name, resources = self.mirror().len(), "remote mirror updated");
            self.publish_change();
        }
        Ok(())
    }

    /// Enter the disconnected state, vacating every mirrored handle with
    /// `reason`.
    async fn vacate_all(&self, reason: RobotError) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        for entry in self.mirror().entries() {
            entry.handle.vacate(reason.clone()).await;
        }
        if was_connected {
            warn!(remote = %self.name, "remote disconnected");
            self.publish_change();
        }
    }

    async fn mark_disconnected(&self) {
        let _sync = self.sync_lock.lock().await;
        self.vacate_all(RobotError::disconnected(self.name.clone())).await;
    }

    /// Poll the peer and act on connectivity transitions.
    async fn check_connection(&self) {
        let peer = self.peer();
        match (self.is_connected(), peer.connected()) {
            (true, true) => {}
            (true, false) => self.mark_disconnected().await,
            (false, true) => {
                if let Err(e) = self.refresh().await {
                    warn!(remote = %self.name, error = %e, "refresh after reconnect failed");
                }
            }
            (false, false) => match peer.reconnect().await {
                Ok(()) => {
                    info!(remote = %self.name, "remote reconnected");
                    if let Err(e) = self.refresh().await {
                        warn!(remote = %self.name, error = %e, "refresh after reconnect failed");
                    }
                }
                Err(e) => debug!(remote = %self.name, error = %e, "reconnect attempt failed"),
            },
        }
    }
}

/// Synthetic declaration used when reconciling a mirrored resource.
fn proxy_config(local_name: &ResourceName) -> ResourceConfig {
    ResourceConfig::new(
        local_name.short_name(),
        local_name.api.clone(),
        Model::new("rdk-internal", "remote", "proxy"),
    )
}

/// The watcher loop: one per remote, cancelled and joined by its owner.
async fn watch(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<PeerEvent>,
    cancel: CancellationToken,
) {
    let mut events_open = true;
    loop {
        let wait = {
            let config = shared.config.read();
            if shared.is_connected() {
                config.connection_check_interval()
            } else {
                config.reconnect_interval()
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = recv_coalesced(&mut events, &shared.name), if events_open => match event {
                Some(PeerEvent::Disconnected) => shared.mark_disconnected().await,
                Some(PeerEvent::Connected | PeerEvent::ResourcesChanged) => {
                    if let Err(e) = shared.refresh().await {
                        warn!(remote = %shared.name, error = %e, "mirror refresh failed");
                    }
                }
                None => {
                    debug!(remote = %shared.name, "peer change channel closed, polling only");
                    events_open = false;
                }
            },
            _ = tokio::time::sleep(wait) => shared.check_connection().await,
        }
    }
    debug!(remote = %shared.name, "remote watcher stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// RemoteNode
// ─────────────────────────────────────────────────────────────────────────────

/// A federated peer robot.
pub struct RemoteNode {
    shared: Arc<Shared>,
    watcher: Mutex<Option<Watcher>>,
}

impl RemoteNode {
    /// Dial the peer, build the initial mirror, and start the watcher.
    ///
    /// `parent` receives [`PeerEvent::ResourcesChanged`] whenever this
    /// node's visible names change.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Remote`] when every dial attempt failed.
    #[instrument(skip_all, fields(remote = %config.name))]
    pub async fn connect(
        config: RemoteConfig,
        dialer: &dyn Dialer,
        operations: Arc<OperationManager>,
        parent: Option<ChangeNotifier>,
    ) -> Result<Arc<Self>, RobotError> {
        let peer = dial_with_retries(dialer, &config).await?;
        // Subscribe before the first sync so no change slips between the two.
        let events = peer.subscribe();
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            config: RwLock::new(config),
            peer: RwLock::new(peer),
            mirror: RwLock::new(Arc::new(Mirror::default())),
            sync_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            operations,
            events: ChangeNotifier::default(),
            parent,
        });
        shared.refresh().await?;
        let node = Arc::new(Self {
            watcher: Mutex::new(Some(spawn_watcher(&shared, events))),
            shared,
        });
        info!(resources = node.shared.mirror().len(), "remote connected");
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> RemoteConfig {
        self.shared.config.read().clone()
    }

    pub fn connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Names in the parent's view; empty while disconnected.
    pub fn resource_names(&self) -> Vec<ResourceName> {
        if !self.connected() {
            return Vec::new();
        }
        self.shared.mirror().names()
    }

    /// Look up a mirrored resource by its parent-view name.
    ///
    /// # Errors
    ///
    /// [`RobotError::Disconnected`] while disconnected,
    /// [`RobotError::NotFound`] when the peer has no such resource.
    pub fn handle_by_name(&self, local_name: &ResourceName) -> Result<StableHandle, RobotError> {
        if !self.connected() {
            return Err(RobotError::disconnected(self.shared.name.clone()));
        }
        self.shared
            .mirror()
            .get(local_name)
            .map(|e| e.handle.clone())
            .ok_or_else(|| RobotError::not_found(local_name))
    }

    /// Parent-view names matching `query` by suffix; empty while
    /// disconnected.
    pub fn matching(&self, query: &ResourceName) -> Vec<ResourceName> {
        if !self.connected() {
            return Vec::new();
        }
        self.shared
            .mirror()
            .matching(query)
            .into_iter()
            .map(|e| e.local_name.clone())
            .collect()
    }

    /// True when `local_name` would be served by this remote.
    pub fn owns(&self, local_name: &ResourceName) -> bool {
        self.shared.naming().to_peer(local_name).is_some()
    }

    /// Rebuild the mirror now instead of waiting for the watcher.
    pub async fn refresh(&self) -> Result<(), RobotError> {
        self.shared.refresh().await
    }

    /// Apply a changed remote declaration in place.
    ///
    /// The watcher is paused, the connection is replaced when the address
    /// or credentials changed, and the mirror is reconciled so handles held
    /// elsewhere stay valid.
    ///
    /// # Errors
    ///
    /// Returns the dial error when the new address cannot be reached. The
    /// previous declaration and connection are then kept.
    #[instrument(skip_all, fields(remote = %self.shared.name))]
    pub async fn reconfigure(&self, config: RemoteConfig, dialer: &dyn Dialer) -> Result<(), RobotError> {
        self.stop_watcher().await;
        let previous = self.config();
        let reconnect = previous.address != config.address
            || previous.auth != config.auth
            || previous.insecure != config.insecure;

        let mut result = Ok(());
        if reconnect {
            match dial_with_retries(dialer, &config).await {
                Ok(peer) => {
                    let old = std::mem::replace(&mut *self.shared.peer.write(), peer);
                    if let Err(e) = old.close().await {
                        warn!(error = %e, "failed to close previous peer connection");
                    }
                    *self.shared.config.write() = config;
                }
                Err(e) => result = Err(e),
            }
        } else {
            *self.shared.config.write() = config;
        }
        if result.is_ok() {
            result = self.shared.refresh().await;
        }
        let events = self.shared.peer().subscribe();
        *self.watcher.lock().await = Some(spawn_watcher(&self.shared, events));
        result
    }

    /// Cancel the watcher, wait for it, then close the peer connection.
    ///
    /// # Errors
    ///
    /// Returns the peer's close error.
    pub async fn close(&self) -> Result<(), RobotError> {
        self.stop_watcher().await;
        let _sync = self.shared.sync_lock.lock().await;
        self.shared.connected.store(false, Ordering::SeqCst);
        for entry in self.shared.mirror().entries() {
            if let Some(old) = entry.handle.vacate(RobotError::closed(&entry.local_name)).await {
                ferrobot_resource::handle::close_detached(&entry.local_name, old).await;
            }
        }
        *self.shared.mirror.write() = Arc::new(Mirror::default());
        self.shared.peer().close().await
    }

    async fn stop_watcher(&self) {
        let watcher = self.watcher.lock().await.take();
        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            if let Err(e) = watcher.task.await {
                warn!(remote = %self.shared.name, error = %e, "remote watcher ended abnormally");
            }
        }
    }

    /// Translate parent-view names owned by this remote to peer names.
    fn to_peer_names(&self, names: &[ResourceName]) -> Result<HashMap<ResourceName, ResourceName>, RobotError> {
        let naming = self.shared.naming();
        names
            .iter()
            .map(|local| {
                naming
                    .to_peer(local)
                    .map(|peer| (peer, local.clone()))
                    .ok_or_else(|| RobotError::not_found(local))
            })
            .collect()
    }
}

fn spawn_watcher(shared: &Arc<Shared>, events: broadcast::Receiver<PeerEvent>) -> Watcher {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(watch(Arc::clone(shared), events, cancel.clone()));
    Watcher { cancel, task }
}

#[async_trait]
impl Robot for RemoteNode {
    fn resource_names(&self) -> Vec<ResourceName> {
        RemoteNode::resource_names(self)
    }

    async fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError> {
        let handle = self.handle_by_name(name)?;
        Ok(Arc::new(handle))
    }

    /// One batched call to the peer; names are translated both ways.
    async fn status(&self, names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError> {
        if !self.connected() {
            return Err(RobotError::disconnected(self.shared.name.clone()));
        }
        let naming = self.shared.naming();
        let peer = self.shared.peer();
        if names.is_empty() {
            let statuses = peer.status(&[]).await?;
            return Ok(statuses
                .into_iter()
                .filter(|s| !s.name.api.is_remote())
                .map(|mut s| {
                    s.name = naming.to_local(&s.name);
                    s
                })
                .collect());
        }
        let by_peer = self.to_peer_names(names)?;
        let peer_names: Vec<ResourceName> = by_peer.keys().cloned().collect();
        let statuses = peer.status(&peer_names).await?;
        Ok(statuses
            .into_iter()
            .map(|mut s| {
                s.name = by_peer
                    .get(&s.name)
                    .cloned()
                    .unwrap_or_else(|| naming.to_local(&s.name));
                s
            })
            .collect())
    }

    /// Forward the extras addressed to this remote's resources, in peer
    /// names.
    async fn stop_all(&self, extras: &ExtrasByName) -> Result<(), RobotError> {
        if !self.connected() {
            return Err(RobotError::disconnected(self.shared.name.clone()));
        }
        let naming = self.shared.naming();
        let translated: ExtrasByName = extras
            .iter()
            .filter_map(|(local, extra)| naming.to_peer(local).map(|peer| (peer, extra.clone())))
            .collect();
        self.shared.peer().stop_all(&translated).await
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDialer;
    use chrono::Utc;
    use ferrobot_resource::{Command, Stoppable};
    use ferrobot_types::{Extra, ResourceState};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    struct Arm {
        name: ResourceName,
        owner: &'static str,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Resource for Arm {
        fn name(&self) -> &ResourceName {
            &self.name
        }

        async fn do_command(&self, _cmd: Command) -> Result<Command, RobotError> {
            let mut out = Command::new();
            out.insert("owner".into(), self.owner.into());
            Ok(out)
        }

        fn as_stoppable(&self) -> Option<&dyn Stoppable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Stoppable for Arm {
        async fn stop(&self, _extra: Option<&Extra>) -> Result<(), RobotError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A robot whose resource set can be edited from the test.
    struct Fixture {
        owner: &'static str,
        arms: parking_lot::Mutex<Vec<Arc<Arm>>>,
        events: ChangeNotifier,
        stop_calls: parking_lot::Mutex<Vec<ExtrasByName>>,
    }

    impl Fixture {
        fn new(owner: &'static str, names: &[&str]) -> Arc<Self> {
            let fixture = Arc::new(Self {
                owner,
                arms: parking_lot::Mutex::new(Vec::new()),
                events: ChangeNotifier::default(),
                stop_calls: parking_lot::Mutex::new(Vec::new()),
            });
            for n in names {
                fixture.add(n);
            }
            fixture
        }

        fn add(&self, short: &str) {
            self.arms.lock().push(Arc::new(Arm {
                name: ResourceName::from_short(ferrobot_types::Api::component("arm"), short),
                owner: self.owner,
                stops: AtomicUsize::new(0),
            }));
            self.events.publish(PeerEvent::ResourcesChanged);
        }

        fn remove(&self, short: &str) {
            self.arms.lock().retain(|a| a.name.short_name() != short);
            self.events.publish(PeerEvent::ResourcesChanged);
        }
    }

    #[async_trait]
    impl Robot for Fixture {
        fn resource_names(&self) -> Vec<ResourceName> {
            let mut names: Vec<ResourceName> =
                self.arms.lock().iter().map(|a| a.name.clone()).collect();
            names.push(ResourceName::remote_robot("nested"));
            names
        }

        async fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError> {
            self.arms
                .lock()
                .iter()
                .find(|a| &a.name == name)
                .map(|a| Arc::clone(a) as Arc<dyn Resource>)
                .ok_or_else(|| RobotError::not_found(name))
        }

        async fn status(&self, names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError> {
            let all = self.resource_names();
            let wanted: Vec<ResourceName> = if names.is_empty() { all } else { names.to_vec() };
            Ok(wanted
                .into_iter()
                .map(|name| NodeStatus {
                    name,
                    state: ResourceState::Ready,
                    revision: 1,
                    last_updated: Utc::now(),
                    error: None,
                })
                .collect())
        }

        async fn stop_all(&self, extras: &ExtrasByName) -> Result<(), RobotError> {
            self.stop_calls.lock().push(extras.clone());
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
            self.events.subscribe()
        }
    }

    fn fast(name: &str, address: &str) -> RemoteConfig {
        let mut cfg = RemoteConfig::new(name, address);
        cfg.connection_check_interval_ms = 20;
        cfg.reconnect_interval_ms = 10;
        cfg
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn arm(short: &str) -> ResourceName {
        ResourceName::from_short(ferrobot_types::Api::component("arm"), short)
    }

    #[tokio::test]
    async fn dial_gives_up_after_configured_attempts() {
        let dialer = LoopbackDialer::new();
        let mut cfg = fast("foo", "nowhere");
        cfg.dial_attempts = 3;
        let err = dial_with_retries(&dialer, &cfg).await.err().unwrap();
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn mirror_prefixes_names_and_skips_nested_remotes() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        dialer.register("foo.local", Fixture::new("foo", &["pieceArm", "bar:pieceArm"]));
        let node = RemoteNode::connect(
            fast("foo", "foo.local"),
            &dialer,
            Arc::new(OperationManager::new()),
            None,
        )
        .await?;

        let names: Vec<String> = node.resource_names().iter().map(|n| n.short_name()).collect();
        assert_eq!(names, vec!["foo:pieceArm", "foo:bar:pieceArm"]);
        assert_eq!(node.matching(&arm("pieceArm")).len(), 2);

        let handle = node.handle_by_name(&arm("foo:pieceArm"))?;
        let out = handle.do_command(Command::new()).await?;
        assert_eq!(out["owner"], "foo");
        node.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn config_prefix_renames_simple_names() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        dialer.register("foo.local", Fixture::new("foo", &["pieceArm"]));
        let mut cfg = fast("foo", "foo.local");
        cfg.prefix = Some("left.".to_string());
        let node = RemoteNode::connect(cfg, &dialer, Arc::new(OperationManager::new()), None).await?;
        assert_eq!(node.resource_names()[0].short_name(), "foo:left.pieceArm");
        assert!(node.handle_by_name(&arm("foo:left.pieceArm")).is_ok());
        node.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn peer_changes_are_mirrored_and_reported_to_parent() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        let fixture = Fixture::new("foo", &["arm1"]);
        dialer.register("foo.local", fixture.clone());
        let parent = ChangeNotifier::default();
        let mut parent_events = parent.subscribe();
        let node = RemoteNode::connect(
            fast("foo", "foo.local"),
            &dialer,
            Arc::new(OperationManager::new()),
            Some(parent.clone()),
        )
        .await?;
        // Initial sync.
        assert_eq!(parent_events.recv().await?, PeerEvent::ResourcesChanged);

        fixture.add("arm2");
        eventually(|| node.resource_names().len() == 2).await;
        assert_eq!(parent_events.recv().await?, PeerEvent::ResourcesChanged);

        fixture.remove("arm1");
        eventually(|| node.resource_names().len() == 1).await;
        assert!(matches!(
            node.handle_by_name(&arm("foo:arm1")),
            Err(RobotError::NotFound(_))
        ));
        node.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_hides_names_and_reconnect_restores_handles() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        let link = dialer.register("foo.local", Fixture::new("foo", &["arm1", "arm2", "arm3"]));
        let node = RemoteNode::connect(
            fast("foo", "foo.local"),
            &dialer,
            Arc::new(OperationManager::new()),
            None,
        )
        .await?;
        let held = node.handle_by_name(&arm("foo:arm1"))?;
        assert_eq!(node.resource_names().len(), 3);

        link.sever();
        eventually(|| !node.connected()).await;
        assert!(node.resource_names().is_empty());
        assert!(node.handle_by_name(&arm("foo:arm1")).unwrap_err().is_disconnected());
        assert!(held.do_command(Command::new()).await.unwrap_err().is_disconnected());

        link.restore();
        eventually(|| node.connected()).await;
        assert_eq!(node.resource_names().len(), 3);
        let again = node.handle_by_name(&arm("foo:arm1"))?;
        assert!(again.same_handle(&held));
        let out = held.do_command(Command::new()).await?;
        assert_eq!(out["owner"], "foo");
        node.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn status_and_stop_all_translate_names() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        let fixture = Fixture::new("foo", &["arm1"]);
        dialer.register("foo.local", fixture.clone());
        let node = RemoteNode::connect(
            fast("foo", "foo.local"),
            &dialer,
            Arc::new(OperationManager::new()),
            None,
        )
        .await?;

        let statuses = Robot::status(node.as_ref(), &[arm("foo:arm1")]).await?;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, arm("foo:arm1"));

        let all = Robot::status(node.as_ref(), &[]).await?;
        assert!(all.iter().all(|s| !s.name.api.is_remote()));

        let mut extras = ExtrasByName::new();
        let mut extra = Extra::new();
        extra.insert("force".into(), true.into());
        extras.insert(arm("foo:arm1"), extra.clone());
        extras.insert(arm("bar:arm9"), Extra::new());
        node.stop_all(&extras).await?;
        let calls = fixture.stop_calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].get(&arm("arm1")), Some(&extra));
        assert_eq!(calls[0].len(), 1);
        node.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn close_stops_watcher_and_vacates_handles() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        let fixture = Fixture::new("foo", &["arm1"]);
        dialer.register("foo.local", fixture.clone());
        let node = RemoteNode::connect(
            fast("foo", "foo.local"),
            &dialer,
            Arc::new(OperationManager::new()),
            None,
        )
        .await?;
        let held = node.handle_by_name(&arm("foo:arm1"))?;
        node.close().await?;
        assert!(node.watcher.lock().await.is_none());
        assert!(matches!(
            held.do_command(Command::new()).await,
            Err(RobotError::Closed(_))
        ));
        assert!(node.resource_names().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn reconfigure_to_new_address_keeps_handles() -> Result<(), Box<dyn std::error::Error>> {
        let dialer = LoopbackDialer::new();
        dialer.register("foo.local", Fixture::new("old", &["arm1"]));
        dialer.register("foo2.local", Fixture::new("new", &["arm1"]));
        let node = RemoteNode::connect(
            fast("foo", "foo.local"),
            &dialer,
            Arc::new(OperationManager::new()),
            None,
        )
        .await?;
        let held = node.handle_by_name(&arm("foo:arm1"))?;
        node.reconfigure(fast("foo", "foo2.local"), &dialer).await?;
        let out = held.do_command(Command::new()).await?;
        assert_eq!(out["owner"], "new");
        node.close().await?;
        Ok(())
    }
}
