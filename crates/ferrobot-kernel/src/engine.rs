//! [`Reconfigurer`] – applies a [`ConfigDiff`] to a [`ResourceGraph`].
//!
//! # Apply order
//!
//! 1. **Removed** declarations are closed and removed; every node orphaned
//!    by the removal (transitively, over hard edges only) is closed and
//!    removed as well and becomes *dormant*.
//! 2. **Modified** declarations go through the shared [`reconcile`] rule:
//!    reconfigure in place when the model is unchanged and reconfigurable,
//!    otherwise close and rebuild into the same [`StableHandle`].
//! 3. **Added** declarations, dormant resources whose dependencies resolve
//!    again, and every `Failed` or `Pending` node are built in topological
//!    order. Per-API instance limits are enforced here.
//! 4. **Weak observers** are told the final membership delta.
//!
//! Resource-local failures are parked on their node. Only structural
//! failures (cycles, close errors during teardown) end up in
//! [`ApplyReport::errors`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ferrobot_remote::{ChangeNotifier, Dialer, RemoteNode};
use ferrobot_resource::handle::close_detached;
use ferrobot_resource::{
    BuildContext, Dependencies, Matcher, OperationManager, Reconciled, Registration, Registry,
    Resource, StableHandle, WeakUpdate, reconcile,
};
use ferrobot_types::name::REMOTE_DELIMITER;
use ferrobot_types::{RemoteConfig, ResourceConfig, ResourceName, RobotConfig, RobotError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::diff::{ConfigDiff, model_changed};
use crate::graph::{GraphNode, NodeKind, NodeState, ResourceGraph};

/// Default bound on a single resource constructor.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

/// What one apply did.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Constructed into a vacant handle.
    pub built: Vec<ResourceName>,
    /// Replaced an existing target.
    pub rebuilt: Vec<ResourceName>,
    pub reconfigured: Vec<ResourceName>,
    pub removed: Vec<ResourceName>,
    pub failed: Vec<(ResourceName, RobotError)>,
    pub pending: Vec<ResourceName>,
    /// Declared but absent from the graph (orphaned or over an instance
    /// limit).
    pub dormant: Vec<ResourceName>,
    /// Structural failures.
    pub errors: Vec<RobotError>,
}

impl ApplyReport {
    /// True when nothing was constructed, reconfigured or closed.
    pub fn is_noop(&self) -> bool {
        self.built.is_empty()
            && self.rebuilt.is_empty()
            && self.reconfigured.is_empty()
            && self.removed.is_empty()
    }

    /// The structural failures folded into one error.
    pub fn structural_error(&self) -> Option<RobotError> {
        RobotError::combine(self.errors.iter().cloned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dependency resolution
// ─────────────────────────────────────────────────────────────────────────────

/// A dependency served by a remote's mirror.
#[derive(Debug, Clone)]
enum RemoteTarget {
    /// Fully qualified, e.g. `rdk:component:arm/foo:arm1`.
    Exact(ResourceName),
    /// Short form, e.g. `foo:arm1`; the API is looked up in the mirror.
    Short(String),
}

#[derive(Debug, Default)]
struct Resolved {
    /// Graph keys this node has hard edges to.
    edges: Vec<ResourceName>,
    /// Simple names that match no declaration.
    undeclared: Vec<String>,
    /// Resources fetched from remote mirrors, keyed by the remote's graph
    /// key.
    remote_targets: Vec<(ResourceName, RemoteTarget)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconfigurer
// ─────────────────────────────────────────────────────────────────────────────

/// The single mutating path over the resource graph.
pub struct Reconfigurer {
    registry: Arc<Registry>,
    dialer: Arc<dyn Dialer>,
    operations: Arc<OperationManager>,
    build_timeout: Duration,
    /// Handed to every remote so mirror changes reach the owning robot.
    remote_events: Option<ChangeNotifier>,
    /// Handles of resources that left the graph but are still declared.
    dormant: HashMap<ResourceName, StableHandle>,
}

impl Reconfigurer {
    pub fn new(
        registry: Arc<Registry>,
        dialer: Arc<dyn Dialer>,
        operations: Arc<OperationManager>,
    ) -> Self {
        Self {
            registry,
            dialer,
            operations,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            remote_events: None,
            dormant: HashMap::new(),
        }
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_remote_events(mut self, events: ChangeNotifier) -> Self {
        self.remote_events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn operations(&self) -> &Arc<OperationManager> {
        &self.operations
    }

    /// Names currently dormant.
    pub fn dormant(&self) -> Vec<ResourceName> {
        let mut names: Vec<ResourceName> = self.dormant.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply `diff` (computed against `config`) to `graph`.
    #[instrument(skip_all, fields(changes = %diff.summary()))]
    pub async fn apply(
        &mut self,
        graph: &mut ResourceGraph,
        config: &RobotConfig,
        diff: &ConfigDiff,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let declared = declared_names(config);
        // Removal prunes weak edges, so remember what observers were told.
        let weak_before: HashMap<ResourceName, Vec<ResourceName>> = graph
            .names()
            .iter()
            .map(|n| (n.clone(), graph.weak_members(n).to_vec()))
            .filter(|(_, members)| !members.is_empty())
            .collect();

        self.remove_declarations(graph, &declared, diff, &mut report).await;
        let deferred = self.apply_modifications(graph, config, diff, &mut report).await;
        self.build_pending(graph, config, &declared, deferred, &mut report)
            .await;
        self.notify_weak_observers(graph, &weak_before, &report).await;

        self.dormant.retain(|name, _| declared.contains(name));
        report.dormant = config
            .resources()
            .map(ResourceConfig::resource_name)
            .filter(|n| !graph.contains(n))
            .collect();
        info!(
            built = report.built.len(),
            rebuilt = report.rebuilt.len(),
            reconfigured = report.reconfigured.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            dormant = report.dormant.len(),
            "configuration applied"
        );
        report
    }

    // ── Step 1: removals ────────────────────────────────────────────────────

    async fn remove_declarations(
        &mut self,
        graph: &mut ResourceGraph,
        declared: &HashSet<ResourceName>,
        diff: &ConfigDiff,
        report: &mut ApplyReport,
    ) {
        let removed: Vec<ResourceName> = diff
            .removed_resources()
            .map(ResourceConfig::resource_name)
            .chain(diff.remotes.removed.iter().map(RemoteConfig::resource_name))
            .collect();

        for name in removed {
            self.dormant.remove(&name);
            let (node, orphans) = graph.remove_node(&name);
            if let Some(node) = node {
                debug!(resource = %name, "removing");
                if let Err(e) = self.close_node(&node).await {
                    report.errors.push(e);
                }
                report.removed.push(name);
            }
            // Deepest dependents first.
            for orphan in orphans.into_iter().rev() {
                let (node, _) = graph.remove_node(&orphan);
                let Some(node) = node else { continue };
                info!(resource = %orphan, "removing orphaned resource");
                if let Err(e) = self.close_node(&node).await {
                    report.errors.push(e);
                }
                if declared.contains(&orphan)
                    && let Some(handle) = node.handle()
                {
                    self.dormant.insert(orphan.clone(), handle.clone());
                }
                report.removed.push(orphan);
            }
        }
    }

    async fn close_node(&self, node: &GraphNode) -> Result<(), RobotError> {
        match &node.kind {
            NodeKind::Resource { config, handle } => {
                let closeable = self.registry.capabilities(config).is_none_or(|c| c.closeable);
                if closeable {
                    handle.close_target().await
                } else {
                    handle.vacate(RobotError::closed(&node.name)).await;
                    Ok(())
                }
            }
            NodeKind::Remote { node: Some(remote), .. } => remote.close().await,
            NodeKind::Remote { node: None, .. } => Ok(()),
        }
    }

    // ── Step 2: modifications ───────────────────────────────────────────────

    /// Returns the nodes that could not be brought up yet, with whether they
    /// may still be reconfigured in place.
    async fn apply_modifications(
        &mut self,
        graph: &mut ResourceGraph,
        config: &RobotConfig,
        diff: &ConfigDiff,
        report: &mut ApplyReport,
    ) -> HashMap<ResourceName, bool> {
        let mut deferred = HashMap::new();

        for new_conf in &diff.remotes.modified {
            let name = new_conf.resource_name();
            let Some(node) = graph.resolve_mut(&name) else { continue };
            let remote = node.remote_node().cloned();
            node.kind = NodeKind::Remote {
                config: new_conf.clone(),
                node: remote.clone(),
            };
            match remote {
                Some(remote) => match remote.reconfigure(new_conf.clone(), self.dialer.as_ref()).await {
                    Ok(()) => {
                        node.set_state(NodeState::Built);
                        report.reconfigured.push(name);
                    }
                    Err(e) => {
                        warn!(remote = %new_conf.name, error = %e, "remote reconfigure failed");
                        node.set_state(NodeState::Failed(e.clone()));
                        report.failed.push((name, e));
                    }
                },
                // Never connected; step 3 dials with the new declaration.
                None => {
                    node.set_state(NodeState::Pending { missing: Vec::new() });
                }
            }
        }

        for new_conf in diff.modified_resources() {
            let name = new_conf.resource_name();
            let Some(node) = graph.resolve_mut(&name) else {
                // Dormant; step 3 picks up the new declaration.
                continue;
            };
            let NodeKind::Resource { config: old_conf, handle } = &node.kind else {
                continue;
            };
            let in_place = node.is_built() && !model_changed(old_conf, new_conf);
            let handle = handle.clone();
            node.kind = NodeKind::Resource {
                config: new_conf.clone(),
                handle,
            };
            debug!(resource = %name, in_place, "declaration modified");
            // Dependencies added in this snapshot only enter the graph in
            // step 3, so the live target stays installed until then.
            if !self.bring_up(graph, config, &name, in_place, false, report).await {
                deferred.insert(name, in_place);
            }
        }
        deferred
    }

    // ── Step 3: construction ────────────────────────────────────────────────

    async fn build_pending(
        &mut self,
        graph: &mut ResourceGraph,
        config: &RobotConfig,
        declared: &HashSet<ResourceName>,
        mut deferred: HashMap<ResourceName, bool>,
        report: &mut ApplyReport,
    ) {
        let added: HashSet<ResourceName> = diff_added(config, graph, &self.dormant);

        for remote in &config.remotes {
            let name = remote.resource_name();
            if !graph.contains(&name) {
                // Remotes have no dependencies, so this cannot fail.
                let _ = graph.add_node(GraphNode::remote(remote.clone()), Vec::new());
            }
        }

        // Insert declarations missing from the graph. New ones always enter
        // (possibly pending); dormant ones only once every dependency is in
        // the graph again. Repeat until no more can enter so chains revive.
        loop {
            let mut progressed = false;
            for conf in config.resources() {
                let name = conf.resource_name();
                if graph.contains(&name) {
                    continue;
                }
                let is_new = added.contains(&name);
                let resolved = self.resolve_dependencies(config, conf, &[]);
                if !is_new {
                    let ready = match &resolved {
                        Ok(r) => r.undeclared.is_empty() && r.edges.iter().all(|e| graph.contains(e)),
                        Err(_) => false,
                    };
                    if !ready {
                        continue;
                    }
                }
                if !self.admit(graph, conf) {
                    debug!(resource = %name, "instance limit reached, leaving dormant");
                    continue;
                }
                let handle = self
                    .dormant
                    .remove(&name)
                    .unwrap_or_else(|| StableHandle::new(name.clone(), Arc::clone(&self.operations)));
                let edges = resolved.map(|r| r.edges).unwrap_or_default();
                let node = GraphNode::resource(conf.clone(), handle.clone());
                if let Err(e) = graph.add_node(node, edges) {
                    // Keep the declaration visible, without edges.
                    warn!(resource = %name, error = %e, "cannot insert resource");
                    let _ = graph.add_node(GraphNode::resource(conf.clone(), handle), Vec::new());
                    for member in park_cycle(graph, &name, e, report).await {
                        deferred.remove(&member);
                    }
                    continue;
                }
                progressed = true;
                if !is_new {
                    info!(resource = %name, "reviving dormant resource");
                }
                deferred.entry(name).or_insert(false);
            }
            if !progressed {
                break;
            }
        }

        // Every node not yet built is retried, whether or not its declaration
        // changed.
        for node in graph.nodes() {
            let freshly_failed = report.failed.iter().any(|(n, _)| n == &node.name);
            if !node.is_built() && !freshly_failed {
                deferred.entry(node.name.clone()).or_insert(false);
            }
        }

        // Refresh edges first so the build order sees declarations that
        // changed while their node was waiting.
        for name in deferred.keys() {
            let Some(conf) = graph.resolve(name).and_then(GraphNode::resource_config) else {
                continue;
            };
            let implicit = self
                .registry
                .lookup(&conf.api, &conf.model)
                .and_then(|r| r.validate(conf).ok())
                .unwrap_or_default();
            if let Ok(resolved) = self.resolve_dependencies(config, conf, &implicit) {
                // A cycle keeps the old edges and is reported by `bring_up`.
                let _ = graph.set_dependencies(name, resolved.edges);
            }
        }

        for name in graph.topological_order() {
            let Some(in_place) = deferred.remove(&name) else { continue };
            let freshly_failed = report.failed.iter().any(|(n, _)| n == &name);
            if !declared.contains(&name) || freshly_failed {
                continue;
            }
            let is_remote = graph
                .resolve(&name)
                .is_some_and(|n| matches!(n.kind, NodeKind::Remote { .. }));
            if is_remote {
                self.connect_remote(graph, &name, report).await;
            } else {
                self.bring_up(graph, config, &name, in_place, true, report).await;
            }
        }
    }

    /// True when one more instance of `conf.api` fits under its limit.
    fn admit(&self, graph: &ResourceGraph, conf: &ResourceConfig) -> bool {
        let Some(limit) = self.registry.max_instances(&conf.api) else {
            return true;
        };
        let count = graph
            .nodes()
            .filter(|n| n.name.api == conf.api && n.name.is_local())
            .count();
        count < limit
    }

    async fn connect_remote(
        &self,
        graph: &mut ResourceGraph,
        name: &ResourceName,
        report: &mut ApplyReport,
    ) {
        let Some(node) = graph.resolve_mut(name) else { return };
        let NodeKind::Remote { config, node: None } = &node.kind else {
            return;
        };
        let config = config.clone();
        match RemoteNode::connect(
            config.clone(),
            self.dialer.as_ref(),
            Arc::clone(&self.operations),
            self.remote_events.clone(),
        )
        .await
        {
            Ok(remote) => {
                node.kind = NodeKind::Remote {
                    config,
                    node: Some(remote),
                };
                node.set_state(NodeState::Built);
                report.built.push(name.clone());
            }
            Err(e) => {
                warn!(remote = %config.name, error = %e, "failed to connect remote");
                node.set_state(NodeState::Failed(e.clone()));
                report.failed.push((name.clone(), e));
            }
        }
    }

    /// Validate, resolve and (re)build one resource node.
    ///
    /// Returns `false` when the node is waiting on its dependencies. With
    /// `park_pending` unset such a node is left exactly as it was, live
    /// target included; otherwise its target is closed and it is parked as
    /// `Pending`.
    async fn bring_up(
        &self,
        graph: &mut ResourceGraph,
        config: &RobotConfig,
        name: &ResourceName,
        in_place: bool,
        park_pending: bool,
        report: &mut ApplyReport,
    ) -> bool {
        let Some((conf, handle)) = graph.resolve(name).and_then(|n| match &n.kind {
            NodeKind::Resource { config, handle } => Some((config.clone(), handle.clone())),
            NodeKind::Remote { .. } => None,
        }) else {
            return true;
        };

        let registry = Arc::clone(&self.registry);
        let registration = match registry.require(&conf.api, &conf.model) {
            Ok(r) => r,
            Err(e) => {
                fail(graph, name, &handle, e, report).await;
                return true;
            }
        };
        let implicit = match registration.validate(&conf) {
            Ok(implicit) => implicit,
            Err(e) => {
                fail(graph, name, &handle, e, report).await;
                return true;
            }
        };
        let resolved = match self.resolve_dependencies(config, &conf, &implicit) {
            Ok(r) => r,
            Err(e) => {
                fail(graph, name, &handle, e, report).await;
                return true;
            }
        };
        if let Err(e) = graph.set_dependencies(name, resolved.edges.clone()) {
            park_cycle(graph, name, e, report).await;
            return true;
        }

        let (deps, missing) = match collect_dependencies(graph, &resolved) {
            Ok(found) => found,
            Err(e) => {
                fail(graph, name, &handle, e, report).await;
                return true;
            }
        };
        if !missing.is_empty() {
            if !park_pending {
                return false;
            }
            debug!(resource = %name, missing = ?missing, "waiting on dependencies");
            let reason = RobotError::Pending {
                name: name.to_string(),
                missing: missing.clone(),
            };
            if let Some(old) = handle.vacate(reason).await {
                close_detached(name, old).await;
            }
            if let Some(node) = graph.resolve_mut(name) {
                node.set_state(NodeState::Pending { missing });
            }
            report.pending.push(name.clone());
            return false;
        }

        let in_place = in_place && registration.capabilities.reconfigurable;
        let had_target = handle.is_live().await;
        let outcome = reconcile(&handle, &deps, &conf, in_place, || {
            self.construct(registration, name, &conf, deps.clone())
        })
        .await;

        match outcome {
            Ok(how) => {
                if let Some(node) = graph.resolve_mut(name) {
                    node.set_state(NodeState::Built);
                }
                match how {
                    Reconciled::Reconfigured => report.reconfigured.push(name.clone()),
                    Reconciled::Rebuilt if had_target => report.rebuilt.push(name.clone()),
                    Reconciled::Rebuilt => report.built.push(name.clone()),
                }
            }
            Err(e) => fail(graph, name, &handle, e, report).await,
        }
        true
    }

    /// Run the constructor under the build timeout.
    async fn construct(
        &self,
        registration: &Registration,
        name: &ResourceName,
        conf: &ResourceConfig,
        deps: Dependencies,
    ) -> Result<Arc<dyn Resource>, RobotError> {
        let cancel = CancellationToken::new();
        let ctx = BuildContext {
            name: name.clone(),
            config: conf.clone(),
            deps,
            cancel: cancel.clone(),
        };
        match tokio::time::timeout(self.build_timeout, registration.construct(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(RobotError::Timeout {
                    name: name.to_string(),
                    after_ms: u64::try_from(self.build_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Map `depends_on` (plus the validator's implicit dependencies) to graph
    /// keys.
    fn resolve_dependencies(
        &self,
        config: &RobotConfig,
        conf: &ResourceConfig,
        implicit: &[String],
    ) -> Result<Resolved, RobotError> {
        let mut out = Resolved::default();
        for dep in conf.depends_on.iter().chain(implicit) {
            if dep.contains('/') {
                let full: ResourceName = dep.parse().map_err(|e| RobotError::DependencyResolution {
                    name: conf.resource_name().to_string(),
                    reason: format!("{dep}: {e}"),
                })?;
                match full.first_remote() {
                    Some(remote) => {
                        let key = ResourceName::remote_robot(remote);
                        out.edges.push(key.clone());
                        out.remote_targets.push((key, RemoteTarget::Exact(full)));
                    }
                    None => out.edges.push(full),
                }
            } else if let Some((remote, _)) = dep.split_once(REMOTE_DELIMITER) {
                let key = ResourceName::remote_robot(remote);
                out.edges.push(key.clone());
                out.remote_targets.push((key, RemoteTarget::Short(dep.clone())));
            } else {
                let matches: Vec<ResourceName> = config
                    .resources()
                    .filter(|c| c.name == *dep)
                    .map(ResourceConfig::resource_name)
                    .collect();
                match matches.as_slice() {
                    [] => out.undeclared.push(dep.clone()),
                    [one] => out.edges.push(one.clone()),
                    many => {
                        return Err(RobotError::DependencyResolution {
                            name: conf.resource_name().to_string(),
                            reason: format!(
                                "{dep} matches more than one resource: {}",
                                many.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                            ),
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    // ── Step 4: weak observers ──────────────────────────────────────────────

    async fn notify_weak_observers(
        &self,
        graph: &mut ResourceGraph,
        weak_before: &HashMap<ResourceName, Vec<ResourceName>>,
        report: &ApplyReport,
    ) {
        let observers: Vec<(ResourceName, StableHandle, Vec<Matcher>)> = graph
            .nodes()
            .filter(|n| n.is_built())
            .filter_map(|n| {
                let conf = n.resource_config()?;
                let registration = self.registry.lookup(&conf.api, &conf.model)?;
                if registration.weak_dependencies.is_empty() {
                    return None;
                }
                Some((
                    n.name.clone(),
                    n.handle()?.clone(),
                    registration.weak_dependencies.clone(),
                ))
            })
            .collect();
        if observers.is_empty() {
            return;
        }

        let mut built_members: Vec<ResourceName> = graph
            .nodes()
            .filter(|n| n.is_built() && n.handle().is_some())
            .map(|n| n.name.clone())
            .collect();
        for node in graph.nodes() {
            if let Some(remote) = node.remote_node() {
                built_members.extend(remote.resource_names());
            }
        }

        for (name, handle, matchers) in observers {
            let members: Vec<ResourceName> = built_members
                .iter()
                .filter(|m| **m != name && matchers.iter().any(|x| x.matches(m)))
                .cloned()
                .collect();
            let previous = weak_before.get(&name).cloned().unwrap_or_default();
            let update = WeakUpdate {
                added: members.iter().filter(|m| !previous.contains(m)).cloned().collect(),
                removed: previous.iter().filter(|m| !members.contains(m)).cloned().collect(),
                members: members.clone(),
            };
            let fresh = report.built.contains(&name) || report.rebuilt.contains(&name);
            if update.is_empty() && !fresh {
                continue;
            }
            match handle.current().await {
                Ok(target) => match target.as_weak_observer() {
                    Some(observer) => {
                        if let Err(e) = observer.weak_dependencies_updated(&update).await {
                            warn!(resource = %name, error = %e, "weak dependency update failed");
                        }
                    }
                    None => {
                        warn!(resource = %name, "registered weak dependencies but does not observe them");
                    }
                },
                Err(e) => warn!(resource = %name, error = %e, "weak observer unavailable"),
            }
            graph.set_weak_members(&name, members);
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Close every node: services, then remotes, then components, each in
    /// reverse dependency order. Errors are collected, not short-circuited.
    pub async fn close_all(&mut self, graph: &mut ResourceGraph) -> Result<(), RobotError> {
        let order: Vec<ResourceName> = graph.topological_order().into_iter().rev().collect();
        let services = order.iter().filter(|n| n.api.is_service());
        let remotes = order.iter().filter(|n| n.api.is_remote());
        let components = order.iter().filter(|n| !n.api.is_service() && !n.api.is_remote());

        let mut errors = Vec::new();
        for name in services.chain(remotes).chain(components) {
            let (node, _) = graph.remove_node(name);
            if let Some(node) = node
                && let Err(e) = self.close_node(&node).await
            {
                warn!(resource = %name, error = %e, "close failed");
                errors.push(e);
            }
        }
        self.dormant.clear();
        RobotError::combine(errors).map_or(Ok(()), Err)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn declared_names(config: &RobotConfig) -> HashSet<ResourceName> {
    config
        .resources()
        .map(ResourceConfig::resource_name)
        .chain(config.remotes.iter().map(RemoteConfig::resource_name))
        .collect()
}

/// Declarations that are neither in the graph nor dormant: genuinely new.
fn diff_added(
    config: &RobotConfig,
    graph: &ResourceGraph,
    dormant: &HashMap<ResourceName, StableHandle>,
) -> HashSet<ResourceName> {
    config
        .resources()
        .map(ResourceConfig::resource_name)
        .filter(|n| !graph.contains(n) && !dormant.contains_key(n))
        .collect()
}

/// Park `name` as failed, closing whatever target it had.
async fn fail(
    graph: &mut ResourceGraph,
    name: &ResourceName,
    handle: &StableHandle,
    err: RobotError,
    report: &mut ApplyReport,
) {
    warn!(resource = %name, error = %err, "resource failed");
    if let Some(old) = handle.vacate(err.clone()).await {
        close_detached(name, old).await;
    }
    if let Some(node) = graph.resolve_mut(name) {
        node.set_state(NodeState::Failed(err.clone()));
    }
    report.failed.push((name.clone(), err));
}

/// Park every resource on the cycle in `err` (or just `name` when `err` is
/// not a cycle) as failed and record `err` once as structural. Returns the
/// parked names.
async fn park_cycle(
    graph: &mut ResourceGraph,
    name: &ResourceName,
    err: RobotError,
    report: &mut ApplyReport,
) -> Vec<ResourceName> {
    let mut members = vec![name.clone()];
    if let RobotError::Cycle { path } = &err {
        for hop in path {
            let Some(member) = graph.names().iter().find(|n| n.to_string() == *hop).cloned() else {
                continue;
            };
            if !members.contains(&member) {
                members.push(member);
            }
        }
    }
    for member in &members {
        let Some(handle) = graph.resolve(member).and_then(GraphNode::handle).cloned() else {
            continue;
        };
        fail(graph, member, &handle, err.clone(), report).await;
    }
    report.errors.push(err);
    members
}

/// Look up every resolved dependency. Returns the dependencies found and
/// the short names of those that are not usable yet.
fn collect_dependencies(
    graph: &ResourceGraph,
    resolved: &Resolved,
) -> Result<(Dependencies, Vec<String>), RobotError> {
    let mut deps = Dependencies::new();
    let mut missing: Vec<String> = resolved.undeclared.clone();

    for edge in &resolved.edges {
        match graph.resolve(edge) {
            Some(node) if node.is_built() => {
                if let Some(handle) = node.handle() {
                    deps.insert(edge.clone(), Arc::new(handle.clone()));
                }
            }
            _ if edge.api.is_remote() => {
                for (_, target) in resolved.remote_targets.iter().filter(|(k, _)| k == edge) {
                    missing.push(target_label(target));
                }
            }
            _ => missing.push(edge.short_name()),
        }
    }

    for (key, target) in &resolved.remote_targets {
        let Some(remote) = graph.resolve(key).filter(|n| n.is_built()).and_then(|n| n.remote_node()) else {
            continue;
        };
        let local_name = match target {
            RemoteTarget::Exact(full) => Some(full.clone()),
            RemoteTarget::Short(short) => {
                let found: Vec<ResourceName> = remote
                    .resource_names()
                    .into_iter()
                    .filter(|n| n.short_name() == *short)
                    .collect();
                match found.len() {
                    0 => None,
                    1 => found.into_iter().next(),
                    _ => {
                        return Err(RobotError::DependencyResolution {
                            name: short.clone(),
                            reason: format!("{short} names more than one remote resource"),
                        });
                    }
                }
            }
        };
        match local_name.map(|n| remote.handle_by_name(&n).map(|h| (n, h))) {
            Some(Ok((n, handle))) => deps.insert(n, Arc::new(handle)),
            _ => missing.push(target_label(target)),
        }
    }
    missing.dedup();
    Ok((deps, missing))
}

fn target_label(target: &RemoteTarget) -> String {
    match target {
        RemoteTarget::Exact(full) => full.short_name(),
        RemoteTarget::Short(short) => short.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use async_trait::async_trait;
    use ferrobot_remote::{LoopbackDialer, PeerEvent, Robot};
    use ferrobot_resource::Command;
    use ferrobot_resource::sim_registry::{SimProbe, SimRegistry};
    use ferrobot_types::{Api, ExtrasByName, Model, NodeStatus};
    use serde_json::json;
    use tokio::sync::broadcast;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    struct Harness {
        engine: Reconfigurer,
        graph: ResourceGraph,
        config: RobotConfig,
        probe: SimProbe,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_registry(
                SimRegistry::builder()
                    .with_component("arm")
                    .with_component("base")
                    .with_catalog(),
                Arc::new(LoopbackDialer::new()),
            )
        }

        fn with_registry(builder: SimRegistry, dialer: Arc<dyn Dialer>) -> Self {
            let (registry, probe) = builder.build();
            Self {
                engine: Reconfigurer::new(
                    Arc::new(registry),
                    dialer,
                    Arc::new(OperationManager::new()),
                )
                .with_build_timeout(Duration::from_millis(200)),
                graph: ResourceGraph::new(),
                config: RobotConfig::default(),
                probe,
            }
        }

        async fn apply(&mut self, config: RobotConfig) -> ApplyReport {
            let d = diff(&self.config, &config);
            let report = self.engine.apply(&mut self.graph, &config, &d).await;
            self.config = config;
            report
        }

        fn names(&self) -> Vec<String> {
            self.graph.names().iter().map(|n| n.short_name()).collect()
        }

        fn state(&self, short: &str) -> NodeState {
            self.graph
                .nodes()
                .find(|n| n.name.short_name() == short)
                .map(|n| n.state.clone())
                .unwrap()
        }

        fn handle(&self, short: &str) -> StableHandle {
            self.graph
                .nodes()
                .find(|n| n.name.short_name() == short)
                .and_then(|n| n.handle().cloned())
                .unwrap()
        }
    }

    fn arm(name: &str) -> ResourceConfig {
        ResourceConfig::new(name, Api::component("arm"), Model::builtin("fake"))
    }

    fn base(name: &str) -> ResourceConfig {
        ResourceConfig::new(name, Api::component("base"), Model::builtin("fake"))
    }

    fn components(list: Vec<ResourceConfig>) -> RobotConfig {
        RobotConfig {
            components: list,
            ..RobotConfig::default()
        }
    }

    /// a <- b <- c
    fn chain() -> RobotConfig {
        components(vec![
            arm("a"),
            arm("b").with_depends_on("a"),
            arm("c").with_depends_on("b"),
        ])
    }

    #[tokio::test]
    async fn builds_in_dependency_order() {
        let mut h = Harness::new();
        let cfg = components(vec![
            arm("c").with_depends_on("b"),
            arm("b").with_depends_on("a"),
            arm("a"),
        ]);
        let report = h.apply(cfg).await;
        assert_eq!(report.built.len(), 3);
        let order: Vec<String> = h.probe.constructed_names().iter().map(|n| n.short_name()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cascade_removal_and_restoration() {
        let mut h = Harness::new();
        h.apply(chain()).await;
        let held_c = h.handle("c");
        let before: HashSet<String> = h.names().into_iter().collect();

        let mut without_a = chain();
        without_a.components.remove(0);
        let report = h.apply(without_a).await;
        assert!(report.errors.is_empty());
        assert!(h.graph.is_empty());
        let closed: Vec<String> = h.probe.closed_names().iter().map(|n| n.short_name()).collect();
        assert_eq!(closed, vec!["a", "c", "b"]);
        assert_eq!(h.engine.dormant().len(), 2);
        assert!(held_c.do_command(Command::new()).await.is_err());

        let report = h.apply(chain()).await;
        assert_eq!(report.built.len(), 3);
        let after: HashSet<String> = h.names().into_iter().collect();
        assert_eq!(before, after);
        assert!(h.engine.dormant().is_empty());
        // The handle held across the round trip works again.
        assert!(held_c.same_handle(&h.handle("c")));
        assert!(held_c.do_command(Command::new()).await.is_ok());
    }

    #[tokio::test]
    async fn identical_config_is_a_no_op() {
        let mut h = Harness::new();
        h.apply(chain()).await;
        h.probe.clear();

        let d = diff(&h.config, &chain());
        assert!(d.is_unchanged());
        let report = h.apply(chain()).await;
        assert!(report.is_noop());
        assert!(h.probe.events().is_empty());
    }

    #[tokio::test]
    async fn validation_failure_is_isolated_and_recoverable() {
        let mut h = Harness::new();
        let bad = components(vec![
            arm("arm1").with_attribute("speed", json!(-1)),
            arm("arm2"),
        ]);
        let report = h.apply(bad).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(h.names(), vec!["arm1", "arm2"]);
        match h.state("arm1") {
            NodeState::Failed(e) => assert!(e.to_string().contains("speed must be a non-negative number")),
            other => panic!("unexpected state {other:?}"),
        }
        h.probe.clear();

        let fixed = components(vec![arm("arm1").with_attribute("speed", json!(1)), arm("arm2")]);
        let report = h.apply(fixed).await;
        assert_eq!(report.built, vec![ResourceName::component("arm", "arm1")]);
        assert_eq!(h.state("arm1"), NodeState::Built);
        // arm2 untouched.
        assert_eq!(h.probe.constructed(), 1);
        assert_eq!(h.probe.closed(), 0);
    }

    #[tokio::test]
    async fn attribute_change_reconfigures_in_place() {
        let mut h = Harness::new();
        h.apply(components(vec![arm("arm1").with_attribute("speed", json!(1))])).await;
        let held = h.handle("arm1");
        h.probe.clear();

        let report = h
            .apply(components(vec![arm("arm1").with_attribute("speed", json!(5))]))
            .await;
        assert_eq!(report.reconfigured.len(), 1);
        assert_eq!(h.probe.constructed(), 0);
        assert!(held.same_handle(&h.handle("arm1")));
        let mut cmd = Command::new();
        cmd.insert("attributes".into(), json!(true));
        let out = held.do_command(cmd).await.unwrap();
        assert_eq!(out["attributes"]["speed"], json!(5));
    }

    #[tokio::test]
    async fn new_dependency_declared_alongside_keeps_in_place_reconfigure() {
        let mut h = Harness::new();
        h.apply(components(vec![arm("arm1").with_attribute("speed", json!(1))])).await;
        let held = h.handle("arm1");
        h.probe.clear();

        let report = h
            .apply(components(vec![
                arm("arm1").with_attribute("speed", json!(2)).with_depends_on("base1"),
                base("base1"),
            ]))
            .await;
        assert_eq!(report.reconfigured, vec![ResourceName::component("arm", "arm1")]);
        assert_eq!(report.built, vec![ResourceName::component("base", "base1")]);
        assert!(report.rebuilt.is_empty() && report.pending.is_empty());
        assert_eq!(h.probe.closed(), 0);
        assert_eq!(h.probe.constructed(), 1);
        assert_eq!(h.state("arm1"), NodeState::Built);
        assert_eq!(
            h.graph.dependencies(&ResourceName::component("arm", "arm1")),
            &[ResourceName::component("base", "base1")]
        );
        assert!(held.same_handle(&h.handle("arm1")));
        let mut cmd = Command::new();
        cmd.insert("attributes".into(), json!(true));
        let out = held.do_command(cmd).await.unwrap();
        assert_eq!(out["attributes"]["speed"], json!(2));
    }

    #[tokio::test]
    async fn modified_resource_with_undeclared_dependency_is_parked_pending() {
        let mut h = Harness::new();
        h.apply(components(vec![arm("arm1")])).await;
        let held = h.handle("arm1");

        let report = h.apply(components(vec![arm("arm1").with_depends_on("ghost")])).await;
        assert_eq!(report.pending, vec![ResourceName::component("arm", "arm1")]);
        assert!(matches!(h.state("arm1"), NodeState::Pending { ref missing } if missing == &["ghost"]));
        assert_eq!(h.probe.closed(), 1);
        assert!(held.do_command(Command::new()).await.is_err());
    }

    #[tokio::test]
    async fn model_change_rebuilds_into_the_same_handle() {
        let mut h = Harness::new();
        h.apply(components(vec![arm("arm1")])).await;
        let held = h.handle("arm1");
        h.probe.clear();

        let mut changed = arm("arm1");
        changed.model = Model::builtin("fake_rebuild");
        let report = h.apply(components(vec![changed])).await;
        assert_eq!(report.rebuilt.len(), 1);
        assert_eq!(h.probe.closed(), 1);
        assert_eq!(h.probe.constructed(), 1);
        assert!(held.same_handle(&h.handle("arm1")));
        assert!(held.do_command(Command::new()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_dependency_leaves_node_pending_until_declared() {
        let mut h = Harness::new();
        let report = h.apply(components(vec![arm("arm1").with_depends_on("base1")])).await;
        assert_eq!(report.pending.len(), 1);
        assert!(matches!(h.state("arm1"), NodeState::Pending { ref missing } if missing == &["base1"]));

        let report = h
            .apply(components(vec![arm("arm1").with_depends_on("base1"), base("base1")]))
            .await;
        assert_eq!(report.built.len(), 2);
        assert_eq!(h.state("arm1"), NodeState::Built);
    }

    #[tokio::test]
    async fn failed_dependency_keeps_dependent_pending() {
        let mut h = Harness::new();
        let report = h
            .apply(components(vec![
                base("base1").with_attribute("fail_build", json!("no motor")),
                arm("arm1").with_depends_on("base1"),
            ]))
            .await;
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(h.state("arm1"), NodeState::Pending { .. }));
    }

    #[tokio::test]
    async fn ambiguous_simple_dependency_fails_the_dependent() {
        let mut h = Harness::new();
        h.apply(components(vec![arm("x"), base("x"), arm("y").with_depends_on("x")]))
            .await;
        match h.state("y") {
            NodeState::Failed(RobotError::DependencyResolution { reason, .. }) => {
                assert!(reason.contains("more than one"));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn cycle_is_reported_and_parked() {
        let mut h = Harness::new();
        let report = h
            .apply(components(vec![arm("a").with_depends_on("b"), arm("b").with_depends_on("a")]))
            .await;
        assert!(matches!(report.structural_error(), Some(RobotError::Cycle { .. })));
        assert!(matches!(h.state("a"), NodeState::Failed(RobotError::Cycle { .. })));
        assert!(matches!(h.state("b"), NodeState::Failed(RobotError::Cycle { .. })));
        assert_eq!(h.names().len(), 2);
        assert_eq!(report.errors.len(), 1);

        // Retried on the next apply and still parked as a cycle, whichever
        // member is reached first.
        let report = h
            .apply(components(vec![arm("a").with_depends_on("b"), arm("b").with_depends_on("a")]))
            .await;
        assert!(matches!(report.structural_error(), Some(RobotError::Cycle { .. })));
        assert!(matches!(h.state("a"), NodeState::Failed(RobotError::Cycle { .. })));
        assert!(matches!(h.state("b"), NodeState::Failed(RobotError::Cycle { .. })));
        assert_eq!(h.probe.constructed(), 0);
    }

    #[tokio::test]
    async fn instance_limit_skips_later_declarations_until_room_frees_up() {
        let mut h = Harness::with_registry(
            SimRegistry::builder()
                .with_component("arm")
                .with_max_instances(Api::component("arm"), 1),
            Arc::new(LoopbackDialer::new()),
        );
        let report = h.apply(components(vec![arm("arm1"), arm("arm2")])).await;
        assert_eq!(h.names(), vec!["arm1"]);
        assert_eq!(report.dormant, vec![ResourceName::component("arm", "arm2")]);
        assert!(report.failed.is_empty());

        h.apply(components(vec![arm("arm2")])).await;
        assert_eq!(h.names(), vec!["arm2"]);
        assert_eq!(h.state("arm2"), NodeState::Built);
    }

    #[tokio::test]
    async fn slow_constructor_times_out() {
        let mut h = Harness::new();
        h.apply(components(vec![arm("slow").with_attribute("build_delay_ms", json!(5_000))]))
            .await;
        assert!(matches!(h.state("slow"), NodeState::Failed(RobotError::Timeout { .. })));
    }

    #[tokio::test]
    async fn failed_nodes_are_retried_on_every_apply() {
        let mut h = Harness::new();
        let cfg = components(vec![arm("arm1").with_attribute("fail_build", json!("flaky"))]);
        h.apply(cfg.clone()).await;
        let report = h.apply(cfg).await;
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn weak_observer_sees_membership_changes() {
        let mut h = Harness::new();
        let catalog = ResourceConfig::new("catalog", Api::service("catalog"), Model::builtin("catalog"));
        let mut cfg = components(vec![arm("arm1"), base("base1")]);
        cfg.services.push(catalog.clone());
        h.apply(cfg).await;
        let catalog_name = catalog.resource_name();
        let update = h.probe.last_weak_update(&catalog_name).unwrap();
        assert_eq!(update.members.len(), 2);

        let mut cfg = components(vec![arm("arm1")]);
        cfg.services.push(catalog);
        h.apply(cfg).await;
        let update = h.probe.last_weak_update(&catalog_name).unwrap();
        assert_eq!(update.removed, vec![ResourceName::component("base", "base1")]);
        assert_eq!(update.members, vec![ResourceName::component("arm", "arm1")]);
        // Observing never rebuilds the observer.
        assert_eq!(
            h.probe
                .constructed_names()
                .iter()
                .filter(|n| **n == catalog_name)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn close_all_closes_everything_once() {
        let mut h = Harness::new();
        h.apply(chain()).await;
        h.engine.close_all(&mut h.graph).await.unwrap();
        assert!(h.graph.is_empty());
        assert_eq!(h.probe.closed(), 3);
    }

    // ------------------------------------------------------------------
    // Remote dependencies
    // ------------------------------------------------------------------

    /// Robot exposing one fixed resource.
    struct OneArm {
        arm: Arc<dyn Resource>,
        events: ChangeNotifier,
    }

    #[async_trait]
    impl Robot for OneArm {
        fn resource_names(&self) -> Vec<ResourceName> {
            vec![self.arm.name().clone()]
        }

        async fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError> {
            if name == self.arm.name() {
                Ok(Arc::clone(&self.arm))
            } else {
                Err(RobotError::not_found(name))
            }
        }

        async fn status(&self, _names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError> {
            Ok(Vec::new())
        }

        async fn stop_all(&self, _extras: &ExtrasByName) -> Result<(), RobotError> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
            self.events.subscribe()
        }
    }

    struct Remote {
        name: ResourceName,
    }

    #[async_trait]
    impl Resource for Remote {
        fn name(&self) -> &ResourceName {
            &self.name
        }
    }

    #[tokio::test]
    async fn dependency_on_remote_resource_resolves_through_the_mirror() {
        let dialer = Arc::new(LoopbackDialer::new());
        dialer.register(
            "foo.local",
            Arc::new(OneArm {
                arm: Arc::new(Remote {
                    name: ResourceName::component("arm", "arm1"),
                }),
                events: ChangeNotifier::default(),
            }),
        );
        let mut h = Harness::with_registry(SimRegistry::builder().with_component("gripper"), dialer);
        let mut cfg = RobotConfig::default();
        cfg.remotes.push(RemoteConfig::new("foo", "foo.local"));
        cfg.components.push(
            ResourceConfig::new("grip", Api::component("gripper"), Model::builtin("fake"))
                .with_depends_on("foo:arm1"),
        );
        let report = h.apply(cfg.clone()).await;
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(h.state("grip"), NodeState::Built);
        assert_eq!(
            h.graph.dependencies(&ResourceName::component("gripper", "grip")),
            &[ResourceName::remote_robot("foo")]
        );

        // Dropping the remote orphans its dependents.
        cfg.remotes.clear();
        let report = h.apply(cfg).await;
        assert_eq!(report.dormant, vec![ResourceName::component("gripper", "grip")]);
        h.engine.close_all(&mut h.graph).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_remote_is_failed_and_retried() {
        let dialer = Arc::new(LoopbackDialer::new());
        let mut h = Harness::with_registry(SimRegistry::builder().with_component("arm"), dialer.clone());
        let mut remote = RemoteConfig::new("foo", "foo.local");
        remote.dial_attempts = 1;
        let cfg = RobotConfig {
            remotes: vec![remote],
            ..RobotConfig::default()
        };
        h.apply(cfg.clone()).await;
        assert!(matches!(h.state("foo"), NodeState::Failed(_)));

        dialer.register(
            "foo.local",
            Arc::new(OneArm {
                arm: Arc::new(Remote {
                    name: ResourceName::component("arm", "arm1"),
                }),
                events: ChangeNotifier::default(),
            }),
        );
        let report = h.apply(cfg).await;
        assert_eq!(report.built, vec![ResourceName::remote_robot("foo")]);
        assert_eq!(h.state("foo"), NodeState::Built);
        h.engine.close_all(&mut h.graph).await.unwrap();
    }
}
