//! [`ResourceManager`] – the single API surface over the local graph, every
//! federated remote and the process supervisor.
//!
//! Readers work on an `Arc<ResourceGraph>` snapshot taken under a short
//! `parking_lot` read lock, so they never wait on a slow constructor.
//! [`ResourceManager::reconfigure`] holds a `tokio` mutex for the whole
//! apply, mutates a private clone of the graph and publishes it at the end.

use std::collections::HashSet;
use std::sync::Arc;

use ferrobot_kernel::{ApplyReport, ProcessManager, Reconfigurer, ResourceGraph, diff};
use ferrobot_remote::{RemoteNode, Robot};
use ferrobot_resource::{OperationManager, Resource};
use ferrobot_types::{ExtrasByName, NodeStatus, ResourceName, RobotConfig, RobotError};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

struct Applied {
    config: RobotConfig,
    engine: Reconfigurer,
}

pub struct ResourceManager {
    graph: RwLock<Arc<ResourceGraph>>,
    applied: Mutex<Applied>,
    processes: ProcessManager,
    operations: Arc<OperationManager>,
}

impl ResourceManager {
    pub fn new(engine: Reconfigurer) -> Self {
        Self {
            graph: RwLock::new(Arc::new(ResourceGraph::new())),
            operations: Arc::clone(engine.operations()),
            applied: Mutex::new(Applied {
                config: RobotConfig::default(),
                engine,
            }),
            processes: ProcessManager::new(),
        }
    }

    /// The last published graph.
    pub fn graph(&self) -> Arc<ResourceGraph> {
        Arc::clone(&self.graph.read())
    }

    pub fn operations(&self) -> &Arc<OperationManager> {
        &self.operations
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// The configuration last applied.
    pub async fn config(&self) -> RobotConfig {
        self.applied.lock().await.config.clone()
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Local node names followed by every connected remote's names, without
    /// duplicates, in first-seen order. Remote graph nodes themselves are not
    /// listed.
    pub fn resource_names(&self) -> Vec<ResourceName> {
        let graph = self.graph();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let local = graph.nodes().filter(|n| !n.name.api.is_remote()).map(|n| n.name.clone());
        let remote = remote_nodes(&graph).flat_map(|r| r.resource_names());
        for name in local.chain(remote) {
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
        out
    }

    pub fn remote_names(&self) -> Vec<String> {
        remote_nodes(&self.graph()).map(|r| r.name().to_string()).collect()
    }

    pub fn remote_by_name(&self, name: &str) -> Option<Arc<RemoteNode>> {
        remote_nodes(&self.graph()).find(|r| r.name() == name)
    }

    /// Resolve `name` to a stable handle.
    ///
    /// Local nodes win. Otherwise every remote is searched by chain suffix,
    /// so `arm1` matches `foo:arm1` and `bar:arm1` while `foo:arm1` only
    /// matches the first.
    ///
    /// # Errors
    ///
    /// - the node's own error, wrapped in [`RobotError::NotAvailable`], when
    ///   it is declared locally but not built;
    /// - [`RobotError::AmbiguousName`] when more than one remote resource
    ///   matches;
    /// - [`RobotError::Disconnected`] when the name's first hop is a remote
    ///   that is currently down;
    /// - [`RobotError::NotFound`] otherwise.
    pub fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError> {
        let graph = self.graph();
        if let Some(node) = graph.resolve(name).filter(|n| !n.name.api.is_remote()) {
            if let Some(err) = node.unavailable_error() {
                return Err(err);
            }
            if let Some(handle) = node.handle() {
                return Ok(Arc::new(handle.clone()));
            }
        }

        let mut found: Vec<(Arc<RemoteNode>, ResourceName)> = Vec::new();
        for remote in remote_nodes(&graph) {
            if !remote.connected() && name.first_remote() == Some(remote.name()) {
                return Err(RobotError::disconnected(remote.name().to_string()));
            }
            found.extend(remote.matching(name).into_iter().map(|m| (Arc::clone(&remote), m)));
        }
        match found.as_slice() {
            [] => Err(RobotError::not_found(name)),
            [(remote, local)] => Ok(Arc::new(remote.handle_by_name(local)?)),
            many => Err(RobotError::AmbiguousName {
                name: name.to_string(),
                candidates: many.iter().map(|(_, n)| n.short_name()).collect(),
            }),
        }
    }

    /// Status of `names`, or of everything when `names` is empty.
    ///
    /// Names are grouped per owner and each remote gets one batched call.
    /// When asking for everything, disconnected remotes are not called;
    /// their own node reports them as disconnected.
    ///
    /// # Errors
    ///
    /// Fails as a whole when any name is unknown or any owner's call fails.
    pub async fn status(&self, names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError> {
        let graph = self.graph();
        let remotes: Vec<Arc<RemoteNode>> = remote_nodes(&graph).collect();

        let (mut out, batches) = if names.is_empty() {
            let local: Vec<NodeStatus> = graph.nodes().map(|n| n.status()).collect();
            let batches: Vec<(Arc<RemoteNode>, Vec<ResourceName>)> = remotes
                .iter()
                .filter(|r| r.connected())
                .map(|r| (Arc::clone(r), Vec::new()))
                .collect();
            (local, batches)
        } else {
            let mut local = Vec::new();
            let mut batches: Vec<(Arc<RemoteNode>, Vec<ResourceName>)> = Vec::new();
            for name in names {
                if let Some(node) = graph.resolve(name) {
                    local.push(node.status());
                    continue;
                }
                let Some(owner) = remotes.iter().find(|r| r.owns(name)) else {
                    return Err(RobotError::not_found(name));
                };
                match batches.iter_mut().find(|(r, _)| Arc::ptr_eq(r, owner)) {
                    Some((_, batch)) => batch.push(name.clone()),
                    None => batches.push((Arc::clone(owner), vec![name.clone()])),
                }
            }
            (local, batches)
        };

        let results = join_all(batches.iter().map(|(remote, batch)| remote.status(batch))).await;
        for result in results {
            out.extend(result?);
        }
        Ok(out)
    }

    // ── Control ─────────────────────────────────────────────────────────────

    /// Cancel every in-flight call, then stop every stoppable resource.
    ///
    /// Each resource gets its entry from `extras`, or `None`. Remotes are
    /// asked to stop what they own.
    ///
    /// # Errors
    ///
    /// Every stop failure, combined. One failure does not prevent the
    /// remaining stops.
    #[instrument(skip_all)]
    pub async fn stop_all(&self, extras: &ExtrasByName) -> Result<(), RobotError> {
        let cancelled = self.operations.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "cancelled in-flight operations");
        }

        let graph = self.graph();
        let mut errors = Vec::new();
        for node in graph.nodes().filter(|n| n.is_built()) {
            let Some(handle) = node.handle() else { continue };
            match handle.stop_if_stoppable(extras.get(&node.name)).await {
                Ok(true) => debug!(resource = %node.name, "stopped"),
                Ok(false) => {}
                Err(e) => {
                    warn!(resource = %node.name, error = %e, "stop failed");
                    errors.push(e);
                }
            }
        }
        for remote in remote_nodes(&graph).filter(|r| r.connected()) {
            if let Err(e) = remote.stop_all(extras).await {
                warn!(remote = %remote.name(), error = %e, "remote stop failed");
                errors.push(e);
            }
        }
        RobotError::combine(errors).map_or(Ok(()), Err)
    }

    /// Apply a full new snapshot and publish the resulting graph.
    ///
    /// Resource-local failures are parked on their nodes and reported in the
    /// returned [`ApplyReport`]; process failures are logged.
    ///
    /// # Errors
    ///
    /// [`RobotError::Config`] when `config` does not validate (nothing is
    /// applied), or the structural failures of the apply (the graph is still
    /// published).
    #[instrument(skip_all)]
    pub async fn reconfigure(&self, config: RobotConfig) -> Result<ApplyReport, RobotError> {
        config.validate()?;
        let mut applied = self.applied.lock().await;
        let changes = diff(&applied.config, &config);

        for e in self.processes.apply(&changes.processes).await {
            warn!(error = %e, "process change failed");
        }

        let mut working = ResourceGraph::clone(&self.graph());
        let report = applied.engine.apply(&mut working, &config, &changes).await;
        *self.graph.write() = Arc::new(working);
        applied.config = config;

        match report.structural_error() {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Re-apply the current snapshot. Nodes waiting on remote resources get
    /// another chance and weak observers see the new membership.
    pub async fn refresh(&self) -> Result<ApplyReport, RobotError> {
        let config = self.config().await;
        self.reconfigure(config).await
    }

    /// Stop the process supervisor, then close services, remotes and
    /// components.
    ///
    /// # Errors
    ///
    /// Every close failure, combined.
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result<(), RobotError> {
        let mut applied = self.applied.lock().await;
        let mut errors = Vec::new();
        if let Err(e) = self.processes.stop().await {
            errors.push(e);
        }
        let mut working = ResourceGraph::clone(&self.graph());
        if let Err(e) = applied.engine.close_all(&mut working).await {
            errors.push(e);
        }
        *self.graph.write() = Arc::new(working);
        applied.config = RobotConfig::default();
        info!("resource manager closed");
        RobotError::combine(errors).map_or(Ok(()), Err)
    }
}

fn remote_nodes(graph: &ResourceGraph) -> impl Iterator<Item = Arc<RemoteNode>> + '_ {
    graph.nodes().filter_map(|n| n.remote_node().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobot_remote::LoopbackDialer;
    use ferrobot_resource::Command;
    use ferrobot_resource::sim_registry::{SimProbe, SimRegistry};
    use ferrobot_types::{Api, Model, ResourceConfig, ResourceState};
    use serde_json::json;

    fn manager() -> (ResourceManager, SimProbe) {
        let (registry, probe) = SimRegistry::builder()
            .with_component("arm")
            .with_component("base")
            .build();
        let engine = Reconfigurer::new(
            Arc::new(registry),
            Arc::new(LoopbackDialer::new()),
            Arc::new(OperationManager::new()),
        );
        (ResourceManager::new(engine), probe)
    }

    fn arm(name: &str) -> ResourceConfig {
        ResourceConfig::new(name, Api::component("arm"), Model::builtin("fake"))
    }

    fn components(list: Vec<ResourceConfig>) -> RobotConfig {
        RobotConfig {
            components: list,
            ..RobotConfig::default()
        }
    }

    fn short_names(names: &[ResourceName]) -> HashSet<String> {
        names.iter().map(ResourceName::short_name).collect()
    }

    #[tokio::test]
    async fn cascading_removal_and_restoration() {
        let (rm, _) = manager();
        let full = components(vec![
            arm("A"),
            arm("B").with_depends_on("A"),
            arm("C").with_depends_on("B"),
        ]);
        rm.reconfigure(full.clone()).await.unwrap();
        let before = short_names(&rm.resource_names());
        assert_eq!(before.len(), 3);

        rm.reconfigure(components(vec![
            arm("B").with_depends_on("A"),
            arm("C").with_depends_on("B"),
        ]))
        .await
        .unwrap();
        assert!(rm.resource_names().is_empty());

        rm.reconfigure(full).await.unwrap();
        assert_eq!(short_names(&rm.resource_names()), before);
        assert!(rm.resource_by_name(&ResourceName::component("arm", "C")).is_ok());
    }

    #[tokio::test]
    async fn reapplying_the_same_config_touches_nothing() {
        let (rm, probe) = manager();
        let cfg = components(vec![arm("arm1"), arm("arm2").with_depends_on("arm1")]);
        rm.reconfigure(cfg.clone()).await.unwrap();
        probe.clear();

        let report = rm.reconfigure(cfg).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(probe.constructed(), 0);
        assert_eq!(probe.closed(), 0);
    }

    #[tokio::test]
    async fn failed_resource_is_listed_but_not_usable() {
        let (rm, probe) = manager();
        rm.reconfigure(components(vec![
            arm("arm1").with_attribute("speed", json!(-3)),
            arm("arm2"),
        ]))
        .await
        .unwrap();

        let arm1 = ResourceName::component("arm", "arm1");
        assert!(rm.resource_names().contains(&arm1));
        let err = rm.resource_by_name(&arm1).err().unwrap();
        assert!(matches!(err, RobotError::NotAvailable { .. }));
        assert!(err.to_string().contains("speed must be a non-negative number"));
        probe.clear();

        rm.reconfigure(components(vec![arm("arm1"), arm("arm2")]))
            .await
            .unwrap();
        let handle = rm.resource_by_name(&arm1).unwrap();
        assert!(handle.do_command(Command::new()).await.is_ok());
        assert_eq!(probe.constructed_names(), vec![arm1]);
    }

    #[tokio::test]
    async fn handles_survive_in_place_reconfiguration() {
        let (rm, _) = manager();
        rm.reconfigure(components(vec![arm("arm1").with_attribute("speed", json!(1))]))
            .await
            .unwrap();
        let held = rm.resource_by_name(&ResourceName::component("arm", "arm1")).unwrap();

        rm.reconfigure(components(vec![arm("arm1").with_attribute("speed", json!(9))]))
            .await
            .unwrap();
        let mut cmd = Command::new();
        cmd.insert("attributes".into(), json!(true));
        let out = held.do_command(cmd).await.unwrap();
        assert_eq!(out["attributes"]["speed"], json!(9));
    }

    #[tokio::test]
    async fn invalid_snapshot_is_rejected_without_applying() {
        let (rm, probe) = manager();
        let err = rm
            .reconfigure(components(vec![arm("a"), arm("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::Config(_)));
        assert_eq!(probe.constructed(), 0);
        assert!(rm.config().await.components.is_empty());
    }

    #[tokio::test]
    async fn cycle_is_returned_but_the_rest_is_applied() {
        let (rm, _) = manager();
        let err = rm
            .reconfigure(components(vec![
                arm("a").with_depends_on("b"),
                arm("b").with_depends_on("a"),
                arm("c"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::Cycle { .. }));
        assert!(rm.resource_by_name(&ResourceName::component("arm", "c")).is_ok());
        assert_eq!(rm.resource_names().len(), 3);
    }

    #[tokio::test]
    async fn stop_all_routes_extras_to_their_resource() {
        let (rm, probe) = manager();
        rm.reconfigure(components(vec![arm("x"), arm("y")])).await.unwrap();
        let x = ResourceName::component("arm", "x");
        let y = ResourceName::component("arm", "y");

        let mut extra = ferrobot_types::Extra::new();
        extra.insert("reason".into(), json!("estop"));
        let mut extras = ExtrasByName::new();
        extras.insert(x.clone(), extra.clone());
        rm.stop_all(&extras).await.unwrap();

        assert_eq!(probe.stops_for(&x), vec![Some(extra)]);
        assert_eq!(probe.stops_for(&y), vec![None]);
    }

    #[tokio::test]
    async fn stop_all_interrupts_a_blocked_call() {
        let (rm, _) = manager();
        rm.reconfigure(components(vec![arm("arm1")])).await.unwrap();
        let handle = rm.resource_by_name(&ResourceName::component("arm", "arm1")).unwrap();

        let mut cmd = Command::new();
        cmd.insert("sleep_ms".into(), json!(30_000));
        let blocked = tokio::spawn(async move { handle.do_command(cmd).await });
        while rm.operations().is_empty() {
            tokio::task::yield_now().await;
        }
        rm.stop_all(&ExtrasByName::new()).await.unwrap();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(RobotError::Cancelled(_))));
    }

    #[tokio::test]
    async fn status_covers_every_node_or_fails_whole() {
        let (rm, _) = manager();
        rm.reconfigure(components(vec![
            arm("arm1"),
            arm("arm2").with_depends_on("ghost"),
        ]))
        .await
        .unwrap();

        let all = rm.status(&[]).await.unwrap();
        assert_eq!(all.len(), 2);
        let pending = all.iter().find(|s| s.name.name == "arm2").unwrap();
        assert_eq!(pending.state, ResourceState::Pending);

        let one = rm.status(&[ResourceName::component("arm", "arm1")]).await.unwrap();
        assert_eq!(one[0].state, ResourceState::Ready);

        let err = rm
            .status(&[
                ResourceName::component("arm", "arm1"),
                ResourceName::component("arm", "nope"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::NotFound(_)));
    }

    #[tokio::test]
    async fn close_closes_everything_and_empties_the_view() {
        let (rm, probe) = manager();
        rm.reconfigure(components(vec![arm("arm1"), arm("arm2")])).await.unwrap();
        let held = rm.resource_by_name(&ResourceName::component("arm", "arm1")).unwrap();

        rm.close().await.unwrap();
        assert_eq!(probe.closed(), 2);
        assert!(rm.resource_names().is_empty());
        assert!(matches!(
            held.do_command(Command::new()).await,
            Err(RobotError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let (rm, _) = manager();
        let err = rm
            .resource_by_name(&ResourceName::component("arm", "ghost"))
            .err()
            .unwrap();
        assert!(matches!(err, RobotError::NotFound(_)));
    }
}
