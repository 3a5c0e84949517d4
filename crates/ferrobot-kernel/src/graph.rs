//! [`ResourceGraph`] – dependency graph of every resource known to one robot.
//!
//! Nodes are keyed by [`ResourceName`] and remember their insertion order,
//! which is what makes [`ResourceGraph::topological_order`] deterministic.
//! Hard edges gate construction and drive cascading removal; weak edges only
//! record which members an observer was last told about and are never
//! followed by orphan detection.
//!
//! The graph is a plain value. The reconfiguration engine mutates a clone
//! and publishes it whole, so readers only ever see a fully applied graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferrobot_remote::RemoteNode;
use ferrobot_resource::StableHandle;
use ferrobot_types::{
    NodeStatus, RemoteConfig, ResourceConfig, ResourceName, ResourceState, RobotError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a node. There is no partially constructed state.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Constructed; the handle (or remote) is usable.
    Built,
    /// Declared but blocked on the listed dependencies.
    Pending { missing: Vec<String> },
    /// Validation, construction or graph insertion failed.
    Failed(RobotError),
}

/// What a node stands for.
#[derive(Clone)]
pub enum NodeKind {
    /// A component or service, reached through its stable handle.
    Resource {
        config: ResourceConfig,
        handle: StableHandle,
    },
    /// A federated peer. `node` is `None` until the first successful dial.
    Remote {
        config: RemoteConfig,
        node: Option<Arc<RemoteNode>>,
    },
}

#[derive(Clone)]
pub struct GraphNode {
    pub name: ResourceName,
    pub kind: NodeKind,
    pub state: NodeState,
    /// Bumped on every state change.
    pub revision: u64,
    pub last_updated: DateTime<Utc>,
}

impl GraphNode {
    pub fn resource(config: ResourceConfig, handle: StableHandle) -> Self {
        Self::new(config.resource_name(), NodeKind::Resource { config, handle })
    }

    pub fn remote(config: RemoteConfig) -> Self {
        Self::new(config.resource_name(), NodeKind::Remote { config, node: None })
    }

    fn new(name: ResourceName, kind: NodeKind) -> Self {
        let missing = Vec::new();
        Self {
            name,
            kind,
            state: NodeState::Pending { missing },
            revision: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
        self.revision += 1;
        self.last_updated = Utc::now();
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, NodeState::Built)
    }

    pub fn handle(&self) -> Option<&StableHandle> {
        match &self.kind {
            NodeKind::Resource { handle, .. } => Some(handle),
            NodeKind::Remote { .. } => None,
        }
    }

    pub fn resource_config(&self) -> Option<&ResourceConfig> {
        match &self.kind {
            NodeKind::Resource { config, .. } => Some(config),
            NodeKind::Remote { .. } => None,
        }
    }

    pub fn remote_node(&self) -> Option<&Arc<RemoteNode>> {
        match &self.kind {
            NodeKind::Remote { node, .. } => node.as_ref(),
            NodeKind::Resource { .. } => None,
        }
    }

    /// The error callers get when they ask for a node that is not built.
    pub fn unavailable_error(&self) -> Option<RobotError> {
        match &self.state {
            NodeState::Built => None,
            NodeState::Pending { missing } => Some(RobotError::not_available(
                &self.name,
                RobotError::Pending {
                    name: self.name.to_string(),
                    missing: missing.clone(),
                },
            )),
            NodeState::Failed(e) => Some(RobotError::not_available(&self.name, e.clone())),
        }
    }

    pub fn status(&self) -> NodeStatus {
        let (state, error) = match &self.state {
            NodeState::Built => match self.remote_node() {
                Some(remote) if !remote.connected() => (ResourceState::Disconnected, None),
                _ => (ResourceState::Ready, None),
            },
            NodeState::Pending { missing } if missing.is_empty() => (ResourceState::Configuring, None),
            NodeState::Pending { missing } => (
                ResourceState::Pending,
                Some(format!("waiting on {}", missing.join(", "))),
            ),
            NodeState::Failed(e) => (ResourceState::Unhealthy, Some(e.to_string())),
        };
        NodeStatus {
            name: self.name.clone(),
            state,
            revision: self.revision,
            last_updated: self.last_updated,
            error,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResourceGraph
// ─────────────────────────────────────────────────────────────────────────────

/// Directed dependency graph; edges point from a node to what it needs.
#[derive(Clone, Default)]
pub struct ResourceGraph {
    order: Vec<ResourceName>,
    nodes: HashMap<ResourceName, GraphNode>,
    /// Hard edges: node -> dependencies. Targets may be absent from `nodes`.
    deps: HashMap<ResourceName, Vec<ResourceName>>,
    /// Weak edges: observer -> members it was last notified about.
    weak: HashMap<ResourceName, Vec<ResourceName>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &ResourceName) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in insertion order.
    pub fn names(&self) -> &[ResourceName] {
        &self.order
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().filter_map(|n| self.nodes.get(n))
    }

    /// Local lookup only; remote mirrors are consulted one layer up.
    pub fn resolve(&self, name: &ResourceName) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn resolve_mut(&mut self, name: &ResourceName) -> Option<&mut GraphNode> {
        self.nodes.get_mut(name)
    }

    /// Register `node` with hard dependencies `deps`.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Cycle`] and leaves the graph untouched when the
    /// edges would close a cycle. Replacing an existing node is also
    /// rejected.
    pub fn add_node(&mut self, node: GraphNode, deps: Vec<ResourceName>) -> Result<(), RobotError> {
        let name = node.name.clone();
        if self.nodes.contains_key(&name) {
            return Err(RobotError::Config(format!("{name} is already in the graph")));
        }
        if let Some(path) = self.cycle_through(&name, &deps) {
            return Err(RobotError::Cycle { path });
        }
        self.order.push(name.clone());
        self.nodes.insert(name.clone(), node);
        self.deps.insert(name, dedup(deps));
        Ok(())
    }

    /// Replace the hard dependencies of an existing node.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Cycle`] and keeps the previous edges when the
    /// new edges would close a cycle.
    pub fn set_dependencies(
        &mut self,
        name: &ResourceName,
        deps: Vec<ResourceName>,
    ) -> Result<(), RobotError> {
        if !self.nodes.contains_key(name) {
            return Err(RobotError::not_found(name));
        }
        let previous = self.deps.insert(name.clone(), Vec::new());
        if let Some(path) = self.cycle_through(name, &deps) {
            self.deps.insert(name.clone(), previous.unwrap_or_default());
            return Err(RobotError::Cycle { path });
        }
        self.deps.insert(name.clone(), dedup(deps));
        Ok(())
    }

    /// Remove `name` and return every node that now has an unsatisfied hard
    /// dependency because of it, transitively, in discovery order. The
    /// orphans themselves stay in the graph; weak observers are never
    /// included.
    pub fn remove_node(&mut self, name: &ResourceName) -> (Option<GraphNode>, Vec<ResourceName>) {
        let Some(node) = self.nodes.remove(name) else {
            return (None, Vec::new());
        };
        self.order.retain(|n| n != name);
        self.deps.remove(name);
        self.weak.remove(name);
        for members in self.weak.values_mut() {
            members.retain(|m| m != name);
        }

        let mut orphans = Vec::new();
        let mut seen = HashSet::from([name.clone()]);
        let mut queue = VecDeque::from([name.clone()]);
        while let Some(gone) = queue.pop_front() {
            for dependent in self.dependents(&gone) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                    orphans.push(dependent);
                }
            }
        }
        (Some(node), orphans)
    }

    pub fn dependencies(&self, name: &ResourceName) -> &[ResourceName] {
        self.deps.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Hard dependencies of `name` that are not in the graph.
    pub fn missing_dependencies(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.dependencies(name)
            .iter()
            .filter(|d| !self.nodes.contains_key(*d))
            .cloned()
            .collect()
    }

    /// Nodes with a hard edge to `name`, in insertion order.
    pub fn dependents(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.order
            .iter()
            .filter(|n| self.dependencies(n).contains(name))
            .cloned()
            .collect()
    }

    pub fn set_weak_members(&mut self, observer: &ResourceName, members: Vec<ResourceName>) {
        self.weak.insert(observer.clone(), members);
    }

    pub fn weak_members(&self, observer: &ResourceName) -> &[ResourceName] {
        self.weak.get(observer).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every node after all of its hard dependencies. Independent nodes keep
    /// their insertion order.
    pub fn topological_order(&self) -> Vec<ResourceName> {
        let index: HashMap<&ResourceName, usize> =
            self.order.iter().enumerate().map(|(i, n)| (n, i)).collect();
        let mut indegree: Vec<usize> = self
            .order
            .iter()
            .map(|n| {
                self.dependencies(n)
                    .iter()
                    .filter(|d| index.contains_key(d))
                    .count()
            })
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.order.len()];
        for (i, n) in self.order.iter().enumerate() {
            for d in self.dependencies(n) {
                if let Some(&j) = index.get(d) {
                    dependents[j].push(i);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(Reverse(i)) = ready.pop() {
            out.push(self.order[i].clone());
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }
        out
    }

    /// A path `name -> dep -> ... -> name` if adding `deps` to `name` would
    /// close a cycle.
    fn cycle_through(&self, name: &ResourceName, deps: &[ResourceName]) -> Option<Vec<String>> {
        for dep in deps {
            if dep == name {
                return Some(vec![name.to_string(), name.to_string()]);
            }
            let mut stack = vec![(dep.clone(), vec![name.to_string(), dep.to_string()])];
            let mut visited = HashSet::new();
            while let Some((current, path)) = stack.pop() {
                if !visited.insert(current.clone()) {
                    continue;
                }
                for next in self.dependencies(&current) {
                    let mut next_path = path.clone();
                    next_path.push(next.to_string());
                    if next == name {
                        return Some(next_path);
                    }
                    stack.push((next.clone(), next_path));
                }
            }
        }
        None
    }
}

fn dedup(mut deps: Vec<ResourceName>) -> Vec<ResourceName> {
    let mut seen = HashSet::new();
    deps.retain(|d| seen.insert(d.clone()));
    deps
}
