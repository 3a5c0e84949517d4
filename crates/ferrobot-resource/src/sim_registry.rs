//! [`SimRegistry`] – in-process simulated models for tests and dry runs.
//!
//! Builds a [`Registry`] whose every model is backed by a stub that records
//! what the runtime did to it (constructions, closes, in-place
//! reconfigures, stops, weak-dependency updates) in a shared [`SimProbe`].
//! This allows the whole control plane to run without any hardware.
//!
//! # Models
//!
//! | Model | Behaviour |
//! |---|---|
//! | `rdk:builtin:fake` | Stoppable; applies attribute changes in place. |
//! | `rdk:builtin:fake_rebuild` | Stoppable; every change closes and rebuilds it. |
//! | `rdk:builtin:catalog` (service) | Weakly depends on every component and records the membership it is told about. |
//!
//! # Attributes understood by every model
//!
//! | Attribute | Effect |
//! |---|---|
//! | `speed` | Must be a non-negative number, otherwise validation fails. |
//! | `fail_build` | Construction fails with this message. |
//! | `build_delay_ms` | Construction sleeps first (honours cancellation). |
//!
//! # Example
//!
//! ```rust
//! use ferrobot_resource::sim_registry::SimRegistry;
//! use ferrobot_types::{Api, Model};
//!
//! let (registry, probe) = SimRegistry::builder()
//!     .with_component("arm")
//!     .with_component("base")
//!     .with_catalog()
//!     .build();
//!
//! assert!(registry.lookup(&Api::component("arm"), &Model::builtin("fake")).is_some());
//! assert_eq!(probe.constructed(), 0);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ferrobot_types::{Api, Attributes, Extra, Model, ResourceConfig, ResourceName, RobotError};
use parking_lot::Mutex;
use serde_json::Value;

use crate::registry::{BuildContext, Capabilities, Matcher, Registration, Registry};
use crate::resource::{Command, Dependencies, Resource, Stoppable, WeakObserver, WeakUpdate};

// ─────────────────────────────────────────────────────────────────────────────
// Probe
// ─────────────────────────────────────────────────────────────────────────────

/// Something the runtime did to a simulated resource.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Constructed(ResourceName),
    Reconfigured(ResourceName),
    Closed(ResourceName),
    Stopped(ResourceName, Option<Extra>),
    WeakUpdated(ResourceName, WeakUpdate),
}

/// Shared log of [`SimEvent`]s. Clone it cheaply.
#[derive(Clone, Default)]
pub struct SimProbe {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl SimProbe {
    fn record(&self, event: SimEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn constructed(&self) -> usize {
        self.count(|e| matches!(e, SimEvent::Constructed(_)))
    }

    pub fn closed(&self) -> usize {
        self.count(|e| matches!(e, SimEvent::Closed(_)))
    }

    pub fn reconfigured(&self) -> usize {
        self.count(|e| matches!(e, SimEvent::Reconfigured(_)))
    }

    pub fn constructed_names(&self) -> Vec<ResourceName> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Constructed(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closed_names(&self) -> Vec<ResourceName> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Closed(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every stop call received by `name`, with the extras it carried.
    pub fn stops_for(&self, name: &ResourceName) -> Vec<Option<Extra>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Stopped(n, extra) if n == name => Some(extra.clone()),
                _ => None,
            })
            .collect()
    }

    /// The most recent weak-dependency update delivered to `name`.
    pub fn last_weak_update(&self, name: &ResourceName) -> Option<WeakUpdate> {
        self.events.lock().iter().rev().find_map(|e| match e {
            SimEvent::WeakUpdated(n, update) if n == name => Some(update.clone()),
            _ => None,
        })
    }

    fn count(&self, pred: impl Fn(&SimEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stub resource
// ─────────────────────────────────────────────────────────────────────────────

/// Stub behind every simulated model.
pub struct SimResource {
    name: ResourceName,
    in_place: bool,
    attributes: Mutex<Attributes>,
    moving: AtomicBool,
    closed: AtomicBool,
    probe: SimProbe,
}

impl SimResource {
    pub fn attributes(&self) -> Attributes {
        self.attributes.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), RobotError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RobotError::closed(&self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for SimResource {
    fn name(&self) -> &ResourceName {
        &self.name
    }

    async fn reconfigure(&self, _deps: &Dependencies, conf: &ResourceConfig) -> Result<(), RobotError> {
        self.ensure_open()?;
        if !self.in_place {
            return Err(RobotError::must_rebuild(&self.name));
        }
        *self.attributes.lock() = conf.attributes.clone();
        self.probe.record(SimEvent::Reconfigured(self.name.clone()));
        Ok(())
    }

    /// Understands `{"echo": v}`, `{"sleep_ms": n}` and `{"attributes": _}`.
    async fn do_command(&self, cmd: Command) -> Result<Command, RobotError> {
        self.ensure_open()?;
        let mut out = Command::new();
        out.insert("name".into(), Value::String(self.name.short_name()));
        if let Some(ms) = cmd.get("sleep_ms").and_then(Value::as_u64) {
            self.moving.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.moving.store(false, Ordering::SeqCst);
            out.insert("slept_ms".into(), ms.into());
        }
        if let Some(v) = cmd.get("echo") {
            out.insert("echo".into(), v.clone());
        }
        if cmd.contains_key("attributes") {
            out.insert("attributes".into(), Value::Object(self.attributes()));
        }
        Ok(out)
    }

    async fn close(&self) -> Result<(), RobotError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.probe.record(SimEvent::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

#[async_trait]
impl Stoppable for SimResource {
    async fn stop(&self, extra: Option<&Extra>) -> Result<(), RobotError> {
        self.ensure_open()?;
        self.moving.store(false, Ordering::SeqCst);
        self.probe
            .record(SimEvent::Stopped(self.name.clone(), extra.cloned()));
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool, RobotError> {
        Ok(self.moving.load(Ordering::SeqCst))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stub catalog service
// ─────────────────────────────────────────────────────────────────────────────

/// Service that keeps a list of every component it has been told about.
pub struct SimCatalog {
    name: ResourceName,
    members: Mutex<Vec<ResourceName>>,
    probe: SimProbe,
}

impl SimCatalog {
    pub fn members(&self) -> Vec<ResourceName> {
        self.members.lock().clone()
    }
}

#[async_trait]
impl Resource for SimCatalog {
    fn name(&self) -> &ResourceName {
        &self.name
    }

    async fn reconfigure(&self, _deps: &Dependencies, _conf: &ResourceConfig) -> Result<(), RobotError> {
        self.probe.record(SimEvent::Reconfigured(self.name.clone()));
        Ok(())
    }

    async fn do_command(&self, _cmd: Command) -> Result<Command, RobotError> {
        let members: Vec<Value> = self
            .members()
            .iter()
            .map(|n| Value::String(n.to_string()))
            .collect();
        let mut out = Command::new();
        out.insert("members".into(), Value::Array(members));
        Ok(out)
    }

    async fn close(&self) -> Result<(), RobotError> {
        self.probe.record(SimEvent::Closed(self.name.clone()));
        Ok(())
    }

    fn as_weak_observer(&self) -> Option<&dyn WeakObserver> {
        Some(self)
    }
}

#[async_trait]
impl WeakObserver for SimCatalog {
    async fn weak_dependencies_updated(&self, update: &WeakUpdate) -> Result<(), RobotError> {
        *self.members.lock() = update.members.clone();
        self.probe
            .record(SimEvent::WeakUpdated(self.name.clone(), update.clone()));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation and construction
// ─────────────────────────────────────────────────────────────────────────────

fn validate_sim(conf: &ResourceConfig) -> Result<Vec<String>, String> {
    if let Some(speed) = conf.attributes.get("speed") {
        match speed.as_f64() {
            Some(v) if v >= 0.0 => {}
            _ => return Err(format!("speed must be a non-negative number, got {speed}")),
        }
    }
    Ok(Vec::new())
}

async fn simulate_build(ctx: &BuildContext) -> Result<(), RobotError> {
    if let Some(ms) = ctx.config.attributes.get("build_delay_ms").and_then(Value::as_u64) {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(RobotError::Cancelled(format!("build of {}", ctx.name)));
            }
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }
    if let Some(reason) = ctx.config.attributes.get("fail_build").and_then(Value::as_str) {
        return Err(RobotError::build(&ctx.name, reason));
    }
    Ok(())
}

fn stub_registration(probe: &SimProbe, in_place: bool) -> Registration {
    let probe = probe.clone();
    Registration::new(move |ctx: BuildContext| {
        let probe = probe.clone();
        async move {
            simulate_build(&ctx).await?;
            probe.record(SimEvent::Constructed(ctx.name.clone()));
            Ok(Arc::new(SimResource {
                name: ctx.name,
                in_place,
                attributes: Mutex::new(ctx.config.attributes),
                moving: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                probe,
            }) as Arc<dyn Resource>)
        }
    })
    .with_validator(validate_sim)
    .with_capabilities(Capabilities {
        reconfigurable: in_place,
        closeable: true,
        stoppable: true,
    })
}

fn catalog_registration(probe: &SimProbe) -> Registration {
    let probe = probe.clone();
    Registration::new(move |ctx: BuildContext| {
        let probe = probe.clone();
        async move {
            simulate_build(&ctx).await?;
            probe.record(SimEvent::Constructed(ctx.name.clone()));
            Ok(Arc::new(SimCatalog {
                name: ctx.name,
                members: Mutex::new(Vec::new()),
                probe,
            }) as Arc<dyn Resource>)
        }
    })
    .with_weak_dependency(Matcher::Type("component".to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// SimRegistry builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder that constructs a [`Registry`] populated with simulated models.
#[derive(Default)]
pub struct SimRegistry {
    component_subtypes: Vec<String>,
    service_subtypes: Vec<String>,
    catalog: bool,
    limits: Vec<(Api, usize)>,
}

impl SimRegistry {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Register `fake` and `fake_rebuild` for `rdk:component:<subtype>`.
    pub fn with_component(mut self, subtype: &str) -> Self {
        self.component_subtypes.push(subtype.to_string());
        self
    }

    /// Register `fake` and `fake_rebuild` for `rdk:service:<subtype>`.
    pub fn with_service(mut self, subtype: &str) -> Self {
        self.service_subtypes.push(subtype.to_string());
        self
    }

    /// Register `catalog` for `rdk:service:catalog`.
    pub fn with_catalog(mut self) -> Self {
        self.catalog = true;
        self
    }

    pub fn with_max_instances(mut self, api: Api, limit: usize) -> Self {
        self.limits.push((api, limit));
        self
    }

    /// Consume the builder and return the registry with its probe.
    pub fn build(self) -> (Registry, SimProbe) {
        let probe = SimProbe::default();
        let mut registry = Registry::new();
        let apis = self
            .component_subtypes
            .iter()
            .map(Api::component)
            .chain(self.service_subtypes.iter().map(Api::service));
        for api in apis {
            registry.register(api.clone(), Model::builtin("fake"), stub_registration(&probe, true));
            registry.register(api, Model::builtin("fake_rebuild"), stub_registration(&probe, false));
        }
        if self.catalog {
            registry.register(
                Api::service("catalog"),
                Model::builtin("catalog"),
                catalog_registration(&probe),
            );
        }
        for (api, limit) in self.limits {
            registry.set_max_instances(api, limit);
        }
        (registry, probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx(conf: ResourceConfig) -> BuildContext {
        BuildContext {
            name: conf.resource_name(),
            config: conf,
            deps: Dependencies::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn fake_reconfigures_in_place() {
        let (registry, probe) = SimRegistry::builder().with_component("arm").build();
        let reg = registry
            .lookup(&Api::component("arm"), &Model::builtin("fake"))
            .unwrap();
        let conf = ResourceConfig::new("arm1", Api::component("arm"), Model::builtin("fake"));
        let arm = reg.construct(ctx(conf.clone())).await.unwrap();
        arm.reconfigure(&Dependencies::new(), &conf.with_attribute("speed", json!(2)))
            .await
            .unwrap();
        assert_eq!(probe.constructed(), 1);
        assert_eq!(probe.reconfigured(), 1);
    }

    #[tokio::test]
    async fn fake_rebuild_declines_in_place() {
        let (registry, _probe) = SimRegistry::builder().with_component("camera").build();
        let reg = registry
            .lookup(&Api::component("camera"), &Model::builtin("fake_rebuild"))
            .unwrap();
        assert!(!reg.capabilities.reconfigurable);
        let conf = ResourceConfig::new("cam1", Api::component("camera"), Model::builtin("fake_rebuild"));
        let cam = reg.construct(ctx(conf.clone())).await.unwrap();
        let err = cam.reconfigure(&Dependencies::new(), &conf).await.unwrap_err();
        assert!(err.is_must_rebuild());
    }

    #[test]
    fn negative_speed_fails_validation() {
        let (registry, _probe) = SimRegistry::builder().with_component("arm").build();
        let reg = registry
            .lookup(&Api::component("arm"), &Model::builtin("fake"))
            .unwrap();
        let conf = ResourceConfig::new("arm1", Api::component("arm"), Model::builtin("fake"))
            .with_attribute("speed", json!(-1));
        let err = reg.validate(&conf).unwrap_err();
        assert!(err.to_string().contains("speed must be a non-negative number"));
    }

    #[tokio::test]
    async fn fail_build_attribute_fails_construction() {
        let (registry, probe) = SimRegistry::builder().with_component("arm").build();
        let reg = registry
            .lookup(&Api::component("arm"), &Model::builtin("fake"))
            .unwrap();
        let conf = ResourceConfig::new("arm1", Api::component("arm"), Model::builtin("fake"))
            .with_attribute("fail_build", json!("no device at /dev/ttyUSB0"));
        let err = reg.construct(ctx(conf)).await.err().unwrap();
        assert!(err.to_string().contains("no device"));
        assert_eq!(probe.constructed(), 0);
    }

    #[tokio::test]
    async fn stop_records_extras() {
        let (registry, probe) = SimRegistry::builder().with_component("arm").build();
        let reg = registry
            .lookup(&Api::component("arm"), &Model::builtin("fake"))
            .unwrap();
        let conf = ResourceConfig::new("arm1", Api::component("arm"), Model::builtin("fake"));
        let arm = reg.construct(ctx(conf)).await.unwrap();
        let mut extra = Extra::new();
        extra.insert("force".into(), json!(true));
        arm.as_stoppable().unwrap().stop(Some(&extra)).await.unwrap();
        assert_eq!(
            probe.stops_for(&ResourceName::component("arm", "arm1")),
            vec![Some(extra)]
        );
    }

    #[tokio::test]
    async fn catalog_tracks_membership() {
        let (registry, probe) = SimRegistry::builder().with_catalog().build();
        let reg = registry
            .lookup(&Api::service("catalog"), &Model::builtin("catalog"))
            .unwrap();
        assert!(reg.weakly_depends_on(&ResourceName::component("arm", "arm1")));
        let conf = ResourceConfig::new("cat", Api::service("catalog"), Model::builtin("catalog"));
        let cat = reg.construct(ctx(conf)).await.unwrap();
        let update = WeakUpdate {
            members: vec![ResourceName::component("arm", "arm1")],
            added: vec![ResourceName::component("arm", "arm1")],
            removed: Vec::new(),
        };
        cat.as_weak_observer()
            .unwrap()
            .weak_dependencies_updated(&update)
            .await
            .unwrap();
        assert_eq!(
            probe.last_weak_update(&ResourceName::service("catalog", "cat")),
            Some(update)
        );
    }
}
