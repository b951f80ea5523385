//! Handler registration and weighted type selection.
//!
//! A task type maps to a [`Registration`]: the handler, its selection
//! weight, and optional result and heartbeat callbacks. Any async closure
//! with the right shape implements the callback traits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::TaskRecord;

/// Executes one task's params. `Ok(Some(v))` is a result for the result
/// callback; any `Err` routes the task to `error`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, params: Value) -> anyhow::Result<Option<Value>>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    async fn handle(&self, params: Value) -> anyhow::Result<Option<Value>> {
        (self)(params).await
    }
}

/// Invoked with the task and its handler result before acknowledgement.
/// An `Err` routes the task to `error` instead of `done`.
#[async_trait]
pub trait ResultCallback: Send + Sync + 'static {
    async fn on_result(&self, task: TaskRecord, result: Option<Value>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ResultCallback for F
where
    F: Fn(TaskRecord, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_result(&self, task: TaskRecord, result: Option<Value>) -> anyhow::Result<()> {
        (self)(task, result).await
    }
}

/// What a heartbeat reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heartbeat {
    /// Fired from the poll loop, whether or not work is held.
    Idle { task_type: String },
    /// Fired on a timer while a handler runs.
    Busy { task: TaskRecord },
}

impl Heartbeat {
    pub fn task_type(&self) -> &str {
        match self {
            Heartbeat::Idle { task_type } => task_type,
            Heartbeat::Busy { task } => &task.task_type,
        }
    }
}

/// Liveness signal. Failures are logged and never affect task state.
#[async_trait]
pub trait HeartbeatCallback: Send + Sync + 'static {
    async fn beat(&self, heartbeat: Heartbeat) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> HeartbeatCallback for F
where
    F: Fn(Heartbeat) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn beat(&self, heartbeat: Heartbeat) -> anyhow::Result<()> {
        (self)(heartbeat).await
    }
}

#[derive(Clone)]
pub(crate) struct HeartbeatConfig {
    pub(crate) callback: Arc<dyn HeartbeatCallback>,
    pub(crate) interval: Duration,
}

/// Everything the scheduler knows about one task type.
#[derive(Clone)]
pub struct Registration {
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub(crate) weight: u32,
    pub(crate) on_result: Option<Arc<dyn ResultCallback>>,
    pub(crate) heartbeat: Option<HeartbeatConfig>,
}

impl Registration {
    /// A registration with weight 1 and no callbacks.
    pub fn new(handler: impl TaskHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            weight: 1,
            on_result: None,
            heartbeat: None,
        }
    }

    /// Relative selection probability. Must be at least 1.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn on_result(mut self, callback: impl ResultCallback) -> Self {
        self.on_result = Some(Arc::new(callback));
        self
    }

    pub fn heartbeat(mut self, callback: impl HeartbeatCallback, interval: Duration) -> Self {
        self.heartbeat = Some(HeartbeatConfig {
            callback: Arc::new(callback),
            interval,
        });
        self
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("weight", &self.weight)
            .field("on_result", &self.on_result.is_some())
            .field("heartbeat", &self.heartbeat.as_ref().map(|h| h.interval))
            .finish()
    }
}

/// Registered task types and their selection weights.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
    /// Types in registration order, parallel to `weights`.
    order: Vec<String>,
    weights: Option<WeightedIndex<u32>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task_type`, replacing any prior entry. Returns true if an
    /// entry was replaced.
    pub fn register(&mut self, task_type: &str, registration: Registration) -> Result<bool> {
        if registration.weight == 0 {
            return Err(Error::Registration(format!(
                "weight for '{task_type}' must be at least 1"
            )));
        }
        if registration
            .heartbeat
            .as_ref()
            .is_some_and(|hb| hb.interval.is_zero())
        {
            return Err(Error::Registration(format!(
                "heartbeat interval for '{task_type}' must be non-zero"
            )));
        }

        let replaced = self
            .entries
            .insert(task_type.to_string(), registration)
            .is_some();
        if replaced {
            warn!(task_type, "handler re-registered, replacing previous entry");
        } else {
            self.order.push(task_type.to_string());
        }
        self.rebuild_weights()?;
        Ok(replaced)
    }

    fn rebuild_weights(&mut self) -> Result<()> {
        let weights = self.order.iter().map(|t| self.entries[t].weight);
        let index = WeightedIndex::new(weights)
            .map_err(|e| Error::Registration(format!("invalid weights: {e}")))?;
        self.weights = Some(index);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Registration> {
        self.entries.get(task_type)
    }

    /// Registered types in registration order.
    pub fn types(&self) -> &[String] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Pick a type with probability proportional to its weight.
    pub fn pick(&self) -> Option<&str> {
        let weights = self.weights.as_ref()?;
        let i = weights.sample(&mut rand::rng());
        self.order.get(i).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop_handler(_params: Value) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    fn noop() -> Registration {
        Registration::new(noop_handler)
    }

    #[test]
    fn zero_weight_is_rejected() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register("t", noop().weight(0)).is_err());
        assert!(registry.is_empty());
        assert!(registry.pick().is_none());
    }

    #[test]
    fn reregistering_replaces_entry() {
        let mut registry = HandlerRegistry::new();
        assert!(!registry.register("t", noop()).unwrap());
        assert!(registry.register("t", noop().weight(3)).unwrap());
        assert_eq!(registry.types(), ["t".to_string()]);
        assert_eq!(registry.get("t").unwrap().weight, 3);
    }

    #[test]
    fn pick_follows_weights() {
        let mut registry = HandlerRegistry::new();
        registry.register("heavy", noop().weight(3)).unwrap();
        registry.register("light", noop().weight(1)).unwrap();

        let mut heavy = 0;
        for _ in 0..4000 {
            if registry.pick() == Some("heavy") {
                heavy += 1;
            }
        }
        // expected 3000
        assert!((2700..3300).contains(&heavy), "heavy picked {heavy} times");
    }

    #[test]
    fn single_type_is_always_picked() {
        let mut registry = HandlerRegistry::new();
        registry.register("only", noop()).unwrap();
        assert!((0..50).all(|_| registry.pick() == Some("only")));
    }
}
