//! Worker registry: queue name to worker definitions

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

use sv_common::Payload;

use crate::worker::{ResolvedWorker, WorkerDefinition};
use crate::{DispatchError, Result};

#[derive(Default)]
struct QueueWorkers {
    /// Name of the worker that handles the queue
    active: String,
    /// Every worker registered for the queue, in registration order
    registered: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    definitions: IndexMap<String, Arc<WorkerDefinition>>,
    queues: IndexMap<String, QueueWorkers>,
}

/// Maps queues to workers and resolves the worker for a message.
#[derive(Default)]
pub struct WorkerRegistry {
    state: RwLock<RegistryState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for its queue.
    ///
    /// Fails for a name already registered on another queue, for a second
    /// batch worker on a queue whose active worker is a batch worker, and for
    /// a second dispatcher on the same queue. An active
    /// dispatcher keeps the queue when a plain worker registers after it.
    pub fn register_worker(&self, definition: WorkerDefinition) -> Result<()> {
        let mut state = self.state.write();
        let queue = definition.queue().to_string();
        let name = definition.name().to_string();

        if let Some(bound) = state.definitions.get(&name) {
            if bound.queue() != queue {
                return Err(DispatchError::InvalidWorkerRegistration(format!(
                    "could not register {} for {}: the name is already bound to {}",
                    name,
                    queue,
                    bound.queue()
                )));
            }
        }

        if let Some(existing) = state.queues.get(&queue) {
            let active = state.definitions.get(&existing.active).cloned();
            if let Some(active) = active {
                if active.name() != name {
                    if definition.options().batch && active.options().batch {
                        return Err(DispatchError::InvalidWorkerRegistration(format!(
                            "could not register {} for {}: {} is already a batch worker for that queue",
                            name,
                            queue,
                            active.name()
                        )));
                    }
                    if definition.is_dispatcher() && active.is_dispatcher() {
                        return Err(DispatchError::InvalidWorkerRegistration(format!(
                            "could not register dispatcher {} for {}: {} already dispatches that queue",
                            name,
                            queue,
                            active.name()
                        )));
                    }
                }
            }
        }

        let keep_active = state
            .queues
            .get(&queue)
            .and_then(|existing| state.definitions.get(&existing.active))
            .map(|active| active.is_dispatcher() && !definition.is_dispatcher() && active.name() != name)
            .unwrap_or(false);

        state.definitions.insert(name.clone(), Arc::new(definition));
        let entry = state.queues.entry(queue.clone()).or_default();
        if !entry.registered.contains(&name) {
            entry.registered.push(name.clone());
        }
        if keep_active {
            debug!(queue = %queue, worker = %name, active = %entry.active, "Dispatcher keeps queue");
        } else {
            entry.active = name.clone();
            debug!(queue = %queue, worker = %name, "Worker registered");
        }
        Ok(())
    }

    /// Resolve the worker for a payload: an explicit `shoryuken_class`
    /// attribute on a single message first, then the queue's active worker.
    pub fn fetch_worker(&self, queue: &str, payload: &Payload) -> Option<ResolvedWorker> {
        let state = self.state.read();

        let explicit = payload.single().and_then(|m| m.worker_class()).and_then(|class| {
            let found = state.definitions.get(class).cloned();
            if found.is_none() {
                warn!(queue = %queue, worker = %class, "Worker named by message attribute is not registered");
            }
            found
        });

        let definition = explicit.or_else(|| {
            state
                .queues
                .get(queue)
                .and_then(|workers| state.definitions.get(&workers.active))
                .cloned()
        })?;

        let instance = definition.instantiate();
        Some(ResolvedWorker { definition, instance })
    }

    /// Whether the queue's worker wants batches
    pub fn batch_receive_messages(&self, queue: &str) -> bool {
        self.definition_for(queue)
            .map(|definition| definition.options().batch)
            .unwrap_or(false)
    }

    /// The active worker definition for a queue
    pub fn definition_for(&self, queue: &str) -> Option<Arc<WorkerDefinition>> {
        let state = self.state.read();
        state
            .queues
            .get(queue)
            .and_then(|workers| state.definitions.get(&workers.active))
            .cloned()
    }

    /// A worker definition by name
    pub fn definition(&self, name: &str) -> Option<Arc<WorkerDefinition>> {
        self.state.read().definitions.get(name).cloned()
    }

    pub fn queues(&self) -> Vec<String> {
        self.state.read().queues.keys().cloned().collect()
    }

    /// Names of the workers registered for a queue, in registration order
    pub fn workers(&self, queue: &str) -> Vec<String> {
        self.state
            .read()
            .queues
            .get(queue)
            .map(|workers| workers.registered.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.definitions.clear();
        state.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Body, Worker, WorkerOptions};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sv_common::{MessageAttributeValue, ReceivedMessage, WORKER_CLASS_ATTRIBUTE};

    struct NoopWorker;

    #[async_trait]
    impl Worker for NoopWorker {
        async fn perform(&self, _payload: &Payload, _body: &Body) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn definition(name: &str, options: WorkerOptions) -> WorkerDefinition {
        WorkerDefinition::new(name, options, || NoopWorker)
    }

    fn message(class: Option<&str>) -> ReceivedMessage {
        let mut message_attributes = HashMap::new();
        if let Some(class) = class {
            message_attributes.insert(WORKER_CLASS_ATTRIBUTE.to_string(), MessageAttributeValue::string(class));
        }
        ReceivedMessage {
            message_id: "m-1".to_string(),
            body: String::new(),
            attributes: HashMap::new(),
            message_attributes,
            receipt_handle: "rh".to_string(),
            queue_name: "default".to_string(),
        }
    }

    #[test]
    fn test_later_registration_replaces_earlier() {
        let registry = WorkerRegistry::new();
        registry.register_worker(definition("First", WorkerOptions::new("default"))).unwrap();
        registry.register_worker(definition("Second", WorkerOptions::new("default"))).unwrap();

        let resolved = registry.fetch_worker("default", &Payload::Single(message(None))).unwrap();
        assert_eq!(resolved.name(), "Second");
        assert_eq!(registry.workers("default"), vec!["First", "Second"]);
        assert_eq!(registry.queues(), vec!["default"]);
    }

    #[test]
    fn test_second_batch_worker_rejected() {
        let registry = WorkerRegistry::new();
        registry
            .register_worker(definition("BatchA", WorkerOptions::new("events").batch(true)))
            .unwrap();
        let err = registry
            .register_worker(definition("BatchB", WorkerOptions::new("events").batch(true)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidWorkerRegistration(_)));
        assert!(registry.batch_receive_messages("events"));

        // Re-registering the same worker is allowed
        registry
            .register_worker(definition("BatchA", WorkerOptions::new("events").batch(true)))
            .unwrap();
    }

    #[test]
    fn test_worker_name_is_bound_to_one_queue() {
        let registry = WorkerRegistry::new();
        registry
            .register_worker(definition("ReportWorker", WorkerOptions::new("reports").auto_delete(true)))
            .unwrap();
        let err = registry
            .register_worker(definition("ReportWorker", WorkerOptions::new("exports").batch(true)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidWorkerRegistration(_)));

        let resolved = registry.fetch_worker("reports", &Payload::Single(message(None))).unwrap();
        assert_eq!(resolved.definition.queue(), "reports");
        assert!(resolved.options().auto_delete);
        assert!(!resolved.options().batch);
        assert!(registry.workers("exports").is_empty());
    }

    #[test]
    fn test_dispatcher_rules() {
        let registry = WorkerRegistry::new();
        registry.register_worker(definition("Plain", WorkerOptions::new("jobs"))).unwrap();
        registry
            .register_worker(definition("JobDispatcher", WorkerOptions::new("jobs")).dispatcher())
            .unwrap();
        registry.register_worker(definition("Late", WorkerOptions::new("jobs"))).unwrap();

        assert_eq!(registry.definition_for("jobs").unwrap().name(), "JobDispatcher");
        assert_eq!(registry.workers("jobs"), vec!["Plain", "JobDispatcher", "Late"]);

        let err = registry
            .register_worker(definition("OtherDispatcher", WorkerOptions::new("jobs")).dispatcher())
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidWorkerRegistration(_)));
    }

    #[test]
    fn test_worker_class_attribute_overrides_queue_worker() {
        let registry = WorkerRegistry::new();
        registry.register_worker(definition("QueueWorker", WorkerOptions::new("default"))).unwrap();
        registry.register_worker(definition("ReportWorker", WorkerOptions::new("reports"))).unwrap();

        let explicit = registry.fetch_worker("default", &Payload::Single(message(Some("ReportWorker"))));
        assert_eq!(explicit.unwrap().name(), "ReportWorker");

        let unknown = registry.fetch_worker("default", &Payload::Single(message(Some("Missing"))));
        assert_eq!(unknown.unwrap().name(), "QueueWorker");

        // Batches ignore the attribute
        let batch = registry.fetch_worker("default", &Payload::Batch(vec![message(Some("ReportWorker"))]));
        assert_eq!(batch.unwrap().name(), "QueueWorker");

        assert!(registry.fetch_worker("unknown", &Payload::Single(message(None))).is_none());
    }

    #[test]
    fn test_fetch_worker_returns_fresh_instances() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let registry = WorkerRegistry::new();
        registry
            .register_worker(WorkerDefinition::new("Counted", WorkerOptions::new("default"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                NoopWorker
            }))
            .unwrap();

        registry.fetch_worker("default", &Payload::Single(message(None)));
        registry.fetch_worker("default", &Payload::Single(message(None)));
        assert_eq!(created.load(Ordering::SeqCst), 2);

        registry.clear();
        assert!(registry.queues().is_empty());
    }
}
