use crate::config::ControllerConfig;
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileOutcome, ReconcileRequest, VersionedWorkloadReconciler};
use crate::reference::ReferenceIndex;
use crate::registry::{KindRegistry, KindRole};
use crate::{ControllerError, Result};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{ResourceEvent, WorkloadTemplate};
use strata_storage::{list_resources, ResourceStore};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drains the work queue: one reconcile per item, under a deadline, with
/// retryable failures requeued after backoff
#[derive(Clone)]
struct Worker {
    queue: Arc<WorkQueue<ReconcileRequest>>,
    reconciler: Arc<VersionedWorkloadReconciler>,
    reconcile_timeout: Duration,
}

impl Worker {
    /// Process one item; `false` once the queue has shut down
    async fn process_next(&self) -> bool {
        let Some(request) = self.queue.get().await else {
            return false;
        };

        let result =
            match tokio::time::timeout(self.reconcile_timeout, self.reconciler.reconcile(&request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ControllerError::timeout(
                    request.to_string(),
                    self.reconcile_timeout.as_secs(),
                )),
            };

        match result {
            Ok(outcome) => {
                self.queue.forget(&request);
                match outcome {
                    ReconcileOutcome::Created { version, shards } => {
                        info!(
                            "Reconciled {}: created version {} ({})",
                            request,
                            version,
                            shards.join(", ")
                        );
                    }
                    ReconcileOutcome::Unchanged { version } => {
                        debug!("Reconciled {}: version {} is current", request, version);
                    }
                    ReconcileOutcome::TemplateMissing => {
                        debug!("Reconciled {}: template is gone", request);
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                let delay = self.queue.add_rate_limited(request.clone());
                warn!("Reconcile of {} failed, retrying in {:?}: {}", request, delay, e);
            }
            Err(e) => {
                self.queue.forget(&request);
                error!("Reconcile of {} failed permanently: {}", request, e);
            }
        }

        self.queue.done(&request);
        true
    }

    async fn run(self, id: usize) {
        debug!("Worker {} started", id);
        while self.process_next().await {}
        debug!("Worker {} stopped", id);
    }
}

/// Connects the store's event bus to the reconciler through a work queue
/// drained by a fixed pool of workers
pub struct WorkloadController {
    store: Arc<dyn ResourceStore>,
    index: ReferenceIndex,
    registry: KindRegistry,
    worker: Worker,
    config: ControllerConfig,
}

impl WorkloadController {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: KindRegistry,
        config: ControllerConfig,
    ) -> Self {
        let worker = Worker {
            queue: Arc::new(WorkQueue::new(config.backoff.clone())),
            reconciler: Arc::new(VersionedWorkloadReconciler::new(
                store.clone(),
                registry.clone(),
            )),
            reconcile_timeout: config.reconcile_timeout,
        };

        Self {
            index: ReferenceIndex::new(store.clone(), registry.clone()),
            store,
            registry,
            worker,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ReconcileRequest>> {
        &self.worker.queue
    }

    /// Run until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting workload controller ({} workers, reconcile timeout {:?})",
            self.config.workers, self.config.reconcile_timeout
        );

        // Subscribe before listing so no change between the two is missed
        let mut events = self.store.subscribe();

        if self.config.resync_on_start {
            let count = self.enqueue_all().await?;
            info!("Queued {} existing template(s)", count);
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(self.worker.clone().run(id));
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Workload controller shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            warn!("Failed to handle event for {}: {}", event.resource_key, e);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Event bus lagged by {} events, resyncing all templates", missed);
                        if let Err(e) = self.enqueue_all().await {
                            error!("Resync failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                },
            }
        }

        self.worker.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        info!("Workload controller stopped");
        Ok(())
    }

    /// Turn one store event into zero or more reconcile requests
    pub async fn handle_event(&self, event: &ResourceEvent) -> Result<()> {
        let key = &event.resource_key;

        match self.registry.role(&key.gvk) {
            Some(KindRole::Template) => {
                self.worker
                    .queue
                    .add(ReconcileRequest::new(key.namespace.clone(), key.name.clone()));
            }
            Some(KindRole::Config(_)) => {
                for request in self.index.resolve_event(key).await? {
                    debug!("{} changed, queueing {}", key, request);
                    self.worker.queue.add(request);
                }
            }
            Some(KindRole::Instance) | None => {}
        }

        Ok(())
    }

    /// Queue every template in the store; returns how many were queued
    pub async fn enqueue_all(&self) -> Result<usize> {
        let templates: Vec<WorkloadTemplate> = list_resources(self.store.as_ref(), None).await?;
        for template in &templates {
            self.worker.queue.add(ReconcileRequest::for_template(template));
        }
        Ok(templates.len())
    }
}
