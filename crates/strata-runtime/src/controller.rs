//! Worker pool driving a [`Reconciler`] from the work queue

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use strata_common::store::{ObjectKind, StateStore};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{dispatch, resync_loop, Action, ObjectKey, WorkQueue};

/// One reconcile pass for one resource identity
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Error returned by a failed pass
    type Error: Display + Send + Sync + 'static;

    /// Drive `key` one step toward its desired state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Self::Error>;

    /// Decide when to retry after the `attempt`-th consecutive failure (1-based)
    fn error_policy(&self, key: &ObjectKey, error: &Self::Error, attempt: u32) -> Action;
}

/// Pool and watch settings
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Interval between full resyncs
    pub resync_interval: Duration,
    /// Namespace to watch (all when None)
    pub namespace: Option<String>,
}

/// Runs a reconciler over a worker pool fed by watches and resync
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: Arc<dyn StateStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ControllerConfig,
}

impl<R: Reconciler> Controller<R> {
    /// Create a controller; nothing runs until [`run`](Self::run)
    pub fn new(reconciler: Arc<R>, store: Arc<dyn StateStore>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            store,
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    /// The queue feeding the workers
    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    /// Run until `shutdown` resolves, then let in-flight passes finish
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) {
        let streams = [ObjectKind::Cluster, ObjectKind::Pod, ObjectKind::Service]
            .into_iter()
            .map(|kind| self.store.watch(kind, self.config.namespace.clone()))
            .collect();
        let dispatcher = tokio::spawn(dispatch(streams, Arc::clone(&self.queue)));
        let resync = tokio::spawn(resync_loop(
            Arc::clone(&self.store),
            self.config.namespace.clone(),
            self.config.resync_interval,
            Arc::clone(&self.queue),
        ));

        let workers = self.spawn_workers();
        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            namespace = self.config.namespace.as_deref().unwrap_or("*"),
            "Controller started"
        );

        shutdown.await;
        info!("Shutdown requested, draining in-flight reconciles");

        dispatcher.abort();
        resync.abort();
        self.queue.shutdown();
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Controller stopped");
    }

    /// Start the worker pool without watches or resync
    pub fn spawn_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let attempts: Arc<Mutex<HashMap<ObjectKey, u32>>> = Arc::default();
        (0..self.config.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    reconciler: Arc::clone(&self.reconciler),
                    queue: Arc::clone(&self.queue),
                    attempts: Arc::clone(&attempts),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Worker<R: Reconciler> {
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    attempts: Arc<Mutex<HashMap<ObjectKey, u32>>>,
}

impl<R: Reconciler> Worker<R> {
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            let span = info_span!("reconcile", cluster = %key, worker = self.id);
            let action = self.process(&key).instrument(span).await;
            self.queue.done(&key);
            if let Some(delay) = action.requeue_after() {
                self.queue.add_after(key, delay);
            }
        }
        debug!(worker = self.id, "Worker exiting");
    }

    async fn process(&self, key: &ObjectKey) -> Action {
        match self.reconciler.reconcile(key).await {
            Ok(action) => {
                self.attempts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
                action
            }
            Err(error) => {
                let attempt = {
                    let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
                    let count = attempts.entry(key.clone()).or_insert(0);
                    *count = count.saturating_add(1);
                    *count
                };
                self.reconciler.error_policy(key, &error, attempt)
            }
        }
    }
}
