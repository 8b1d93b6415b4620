//! Demultiplexes the Event Queue onto per-destination commit workers by
//! destination key. One task;
//! spawns a `CommitWorker` task the first time a destination is seen and
//! reuses its mailbox afterward.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use kube::Client;
use tokio::sync::mpsc;
use tracing::warn;

use crate::destination::DestinationResolver;
use crate::encryption::EncryptionAdapter;
use crate::event::Event;
use crate::leader::LeaderArbiter;
use crate::metrics::Metrics;
use crate::queue::EventQueueReceiver;
use crate::worker::{CommitWorker, HealthSink, NoopHealthSink};

pub struct Dispatcher {
    client: Client,
    resolver: Arc<DestinationResolver>,
    base_dir: PathBuf,
    health: Arc<dyn HealthSink>,
    leader: Arc<LeaderArbiter>,
    metrics: Option<Metrics>,
    workers: HashMap<String, mpsc::UnboundedSender<Event>>,
}

impl Dispatcher {
    pub fn new(client: Client, resolver: Arc<DestinationResolver>, base_dir: PathBuf, leader: Arc<LeaderArbiter>) -> Self {
        Self {
            client,
            resolver,
            base_dir,
            health: Arc::new(NoopHealthSink),
            leader,
            metrics: None,
            workers: HashMap::new(),
        }
    }

    pub fn with_health_sink(mut self, health: Arc<dyn HealthSink>) -> Self {
        self.health = health;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Drains `receiver` until the queue closes. While the process is
    /// not leader, events are dropped rather than routed — only the
    /// leader runs commit workers.
    pub async fn run(mut self, mut receiver: EventQueueReceiver) {
        while let Some(event) = receiver.recv().await {
            if !self.leader.is_leader() {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .events_dropped_total
                        .get_or_create(&crate::metrics::ReasonLabel { reason: "not_leader".into() })
                        .inc();
                }
                continue;
            }
            if let Some(metrics) = &self.metrics {
                metrics.events_queued_total.inc();
            }
            if let Err(e) = self.route(event).await {
                warn!(error = %e, "failed to route event to a commit worker");
                if let Some(metrics) = &self.metrics {
                    metrics
                        .events_dropped_total
                        .get_or_create(&crate::metrics::ReasonLabel { reason: "resolve_failed".into() })
                        .inc();
                }
            }
        }
        // Queue closed (shutdown): mailboxes are dropped, each worker
        // observes its own channel close and performs its final flush.
    }

    async fn route(&mut self, event: Event) -> Result<(), crate::destination::Error> {
        let destination = self
            .resolver
            .resolve(&event.rule_namespace, &event.destination_ref)
            .await?;
        let worker_key = destination.worker_key();

        let sender = self.workers.entry(worker_key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let encryption = destination
                .encryption
                .as_ref()
                .map(|_| EncryptionAdapter::new(self.client.clone()));
            let worker = CommitWorker::new(destination.clone(), &self.base_dir, encryption, self.health.clone());
            tokio::spawn(worker.run(rx));
            tx
        });

        // A destination's generation can change the worker_key itself
        // (branch change); stale senders whose receiver has dropped are
        // simply replaced on next insert attempt via `entry` above once
        // `send` starts failing, since a dead mailbox means the worker
        // task already exited after a final flush.
        if sender.send(event).is_err() {
            self.workers.remove(&worker_key);
            if let Some(metrics) = &self.metrics {
                metrics
                    .events_dropped_total
                    .get_or_create(&crate::metrics::ReasonLabel { reason: "worker_gone".into() })
                    .inc();
            }
        }
        Ok(())
    }
}
