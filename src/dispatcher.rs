//! Chunk dispatch: planning requests, queueing chunk units and running them on workers.

use crate::aggregator::{Aggregator, ChunkResult};
use crate::cli::CommandLineArgs;
use crate::error::CubeflowError;
use crate::metrics::{CHUNK_TIME_COLLECTOR, DISPATCHED_CHUNKS, PROCESSED_CHUNKS};
use crate::models::{ChunkUnit, Metadata, RequestRecord, RequestStatus};
use crate::planner::{self, ChunkPlan};
use crate::registry::{ChunkOutput, Registry};
use crate::resource_manager::ResourceManager;
use crate::store::RequestStore;

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, watch};
use tracing::Level;
use uuid::Uuid;

/// Message recorded for requests without any acquisition.
pub const NO_ACQUISITIONS: &str = "There are no acquisitions for this parameter set.";

/// A chunk unit on the queue, addressed to the worker of an application.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub task_name: String,
    pub request_id: Uuid,
    pub unit: ChunkUnit,
}

/// State shared by the queue consumer and the chunk workers.
struct Worker {
    registry: Arc<Registry>,
    store: Arc<dyn RequestStore>,
    aggregator: Arc<Aggregator>,
    resource_manager: Arc<ResourceManager>,
    use_rayon: bool,
    outstanding: Arc<watch::Sender<usize>>,
}

impl Worker {
    /// Receive envelopes until every sender is dropped, running each on its own task.
    async fn consume(self: Arc<Self>, mut receiver: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = receiver.recv().await {
            let permit = match self.resource_manager.task().await {
                Ok(permit) => permit,
                Err(err) => {
                    tracing::event!(Level::ERROR, "Stopping chunk consumer: {}", err);
                    break;
                }
            };
            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle(envelope).await;
                drop(permit);
                worker.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            });
        }
    }

    #[tracing::instrument(
        level = "DEBUG",
        skip(self, envelope),
        fields(request = %envelope.request_id, chunk = %envelope.unit.chunk_id)
    )]
    async fn handle(&self, envelope: Envelope) {
        let chunk_id = envelope.unit.chunk_id;
        let scene_count = envelope.unit.scene_count();
        let timer = CHUNK_TIME_COLLECTOR
            .with_label_values(&[&envelope.task_name])
            .start_timer();
        let output = match self.run(&envelope).await {
            Ok(Some(output)) => Ok(output),
            Ok(None) => {
                timer.stop_and_discard();
                return;
            }
            Err(err) => {
                tracing::event!(Level::WARN, "Chunk {} failed: {}", chunk_id, err);
                Err(err.to_string())
            }
        };
        timer.observe_duration();
        let outcome = if output.is_ok() { "ok" } else { "error" };
        PROCESSED_CHUNKS
            .with_label_values(&[&envelope.task_name, outcome])
            .inc();

        let result = ChunkResult {
            chunk_id,
            scene_count,
            output,
        };
        if let Err(err) = self
            .aggregator
            .merge_chunk(envelope.request_id, result)
            .await
        {
            tracing::event!(Level::ERROR, "Failed to merge chunk {}: {}", chunk_id, err);
        }
    }

    /// Process the unit of an envelope.
    ///
    /// Returns `None` when the request no longer exists or is no longer pending.
    async fn run(&self, envelope: &Envelope) -> Result<Option<ChunkOutput>, CubeflowError> {
        let application = self.registry.get(&envelope.task_name)?;
        let Some(record) = self.store.get(envelope.request_id)? else {
            tracing::event!(Level::DEBUG, "Request no longer exists, dropping chunk");
            return Ok(None);
        };
        if record.outcome.status != RequestStatus::Pending {
            tracing::event!(Level::DEBUG, "Request is {}, dropping chunk", record.outcome.status);
            return Ok(None);
        }

        let parameters = record.parameters;
        let unit = envelope.unit.clone();
        let result = if self.use_rayon {
            tokio_rayon::spawn(move || application.process_chunk(&parameters, &unit)).await
        } else {
            tokio::task::spawn_blocking(move || application.process_chunk(&parameters, &unit))
                .await?
        };
        let output = result.map_err(|err| CubeflowError::ChunkProcessing {
            chunk: envelope.unit.chunk_id.to_string(),
            message: err.to_string(),
        })?;
        Ok(Some(output))
    }
}

/// Send the units of a plan to the queue, waiting for space as needed.
async fn feed(
    sender: mpsc::Sender<Envelope>,
    outstanding: Arc<watch::Sender<usize>>,
    aggregator: Arc<Aggregator>,
    task_name: String,
    request_id: Uuid,
    plan: ChunkPlan,
) {
    let mut unsent = plan.units.len();
    for unit in plan.units {
        let envelope = Envelope {
            task_name: task_name.clone(),
            request_id,
            unit,
        };
        if sender.send(envelope).await.is_err() {
            break;
        }
        DISPATCHED_CHUNKS.with_label_values(&[&task_name]).inc();
        unsent -= 1;
    }
    if unsent == 0 {
        return;
    }

    tracing::event!(
        Level::ERROR,
        "Dispatch queue closed with {} units of request {} unsent",
        unsent,
        request_id
    );
    outstanding.send_modify(|n| *n = n.saturating_sub(unsent));
    aggregator.forget(request_id).await;
    let message = CubeflowError::DispatchQueueClosed.to_string();
    if let Err(err) = aggregator.finish(request_id, RequestStatus::Error, message, None, None) {
        tracing::event!(Level::ERROR, "Failed to finish request {}: {}", request_id, err);
    }
}

/// Plans requests into chunk units and feeds them to a pool of workers.
///
/// Units are queued on a bounded channel by a feeder task per dispatched request, so
/// dispatching never waits for queue space. A single consumer takes a task permit from the
/// [ResourceManager](crate::resource_manager::ResourceManager) for each unit, so at most
/// `worker_limit` units are processed concurrently.
pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<dyn RequestStore>,
    aggregator: Arc<Aggregator>,
    sender: mpsc::Sender<Envelope>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl Dispatcher {
    /// Create the queue and spawn its consumer on the current runtime.
    pub fn start(
        registry: Arc<Registry>,
        store: Arc<dyn RequestStore>,
        aggregator: Arc<Aggregator>,
        resource_manager: Arc<ResourceManager>,
        args: &CommandLineArgs,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(args.queue_capacity.max(1));
        let (outstanding, _) = watch::channel(0);
        let outstanding = Arc::new(outstanding);
        let worker = Arc::new(Worker {
            registry: registry.clone(),
            store: store.clone(),
            aggregator: aggregator.clone(),
            resource_manager,
            use_rayon: args.use_rayon,
            outstanding: outstanding.clone(),
        });
        tokio::spawn(worker.consume(receiver));
        Self {
            registry,
            store,
            aggregator,
            sender,
            outstanding,
        }
    }

    /// Plan a pending request and queue its chunk units.
    ///
    /// Planning failures finish the request with an error. Returns the number of units
    /// queued, which is zero for a request without acquisitions.
    #[tracing::instrument(level = "DEBUG", skip(self, record), fields(request = %record.id))]
    pub async fn dispatch(&self, record: &RequestRecord) -> Result<usize, CubeflowError> {
        match self.try_dispatch(record).await {
            Ok(count) => Ok(count),
            Err(err) => {
                tracing::event!(Level::WARN, "Failed to dispatch request {}: {}", record.id, err);
                self.aggregator.forget(record.id).await;
                self.aggregator
                    .finish(record.id, RequestStatus::Error, err.to_string(), None, None)?;
                Err(err)
            }
        }
    }

    async fn try_dispatch(&self, record: &RequestRecord) -> Result<usize, CubeflowError> {
        let application = self.registry.get(&record.parameters.application)?;
        let times = application.acquisition_dates(&record.parameters)?;
        if times.is_empty() {
            self.aggregator.finish(
                record.id,
                RequestStatus::Error,
                NO_ACQUISITIONS.to_string(),
                None,
                None,
            )?;
            return Ok(0);
        }

        let plan = planner::plan(
            record.id,
            &record.parameters,
            &times,
            application.chunk_sizing(),
            application.reverse_time(),
        )?;
        let total_scenes = plan.total_scenes();
        let record = self.store.update(record.id, &mut |record| {
            record.outcome.scenes_processed = 0;
            record.outcome.total_scenes = total_scenes;
            record.metadata = Metadata::default();
            Ok(())
        })?;
        tracing::event!(
            Level::INFO,
            "Dispatching request {} as {} chunks of {} scenes",
            record.id,
            plan.expected(),
            total_scenes
        );
        self.aggregator.expect(record.id, &plan).await;
        self.submit(&record, plan)
    }

    /// Queue every unit of a plan for the worker of the record's application.
    ///
    /// Units count as outstanding immediately and are fed to the queue by a spawned task.
    /// Should the queue close before every unit is sent, the request finishes with an error.
    pub fn submit(&self, record: &RequestRecord, plan: ChunkPlan) -> Result<usize, CubeflowError> {
        if self.sender.is_closed() {
            return Err(CubeflowError::DispatchQueueClosed);
        }
        let count = plan.units.len();
        self.outstanding.send_modify(|n| *n += count);
        tokio::spawn(feed(
            self.sender.clone(),
            self.outstanding.clone(),
            self.aggregator.clone(),
            record.parameters.application.clone(),
            record.id,
            plan,
        ));
        Ok(count)
    }

    /// Cancel a pending request. Requests that already finished are returned unchanged.
    pub async fn cancel(&self, id: Uuid, message: &str) -> Result<RequestRecord, CubeflowError> {
        if self.store.get(id)?.is_none() {
            return Err(CubeflowError::RequestNotFound { id });
        }
        let record = self
            .aggregator
            .finish(id, RequestStatus::Error, message.to_string(), None, None)?;
        self.aggregator.forget(id).await;
        Ok(record)
    }

    /// Re-dispatch every incomplete request of every application.
    ///
    /// Returns the number of requests dispatched.
    pub async fn run_pending(&self) -> Result<usize, CubeflowError> {
        let mut count = 0;
        for application in self.registry.iter() {
            for record in self.store.list_incomplete(application.id())? {
                tracing::event!(Level::INFO, "Resubmitting request {}", record.id);
                match self.dispatch(&record).await {
                    Ok(_) => count += 1,
                    Err(err) => {
                        tracing::event!(Level::WARN, "Request {} failed: {}", record.id, err)
                    }
                }
            }
        }
        Ok(count)
    }

    /// Wait until every queued unit has been processed.
    pub async fn drain(&self) {
        let mut receiver = self.outstanding.subscribe();
        while *receiver.borrow_and_update() > 0 {
            if receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Delete requests started more than `age` ago, along with their results.
    ///
    /// Returns the number of requests deleted.
    pub async fn purge_older_than(&self, age: Duration) -> Result<usize, CubeflowError> {
        let cutoff = OffsetDateTime::now_utc() - age;
        let mut count = 0;
        for record in self.store.list()? {
            if record.execution_start >= cutoff {
                continue;
            }
            self.aggregator.forget(record.id).await;
            self.store.remove(record.id)?;
            match tokio::fs::remove_dir_all(self.aggregator.result_dir(record.id)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            tracing::event!(Level::INFO, "Purged request {}", record.id);
            count += 1;
        }
        Ok(count)
    }
}
