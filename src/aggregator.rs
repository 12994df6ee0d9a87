//! Joining of chunk results and assembly of the final request output.

use crate::error::CubeflowError;
use crate::metrics::FINISHED_REQUESTS;
use crate::models::{ChunkId, Metadata, Progressable, RequestRecord, RequestStatus};
use crate::planner::ChunkPlan;
use crate::raster::{combine_geographic, Raster};
use crate::registry::{Application, ChunkOutput, Registry};
use crate::resample::rescale;
use crate::store::RequestStore;

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Level;
use uuid::Uuid;

/// Name of the artifact file within a request's result directory.
pub const ARTIFACT_NAME: &str = "result.json";

/// Result of processing one chunk unit, as reported by a worker.
#[derive(Debug)]
pub struct ChunkResult {
    pub chunk_id: ChunkId,
    /// Number of scenes the unit covered
    pub scene_count: u64,
    /// Output of the unit, or a description of its failure
    pub output: Result<ChunkOutput, String>,
}

/// The final output of a request as written to disk.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Artifact {
    pub request_id: Uuid,
    pub metadata: Metadata,
    pub raster: Raster,
}

/// Join barrier of a single request.
#[derive(Debug, Default)]
struct JoinState {
    expected: HashSet<ChunkId>,
    outputs: BTreeMap<ChunkId, ChunkOutput>,
    failures: BTreeMap<ChunkId, String>,
    /// Set once the outputs have been handed to the final merge
    assembled: bool,
}

impl JoinState {
    fn received(&self, chunk_id: &ChunkId) -> bool {
        self.outputs.contains_key(chunk_id) || self.failures.contains_key(chunk_id)
    }

    fn is_complete(&self) -> bool {
        self.outputs.len() + self.failures.len() == self.expected.len()
    }
}

/// Returns the completion percentage of a request.
pub fn progress(record: &impl Progressable) -> u8 {
    record.progress()
}

/// Describe failed chunks, listing each distinct reason once.
fn failure_message(failures: &BTreeMap<ChunkId, String>) -> String {
    let chunks = failures
        .keys()
        .map(ChunkId::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let mut reasons = failures.values().cloned().collect::<Vec<_>>();
    reasons.sort();
    reasons.dedup();
    format!("Chunks {} failed: {}", chunks, reasons.join("; "))
}

/// Combine chunk outputs into a single raster and metadata.
///
/// Outputs of each temporal chunk are combined geographically in chunk order, then
/// folded in temporal chunk order using the application's recombination.
pub fn merge_outputs(
    application: &dyn Application,
    outputs: &BTreeMap<ChunkId, ChunkOutput>,
) -> Result<(Option<Raster>, Metadata), CubeflowError> {
    let mut metadata = Metadata::default();
    let mut by_time = BTreeMap::<usize, Vec<Raster>>::new();
    for (chunk_id, output) in outputs {
        metadata.combine(&output.metadata);
        if let Some(raster) = &output.raster {
            by_time.entry(chunk_id.time).or_default().push(raster.clone());
        }
    }

    let mut combined: Option<Raster> = None;
    for rasters in by_time.values() {
        let merged = combine_geographic(rasters)?;
        combined = Some(match combined {
            Some(accumulated) => application.recombine_time(accumulated, merged)?,
            None => merged,
        });
    }
    if let (Some(raster), Some(resolution)) = (&combined, application.output_resolution()) {
        combined = Some(rescale(raster, resolution)?);
    }
    Ok((combined, metadata))
}

/// Collects chunk results per request and merges them once every chunk has reported.
///
/// The final merge and artifact serialisation run off the async runtime, on the Rayon pool
/// when `use_rayon` is set and as blocking tasks otherwise.
pub struct Aggregator {
    registry: Arc<Registry>,
    store: Arc<dyn RequestStore>,
    result_root: PathBuf,
    use_rayon: bool,
    joins: Mutex<HashMap<Uuid, Arc<Mutex<JoinState>>>>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn RequestStore>,
        result_root: PathBuf,
        use_rayon: bool,
    ) -> Self {
        Self {
            registry,
            store,
            result_root,
            use_rayon,
            joins: Mutex::new(HashMap::new()),
        }
    }

    /// Run CPU bound work without blocking a runtime worker.
    async fn offload<F, T>(&self, work: F) -> Result<T, CubeflowError>
    where
        F: FnOnce() -> Result<T, CubeflowError> + Send + 'static,
        T: Send + 'static,
    {
        if self.use_rayon {
            tokio_rayon::spawn(work).await
        } else {
            tokio::task::spawn_blocking(work).await?
        }
    }

    /// Directory holding the results of a request.
    pub fn result_dir(&self, request_id: Uuid) -> PathBuf {
        self.result_root.join(request_id.to_string())
    }

    /// Register the chunks a request expects, replacing any earlier registration.
    pub async fn expect(&self, request_id: Uuid, plan: &ChunkPlan) {
        let state = JoinState {
            expected: plan.chunk_ids().collect(),
            ..Default::default()
        };
        self.joins
            .lock()
            .await
            .insert(request_id, Arc::new(Mutex::new(state)));
    }

    /// Drop the join state of a request.
    pub async fn forget(&self, request_id: Uuid) {
        self.joins.lock().await.remove(&request_id);
    }

    /// Whether a request is waiting for chunks.
    pub async fn is_joining(&self, request_id: Uuid) -> bool {
        self.joins.lock().await.contains_key(&request_id)
    }

    /// Merge the result of one chunk unit.
    ///
    /// Duplicate and unexpected results are ignored. The last expected result merges
    /// the outputs and finishes the request, returning the finished record.
    #[tracing::instrument(level = "DEBUG", skip(self, result), fields(chunk = %result.chunk_id))]
    pub async fn merge_chunk(
        &self,
        request_id: Uuid,
        result: ChunkResult,
    ) -> Result<Option<RequestRecord>, CubeflowError> {
        let Some(join) = self.joins.lock().await.get(&request_id).cloned() else {
            tracing::event!(Level::DEBUG, "Request is not joining, dropping chunk");
            return Ok(None);
        };
        let mut state = join.lock().await;
        if state.assembled
            || !state.expected.contains(&result.chunk_id)
            || state.received(&result.chunk_id)
        {
            tracing::event!(Level::DEBUG, "Ignoring duplicate or unexpected chunk");
            return Ok(None);
        }
        match result.output {
            Ok(output) => {
                state.outputs.insert(result.chunk_id, output);
            }
            Err(message) => {
                state.failures.insert(result.chunk_id, message);
            }
        }
        let record = self.store.update(request_id, &mut |record| {
            record.outcome.scenes_processed += result.scene_count;
            Ok(())
        })?;
        if !state.is_complete() {
            return Ok(None);
        }

        state.assembled = true;
        let finished = if record.outcome.status.is_terminal() {
            record
        } else {
            let outputs = std::mem::take(&mut state.outputs);
            self.assemble(&record, outputs, &state.failures).await?
        };
        drop(state);
        self.forget(request_id).await;
        Ok(Some(finished))
    }

    /// Merge all chunk outputs of a request, write the artifact and finish the request.
    ///
    /// Outputs of successful chunks are merged even when other chunks failed, in which case
    /// the request finishes with an error naming the failed chunks.
    async fn assemble(
        &self,
        record: &RequestRecord,
        outputs: BTreeMap<ChunkId, ChunkOutput>,
        failures: &BTreeMap<ChunkId, String>,
    ) -> Result<RequestRecord, CubeflowError> {
        let failure = (!failures.is_empty()).then(|| failure_message(failures));
        let merged = match self.registry.get(&record.parameters.application) {
            Ok(application) => {
                self.offload(move || merge_outputs(application.as_ref(), &outputs))
                    .await
            }
            Err(err) => Err(err),
        };
        let (raster, metadata) = match merged {
            Ok(merged) => merged,
            Err(err) => {
                tracing::event!(Level::WARN, "Failed to merge request {}: {}", record.id, err);
                let message = failure.unwrap_or_else(|| err.to_string());
                return self.finish(record.id, RequestStatus::Error, message, None, None);
            }
        };

        let has_data = raster.is_some();
        let result_path = match raster {
            Some(raster) => match self.write_artifact(record.id, metadata.clone(), raster).await {
                Ok(path) => Some(path),
                Err(err) => {
                    tracing::event!(Level::ERROR, "Failed to write result of {}: {}", record.id, err);
                    let message = err.to_string();
                    return self.finish(record.id, RequestStatus::Error, message, None, Some(metadata));
                }
            },
            None => None,
        };

        let (status, message) = match (failure, has_data) {
            (Some(message), _) => (RequestStatus::Error, message),
            (None, false) => (
                RequestStatus::Error,
                "No data was found for this parameter set.".to_string(),
            ),
            (None, true) => (RequestStatus::Ok, "Request complete.".to_string()),
        };
        self.finish(record.id, status, message, result_path, Some(metadata))
    }

    async fn write_artifact(
        &self,
        request_id: Uuid,
        metadata: Metadata,
        raster: Raster,
    ) -> Result<String, CubeflowError> {
        let dir = self.result_dir(request_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(ARTIFACT_NAME);
        let artifact = Artifact {
            request_id,
            metadata,
            raster,
        };
        let bytes = self
            .offload(move || Ok(serde_json::to_vec(&artifact)?))
            .await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path.display().to_string())
    }

    /// Move a request into a terminal status.
    ///
    /// Requests that are already terminal are left unchanged. The result path and
    /// metadata are only written by the transition.
    pub fn finish(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        message: String,
        result_path: Option<String>,
        metadata: Option<Metadata>,
    ) -> Result<RequestRecord, CubeflowError> {
        let mut finished = false;
        let record = self.store.update(request_id, &mut |record| {
            finished = false;
            if record.outcome.status.is_terminal() {
                return Ok(());
            }
            if record.outcome.result_path.is_none() {
                record.outcome.result_path = result_path.clone();
            }
            if let Some(metadata) = &metadata {
                record.metadata = metadata.clone();
            }
            finished = record.finish(status, message.clone());
            Ok(())
        })?;
        if finished {
            tracing::event!(
                Level::INFO,
                "Request {} finished with status {}: {}",
                request_id,
                status,
                record.outcome.message
            );
            FINISHED_REQUESTS
                .with_label_values(&[&record.parameters.application, &status.to_string()])
                .inc();
        }
        Ok(record)
    }
}

/// Read an artifact written by the aggregator.
pub async fn read_artifact(path: impl AsRef<Path>) -> Result<Artifact, CubeflowError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
