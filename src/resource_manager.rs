//! Resource management

use crate::error::CubeflowError;

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate resources to
/// chunk workers. Resource management is performed using a Tokio Semaphore per resource.
#[derive(Debug)]
pub struct ResourceManager {
    /// Semaphore for concurrently running chunk tasks.
    tasks: Arc<Semaphore>,

    /// Total number of task permits.
    task_limit: usize,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(task_limit: usize) -> Self {
        Self {
            tasks: Arc::new(Semaphore::new(task_limit)),
            task_limit,
        }
    }

    /// Acquire a task resource.
    ///
    /// The permit is owned so that it can move into a spawned task.
    pub async fn task(&self) -> Result<OwnedSemaphorePermit, CubeflowError> {
        Ok(self.tasks.clone().acquire_owned().await?)
    }

    /// Wait until every task permit has been released.
    pub async fn idle(&self) -> Result<(), CubeflowError> {
        let n = self.task_limit.try_into()?;
        let _permits = self.tasks.acquire_many(n).await?;
        Ok(())
    }

    /// Number of tasks that could start immediately.
    pub fn available(&self) -> usize {
        self.tasks.available_permits()
    }
}
