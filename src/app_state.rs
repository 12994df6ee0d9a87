use crate::aggregator::Aggregator;
use crate::apps;
use crate::cli::CommandLineArgs;
use crate::dispatcher::Dispatcher;
use crate::error::CubeflowError;
use crate::registry::Registry;
use crate::resource_manager::ResourceManager;
use crate::store::{RequestStore, SledStore};

use expanduser::expanduser;
use std::sync::Arc;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Registered applications.
    pub registry: Arc<Registry>,

    /// Request records.
    pub store: Arc<dyn RequestStore>,

    /// Resource manager.
    pub resource_manager: Arc<ResourceManager>,

    /// Chunk dispatcher.
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Create and return an [AppState].
    ///
    /// Opens the request database, builds the application registry and starts the dispatcher
    /// on the current runtime.
    pub fn new(args: &CommandLineArgs) -> Result<Self, CubeflowError> {
        let store: Arc<dyn RequestStore> = match &args.database_path {
            Some(path) => Arc::new(SledStore::open(expanduser(path)?)?),
            None => Arc::new(SledStore::temporary()?),
        };
        Self::with_store(args, store)
    }

    /// Create an [AppState] around an existing request store.
    pub fn with_store(
        args: &CommandLineArgs,
        store: Arc<dyn RequestStore>,
    ) -> Result<Self, CubeflowError> {
        let registry = Arc::new(apps::build_registry(args)?);
        let resource_manager = Arc::new(ResourceManager::new(args.worker_limit()));
        let aggregator = Arc::new(Aggregator::new(
            registry.clone(),
            store.clone(),
            expanduser(&args.result_root)?,
            args.use_rayon,
        ));
        let dispatcher = Dispatcher::start(
            registry.clone(),
            store.clone(),
            aggregator,
            resource_manager.clone(),
            args,
        );

        Ok(Self {
            args: args.clone(),
            registry,
            store,
            resource_manager,
            dispatcher,
        })
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
