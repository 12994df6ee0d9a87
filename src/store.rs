//! Persistence of request records.

use crate::error::CubeflowError;
use crate::models::RequestRecord;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use tracing::Level;
use uuid::Uuid;

/// Record store used for request identity and progress tracking.
///
/// Implementations must make `insert` atomic with respect to the identity key and
/// `update` an atomic read-modify-write of a single record.
pub trait RequestStore: Send + Sync {
    /// Look up a record by the identity key of its parameters.
    fn find_by_identity(&self, identity: &str) -> Result<Option<RequestRecord>, CubeflowError>;

    /// Insert a new record, failing with [CubeflowError::DuplicateRequest] if a
    /// record with the same identity exists.
    fn insert(&self, record: &RequestRecord) -> Result<(), CubeflowError>;

    fn get(&self, id: Uuid) -> Result<Option<RequestRecord>, CubeflowError>;

    /// Atomically apply `update` to a record and return the updated record.
    ///
    /// `update` may be called more than once if the record changes concurrently.
    /// An error returned by `update` aborts without writing.
    fn update(
        &self,
        id: Uuid,
        update: &mut dyn FnMut(&mut RequestRecord) -> Result<(), CubeflowError>,
    ) -> Result<RequestRecord, CubeflowError>;

    fn list(&self) -> Result<Vec<RequestRecord>, CubeflowError>;

    /// Records of an application that have not completed.
    fn list_incomplete(&self, application: &str) -> Result<Vec<RequestRecord>, CubeflowError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| !record.outcome.complete && record.parameters.application == application)
            .collect())
    }

    /// Remove a record, returning it if it existed.
    fn remove(&self, id: Uuid) -> Result<Option<RequestRecord>, CubeflowError>;

    /// Persist buffered writes.
    fn flush(&self) -> Result<(), CubeflowError> {
        Ok(())
    }
}

impl From<TransactionError<CubeflowError>> for CubeflowError {
    fn from(error: TransactionError<CubeflowError>) -> Self {
        match error {
            TransactionError::Abort(error) => error,
            TransactionError::Storage(error) => CubeflowError::Storage(error),
        }
    }
}

/// [RequestStore] backed by a sled database.
///
/// Records are stored as JSON in the `records` tree keyed by id; the `identities`
/// tree maps identity keys to ids.
pub struct SledStore {
    db: sled::Db,
    identities: sled::Tree,
    records: sled::Tree,
}

impl SledStore {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CubeflowError> {
        Self::with_config(sled::Config::new().path(path))
    }

    /// Create a database that is deleted when dropped.
    pub fn temporary() -> Result<Self, CubeflowError> {
        Self::with_config(sled::Config::new().temporary(true))
    }

    fn with_config(config: sled::Config) -> Result<Self, CubeflowError> {
        let db = config.open()?;
        let identities = db.open_tree("identities")?;
        let records = db.open_tree("records")?;
        tracing::event!(Level::INFO, "Opened request store with {} records", records.len());
        Ok(Self {
            db,
            identities,
            records,
        })
    }

    fn decode(bytes: &[u8]) -> Result<RequestRecord, CubeflowError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl RequestStore for SledStore {
    fn find_by_identity(&self, identity: &str) -> Result<Option<RequestRecord>, CubeflowError> {
        match self.identities.get(identity)? {
            Some(id) => match self.records.get(id)? {
                Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "DEBUG", skip(self, record), fields(id = %record.id))]
    fn insert(&self, record: &RequestRecord) -> Result<(), CubeflowError> {
        let identity = record.parameters.identity_key();
        let id = *record.id.as_bytes();
        let value = serde_json::to_vec(record)?;
        (&self.identities, &self.records).transaction(|(identities, records)| {
            if identities.get(identity.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    CubeflowError::DuplicateRequest {
                        identity: identity.clone(),
                    },
                ));
            }
            identities.insert(identity.as_bytes(), &id[..])?;
            records.insert(&id[..], value.as_slice())?;
            Ok(())
        })?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<RequestRecord>, CubeflowError> {
        self.records
            .get(id.as_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    #[tracing::instrument(level = "TRACE", skip(self, update))]
    fn update(
        &self,
        id: Uuid,
        update: &mut dyn FnMut(&mut RequestRecord) -> Result<(), CubeflowError>,
    ) -> Result<RequestRecord, CubeflowError> {
        loop {
            let current = self
                .records
                .get(id.as_bytes())?
                .ok_or(CubeflowError::RequestNotFound { id })?;
            let mut record = Self::decode(&current)?;
            update(&mut record)?;
            let value = serde_json::to_vec(&record)?;
            match self
                .records
                .compare_and_swap(id.as_bytes(), Some(current), Some(value))?
            {
                Ok(()) => return Ok(record),
                Err(_) => tracing::event!(Level::TRACE, "Record {} changed concurrently, retrying", id),
            }
        }
    }

    fn list(&self) -> Result<Vec<RequestRecord>, CubeflowError> {
        self.records
            .iter()
            .values()
            .map(|bytes| Self::decode(&bytes?))
            .collect()
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    fn remove(&self, id: Uuid) -> Result<Option<RequestRecord>, CubeflowError> {
        let Some(record) = self.get(id)? else {
            return Ok(None);
        };
        let identity = record.parameters.identity_key();
        (&self.identities, &self.records).transaction(|(identities, records)| {
            identities.remove(identity.as_bytes())?;
            records.remove(id.as_bytes())?;
            Ok::<_, ConflictableTransactionError<CubeflowError>>(())
        })?;
        Ok(Some(record))
    }

    fn flush(&self) -> Result<(), CubeflowError> {
        let bytes = self.db.flush()?;
        tracing::event!(Level::DEBUG, "Flushed {} bytes of request store", bytes);
        Ok(())
    }
}
