use crate::config::{DatabaseConfig, StoreConfig};
use crate::errors::JobStoreError;
use crate::ids::IdGenerator;
use crate::job::{Job, JobRecord};
use crate::pool::ConnectionPool;
use crate::reaper::{Reaper, ReaperHandle};
use crate::recovery::{self, RecoveryHandle};
use crate::request::{JobKind, Payload};
use crate::scheduler::Scheduler;
use crate::schema::{TableStatus, ensure_state_table, init_kind};
use crate::storage::JobStore;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Builder for [`JobStorage`].
#[derive(Debug)]
pub struct JobStorageBuilder {
    config: StoreConfig,
    pool: Option<PgPool>,
}

impl JobStorageBuilder {
    /// Use an existing pool for the default database instead of opening one
    /// from `config.database`.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open the pools, create or verify every table and apply
    /// clean-on-restart.
    ///
    /// Kinds with identical database configurations share one pool. The id
    /// counters live in the default database.
    #[instrument(name = "jobstore.connect", skip_all)]
    pub async fn connect(self) -> Result<JobStorage, JobStoreError> {
        let config = self.config;
        let default_pool = match self.pool {
            Some(pool) => ConnectionPool::from_pool(pool),
            None => ConnectionPool::connect(&config.database).await?,
        };

        let mut pools: HashMap<DatabaseConfig, ConnectionPool> = HashMap::new();
        pools.insert(config.database.clone(), default_pool.clone());
        for kind in JobKind::ALL {
            let database = config.database_of(kind);
            if !pools.contains_key(database) {
                let pool = ConnectionPool::connect(database).await?;
                pools.insert(database.clone(), pool);
            }
        }
        let pool_of = |kind: JobKind| {
            pools
                .get(config.database_of(kind))
                .cloned()
                .unwrap_or_else(|| default_pool.clone())
        };

        let ids = IdGenerator::new(default_pool.clone()).await?;

        for pool in pools.values() {
            let mut conn = pool.get_connection().await?;
            let result = ensure_state_table(&mut conn).await;
            pool.finish(conn, result).await?;
        }

        // a child table whose parent was (re)created must follow, or its
        // foreign key would be lost
        let mut replaced = HashSet::new();
        for kind in JobKind::ALL {
            let force = kind.parent().is_some_and(|parent| replaced.contains(&parent));
            let pool = pool_of(kind);
            let mut conn = pool.get_connection().await?;
            let result = init_kind(
                &mut conn,
                kind.descriptor(),
                force,
                config.clean_pending_requests_on_restart,
            )
            .await;
            let status = pool.finish(conn, result).await?;
            if status != TableStatus::Existing {
                replaced.insert(kind);
            }
        }

        let stores = JobKind::ALL.map(|kind| JobStore::new(kind, pool_of(kind), config.history_enabled));
        info!(pools = pools.len(), "Job storage ready");

        Ok(JobStorage {
            config,
            ids: Arc::new(ids),
            stores,
        })
    }
}

/// Owns the pools, the id generator and one [`JobStore`] per kind.
///
/// Constructed once and passed to whatever needs to create, persist or look
/// up jobs.
#[derive(Debug)]
pub struct JobStorage {
    config: StoreConfig,
    ids: Arc<IdGenerator>,
    stores: [JobStore; 11],
}

impl JobStorage {
    /// Start building a storage for `config`.
    pub fn builder(config: StoreConfig) -> JobStorageBuilder {
        JobStorageBuilder { config, pool: None }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shared id generator.
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// The store of one kind.
    pub fn store(&self, kind: JobKind) -> &JobStore {
        // stores are laid out in declaration order of `JobKind`
        &self.stores[kind as usize]
    }

    /// A new pending job with a fresh id. Nothing is persisted yet.
    pub async fn create_job(
        &self,
        payload: impl Into<Payload>,
        lifetime: Duration,
        max_number_of_retries: i32,
    ) -> Job {
        let id = self.ids.next_int().await;
        let history_id = self.ids.next_long().await;
        let lifetime = i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX);
        Job::new(JobRecord::new(
            id,
            history_id,
            payload.into(),
            lifetime,
            max_number_of_retries,
        ))
    }

    /// Create a file request owned by `container` and attach it.
    ///
    /// The file request inherits the container's lifetime and retry limit.
    /// It is persisted with the container's next save.
    pub async fn add_file_request(
        &self,
        container: &Job,
        payload: impl Into<Payload>,
    ) -> Result<Job, JobStoreError> {
        let mut payload = payload.into();
        let expected = container.kind().child().ok_or(JobStoreError::KindMismatch {
            expected: container.kind(),
            actual: payload.kind(),
        })?;
        if payload.kind() != expected {
            return Err(JobStoreError::KindMismatch {
                expected,
                actual: payload.kind(),
            });
        }
        if let Some(file) = payload.file_mut() {
            file.request_id = container.id();
        }

        let (lifetime, max_number_of_retries) = {
            let record = container.read().await;
            (record.lifetime, record.max_number_of_retries)
        };
        let id = self.ids.next_int().await;
        let history_id = self.ids.next_long().await;
        let child = Job::new(JobRecord::new(
            id,
            history_id,
            payload,
            lifetime,
            max_number_of_retries,
        ));

        if let Some(files) = container.write().await.payload.container_mut() {
            files.file_requests.push(child.clone());
        }
        Ok(child)
    }

    /// Persist a job through the store of its kind.
    pub async fn save(&self, job: &Job, force: bool) -> Result<(), JobStoreError> {
        self.store(job.kind()).save(job, force).await
    }

    /// Look a job up in every kind's table.
    #[instrument(name = "jobstore.find_job", skip(self))]
    pub async fn get_job(&self, id: i64) -> Result<Option<Job>, JobStoreError> {
        for store in &self.stores {
            if let Some(job) = store.get_job(id).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(
            self.stores.to_vec(),
            self.config.expired_request_removal_period,
            self.config.history_retention(),
        )
    }

    /// Remove expired jobs once, returning how many rows were deleted.
    pub async fn remove_expired_jobs(&self) -> u64 {
        self.reaper().run_once().await
    }

    /// Remove expired jobs every `expired_request_removal_period` until the
    /// returned handle is stopped.
    pub fn start_reaper(&self) -> ReaperHandle {
        self.reaper().start()
    }

    /// Hand every unowned pending job to `scheduler` in the background.
    ///
    /// Only recoverable kinds are scanned, so a file request reaches the
    /// scheduler once: on its own for get, put and bring-online, inside its
    /// container for copy. Pending ls requests are not resubmitted.
    pub fn start_recovery<S: Scheduler>(&self, scheduler: Arc<S>) -> RecoveryHandle {
        let stores = self
            .stores
            .iter()
            .filter(|store| store.descriptor().recoverable)
            .cloned()
            .collect();
        recovery::start(stores, scheduler)
    }
}
