#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use sqlx::PgPool;
use srm_jobstore::{
    DatabaseConfig, JobKind, JobStorage, LsFileRequest, LsRequest, ReserveSpaceRequest, State,
    StoreConfig,
};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;
    use tracing_subscriber::EnvFilter;

    /// Start a disposable database and return its configuration and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(DatabaseConfig, ContainerAsync<Postgres>)>
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = Postgres::default().start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok((DatabaseConfig::new(url).max_connections(4), container))
    }

    /// Connect a storage with the default settings
    pub(super) async fn connect(database: &DatabaseConfig) -> anyhow::Result<JobStorage> {
        let config = StoreConfig::new(database.clone());
        Ok(JobStorage::builder(config).connect().await?)
    }
}

async fn table_names(pool: &PgPool) -> anyhow::Result<Vec<String>> {
    Ok(sqlx::query_scalar::<_, String>(
        r#"
        SELECT table_name::TEXT FROM information_schema.tables
        WHERE table_schema = current_schema()
        ORDER BY table_name COLLATE "C"
        "#,
    )
    .fetch_all(pool)
    .await?)
}

async fn count(pool: &PgPool, table: &str) -> anyhow::Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?)
}

async fn ls_request(storage: &JobStorage, surls: &[&str]) -> anyhow::Result<i64> {
    let request = LsRequest {
        count: 100,
        num_of_levels: 1,
        long_format: true,
        ..LsRequest::default()
    };
    let job = storage
        .create_job(request, Duration::from_secs(600), 0)
        .await;
    for surl in surls {
        storage.add_file_request(&job, LsFileRequest::new(*surl)).await?;
    }
    storage.save(&job, true).await?;
    Ok(job.id())
}

#[tokio::test]
async fn every_table_is_created_on_first_start() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let pool = storage.store(JobKind::Get).pool().inner();

    assert_eq!(
        table_names(pool).await?,
        [
            "bringonlinefilerequests",
            "bringonlinefilerequestshistory",
            "bringonlineprotocols",
            "bringonlinerequests",
            "bringonlinerequestshistory",
            "copyfilerequests",
            "copyfilerequestshistory",
            "copyrequests",
            "copyrequestshistory",
            "getfilerequests",
            "getfilerequestshistory",
            "getprotocols",
            "getrequests",
            "getrequestshistory",
            "lsfilerequests",
            "lsfilerequestshistory",
            "lsrequests",
            "lsrequestshistory",
            "putfilerequests",
            "putfilerequestshistory",
            "putprotocols",
            "putrequests",
            "putrequestshistory",
            "reservespacerequests",
            "reservespacerequestshistory",
            "srmjobstate",
            "srmnextlongid",
            "srmnextrequestid",
        ]
    );

    let states: Vec<(i32, String)> =
        sqlx::query_as("SELECT id, state FROM srmjobstate ORDER BY id")
            .fetch_all(pool)
            .await?;
    assert_eq!(states.len(), State::ALL.len());
    assert_eq!(states[7], (7, "Done".to_string()));

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT indexname::TEXT FROM pg_indexes WHERE tablename = 'getfilerequests' ORDER BY indexname COLLATE \"C\"",
    )
    .fetch_all(pool)
    .await?;
    assert_eq!(
        indexes,
        [
            "getfilerequests_creationtime_idx",
            "getfilerequests_expirationtime_idx",
            "getfilerequests_nextjobid_idx",
            "getfilerequests_pkey",
            "getfilerequests_requestid_idx",
            "getfilerequests_schedulerid_idx",
            "getfilerequests_state_idx",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn matching_tables_survive_a_restart() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let id = ls_request(&storage, &["srm://a/", "srm://b/"]).await?;
    drop(storage);

    let storage = test_utils::connect(&database).await?;
    let job = assert_some!(storage.get_job(id).await?);
    let record = job.snapshot().await;
    assert_eq!(assert_some!(record.payload.container()).file_requests.len(), 2);

    Ok(())
}

#[tokio::test]
async fn drifted_tables_are_recreated_with_their_dependents() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let old_id = ls_request(&storage, &["srm://a/", "srm://b/"]).await?;
    let pool = storage.store(JobKind::Ls).pool().inner().clone();
    drop(storage);

    sqlx::query("ALTER TABLE lsrequests DROP COLUMN maxnumofresults")
        .execute(&pool)
        .await?;

    let storage = test_utils::connect(&database).await?;
    assert_none!(storage.get_job(old_id).await?);
    assert_eq!(count(&pool, "lsrequests").await?, 0);
    assert_eq!(count(&pool, "lsrequestshistory").await?, 0);
    assert_eq!(count(&pool, "lsfilerequests").await?, 0);

    // the recreated child table cascades from the recreated parent again
    let id = ls_request(&storage, &["srm://c/"]).await?;
    assert_eq!(count(&pool, "lsfilerequests").await?, 1);
    assert!(storage.store(JobKind::Ls).delete(id).await?);
    assert_eq!(count(&pool, "lsfilerequests").await?, 0);
    assert_eq!(count(&pool, "lsfilerequestshistory").await?, 0);

    Ok(())
}

#[tokio::test]
async fn in_flight_jobs_are_finished_on_restart_when_asked() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;

    let mut ids = Vec::new();
    for state in [State::Ready, State::Running, State::Done, State::Canceled] {
        let job = storage
            .create_job(ReserveSpaceRequest::default(), Duration::from_secs(600), 0)
            .await;
        job.set_state(storage.ids(), state, "before restart").await;
        storage.save(&job, true).await?;
        ids.push(job.id());
    }
    drop(storage);

    // a plain restart keeps the states
    let storage = test_utils::connect(&database).await?;
    let store = storage.store(JobKind::ReserveSpace);
    let job = assert_some!(store.get_job(ids[1]).await?);
    assert_eq!(job.read().await.state(), State::Running);
    let running_since = job.read().await.last_state_transition_time();
    drop(storage);

    let config = StoreConfig::new(database.clone()).clean_pending_requests_on_restart(true);
    let storage = JobStorage::builder(config).connect().await?;
    let store = storage.store(JobKind::ReserveSpace);

    let mut states = Vec::new();
    for &id in &ids {
        let job = assert_some!(store.get_job(id).await?);
        states.push(job.read().await.state().name());
    }
    assert_compact_json_snapshot!(states, @r#"["Done", "Failed", "Done", "Canceled"]"#);

    // the forced transition is visible in the transition time
    let job = assert_some!(store.get_job(ids[1]).await?);
    assert!(job.read().await.last_state_transition_time() > running_since);
    assert!(store.get_active_jobs().await?.is_empty());

    Ok(())
}
