#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_ok, assert_some};
use insta::assert_compact_json_snapshot;
use sqlx::PgPool;
use srm_jobstore::{
    DatabaseConfig, GetFileRequest, GetRequest, Job, JobKind, JobStorage, JobStoreError,
    LsFileRequest, Payload, PutRequest, ReserveSpaceRequest, State, StoreConfig,
};
use std::collections::BTreeSet;
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

        // Use the standard postgres/postgres credentials for testcontainers
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok((DatabaseConfig::new(url).max_connections(4), container))
    }

    /// Connect a storage with the default settings
    pub(super) async fn connect(database: &DatabaseConfig) -> anyhow::Result<JobStorage> {
        let config = StoreConfig::new(database.clone());
        Ok(JobStorage::builder(config).connect().await?)
    }
}

fn raw_pool(storage: &JobStorage) -> &PgPool {
    storage.store(JobKind::Get).pool().inner()
}

async fn count_rows(pool: &PgPool, sql: &str, id: i64) -> anyhow::Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(sql).bind(id).fetch_one(pool).await?)
}

fn reservation(size: i64) -> ReserveSpaceRequest {
    ReserveSpaceRequest {
        size_in_bytes: size,
        reservation_lifetime: 86_400_000,
        space_token: Some("token-1".to_string()),
        retention_policy: Some("REPLICA".to_string()),
        access_latency: Some("ONLINE".to_string()),
        ..ReserveSpaceRequest::default()
    }
}

async fn get_request(storage: &JobStorage, surls: &[&str]) -> anyhow::Result<Job> {
    let mut request = GetRequest::default();
    request.request.user_id = Some("alice".to_string());
    request.container.protocols = vec!["gsiftp".to_string(), "http".to_string()];

    let job = storage
        .create_job(request, Duration::from_secs(3600), 5)
        .await;
    for surl in surls {
        storage.add_file_request(&job, GetFileRequest::new(*surl)).await?;
    }
    Ok(job)
}

#[tokio::test]
async fn saved_jobs_reload_with_identical_fields() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;

    let job = storage
        .create_job(reservation(1 << 30), Duration::from_secs(600), 3)
        .await;
    job.write().await.scheduler_id = Some("srm-1".to_string());
    job.set_state(storage.ids(), State::Running, "reserving").await;
    job.set_state(storage.ids(), State::RetryWait, "space manager busy").await;
    storage.save(&job, true).await?;

    let reloaded = assert_some!(storage.store(JobKind::ReserveSpace).get_job(job.id()).await?);
    let expected = job.snapshot().await;
    let actual = reloaded.snapshot().await;

    assert_eq!(actual.id(), expected.id());
    assert_eq!(actual.state(), State::RetryWait);
    assert_eq!(actual.error_message, expected.error_message);
    assert_eq!(actual.number_of_retries, 1);
    assert_eq!(actual.max_number_of_retries, 3);
    assert_eq!(actual.last_state_transition_time(), expected.last_state_transition_time());
    assert_eq!(actual.creation_time, expected.creation_time);
    assert_eq!(actual.lifetime, 600_000);
    assert_eq!(actual.scheduler_id.as_deref(), Some("srm-1"));
    assert_eq!(actual.history(), expected.history());

    let Payload::ReserveSpace(space) = &actual.payload else {
        panic!("expected a space reservation, got {:?}", actual.kind());
    };
    assert_eq!(space, &reservation(1 << 30));

    Ok(())
}

#[tokio::test]
async fn repeated_saves_keep_a_single_row() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let pool = raw_pool(&storage);

    let job = storage
        .create_job(reservation(1024), Duration::from_secs(600), 0)
        .await;
    storage.save(&job, true).await?;
    storage.save(&job, true).await?;
    job.set_state(storage.ids(), State::Running, "running").await;
    storage.save(&job, false).await?;
    storage.save(&job, false).await?;

    let rows = count_rows(pool, "SELECT COUNT(*) FROM reservespacerequests WHERE id = $1", job.id()).await?;
    assert_eq!(rows, 1);

    // history entries are written once each
    let history = count_rows(
        pool,
        "SELECT COUNT(*) FROM reservespacerequestshistory WHERE jobid = $1",
        job.id(),
    )
    .await?;
    assert_eq!(history, 2);
    assert!(job.read().await.history().iter().all(|entry| entry.is_saved()));

    Ok(())
}

#[tokio::test]
async fn container_requests_reload_with_their_file_requests() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;

    let job = get_request(&storage, &["srm://a/1", "srm://a/2", "srm://a/3"]).await?;
    job.set_state(storage.ids(), State::TQueued, "queued").await;
    job.set_state(storage.ids(), State::Running, "running").await;
    let transitions = job.read().await.history().len();
    storage.save(&job, true).await?;

    let reloaded = assert_some!(storage.get_job(job.id()).await?);
    assert_eq!(reloaded.kind(), JobKind::Get);
    let record = reloaded.snapshot().await;
    assert_eq!(record.history().len(), transitions);

    let history: Vec<(&str, &str)> = record
        .history()
        .iter()
        .map(|entry| (entry.state().name(), entry.description()))
        .collect();
    assert_compact_json_snapshot!(history, @r#"[["Pending", "created"], ["TQueued", "queued"], ["Running", "running"]]"#);

    let container = assert_some!(record.payload.container());
    let protocols: BTreeSet<&str> = container.protocols.iter().map(String::as_str).collect();
    assert_eq!(protocols, BTreeSet::from(["gsiftp", "http"]));
    assert_eq!(container.file_requests.len(), 3);

    let mut surls = Vec::new();
    for file_request in &container.file_requests {
        let file = file_request.snapshot().await;
        assert_eq!(file.state(), State::Pending);
        assert_eq!(file.history().len(), 1);
        let Payload::GetFile(get) = &file.payload else {
            panic!("expected a get file request, got {:?}", file.kind());
        };
        assert_eq!(get.file.request_id, job.id());
        surls.push(get.surl.clone());
    }
    surls.sort();
    assert_compact_json_snapshot!(surls, @r#"["srm://a/1", "srm://a/2", "srm://a/3"]"#);

    Ok(())
}

#[tokio::test]
async fn deleting_a_container_removes_its_file_requests() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let pool = raw_pool(&storage);

    let job = get_request(&storage, &["srm://a/1", "srm://a/2", "srm://a/3"]).await?;
    storage.save(&job, true).await?;

    let children = "SELECT COUNT(*) FROM getfilerequests WHERE requestid = $1";
    assert_eq!(count_rows(pool, children, job.id()).await?, 3);

    assert!(storage.store(JobKind::Get).delete(job.id()).await?);
    assert!(!storage.store(JobKind::Get).delete(job.id()).await?);

    assert_eq!(count_rows(pool, children, job.id()).await?, 0);
    let protocols = "SELECT COUNT(*) FROM getprotocols WHERE requestid = $1";
    assert_eq!(count_rows(pool, protocols, job.id()).await?, 0);
    let history = "SELECT COUNT(*) FROM getrequestshistory WHERE jobid = $1";
    assert_eq!(count_rows(pool, history, job.id()).await?, 0);
    assert_none!(storage.get_job(job.id()).await?);

    Ok(())
}

#[tokio::test]
async fn active_and_completed_jobs_are_disjoint() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let store = storage.store(JobKind::ReserveSpace);

    let mut ids = Vec::new();
    for state in [
        State::Done,
        State::Failed,
        State::Canceled,
        State::Running,
        State::Pending,
        State::Done,
    ] {
        let job = storage
            .create_job(reservation(1), Duration::from_secs(600), 0)
            .await;
        if state != State::Pending {
            job.set_state(storage.ids(), state, "moved").await;
        }
        storage.save(&job, true).await?;
        ids.push(job.id());
    }

    for job in store.get_active_jobs().await? {
        assert!(!job.read().await.state().is_final());
    }
    assert_eq!(store.get_active_jobs().await?.len(), 2);

    let completed = store.get_latest_completed_job_ids(3).await?;
    assert_eq!(completed, vec![ids[5], ids[2], ids[1]]);
    assert_eq!(store.get_latest_completed_job_ids(100).await?.len(), 4);

    assert_eq!(store.get_latest_done_job_ids(10).await?, vec![ids[5], ids[0]]);
    assert_eq!(store.get_latest_failed_job_ids(10).await?, vec![ids[1]]);
    assert_eq!(store.get_latest_canceled_job_ids(10).await?, vec![ids[2]]);
    assert!(store.get_latest_done_job_ids(0).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn jobs_are_found_by_scheduler_and_state() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;
    let store = storage.store(JobKind::ReserveSpace);

    for (scheduler, state) in [
        ("srm-1", State::Running),
        ("srm-1", State::TQueued),
        ("srm-2", State::Running),
    ] {
        let job = storage
            .create_job(reservation(1), Duration::from_secs(600), 0)
            .await;
        job.write().await.scheduler_id = Some(scheduler.to_string());
        job.set_state(storage.ids(), state, "scheduled").await;
        storage.save(&job, true).await?;
    }

    let unowned = storage
        .create_job(reservation(1), Duration::from_secs(600), 0)
        .await;
    storage.save(&unowned, true).await?;

    assert_eq!(store.get_jobs(Some("srm-1"), None).await?.len(), 2);
    assert_eq!(store.get_jobs(Some("srm-1"), Some(State::Running)).await?.len(), 1);
    assert_eq!(store.get_jobs(Some("srm-2"), Some(State::TQueued)).await?.len(), 0);
    assert!(store.get_jobs(Some("srm-3"), None).await?.is_empty());

    let found = store.get_jobs(None, None).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), unowned.id());
    assert_eq!(store.get_jobs(None, Some(State::Pending)).await?.len(), 1);
    assert!(store.get_jobs(None, Some(State::Running)).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn intermediate_saves_are_skipped_without_history() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let config = StoreConfig::new(database).history_enabled(false);
    let storage = JobStorage::builder(config).connect().await?;
    let store = storage.store(JobKind::Put);

    let job = storage
        .create_job(PutRequest::default(), Duration::from_secs(600), 0)
        .await;
    store.save(&job, false).await?;
    assert_none!(store.get_job(job.id()).await?);

    store.save(&job, true).await?;
    let reloaded = assert_some!(store.get_job(job.id()).await?);
    assert!(reloaded.read().await.history().is_empty());

    Ok(())
}

#[tokio::test]
async fn jobs_of_another_kind_are_rejected() -> anyhow::Result<()> {
    let (database, _container) = test_utils::setup_test_db().await?;
    let storage = test_utils::connect(&database).await?;

    let job = storage
        .create_job(reservation(1), Duration::from_secs(600), 0)
        .await;
    let error = storage.store(JobKind::Get).save(&job, true).await.unwrap_err();
    assert!(matches!(
        error,
        JobStoreError::KindMismatch {
            expected: JobKind::Get,
            actual: JobKind::ReserveSpace
        }
    ));

    let container = get_request(&storage, &[]).await?;
    let error = storage
        .add_file_request(&container, LsFileRequest::new("srm://a/"))
        .await
        .unwrap_err();
    assert!(matches!(error, JobStoreError::KindMismatch { .. }));
    assert_ok!(storage.add_file_request(&container, GetFileRequest::new("srm://a/4")).await);

    Ok(())
}
