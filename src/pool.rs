//! Pooled connections with an explicit commit-or-rollback return discipline.
//!
//! Every connection handed out by [`ConnectionPool::get_connection`] already has
//! an open transaction. It must be given back through exactly one of
//! [`ConnectionPool::return_connection`] (commit, then release) or
//! [`ConnectionPool::return_failed_connection`] (rollback, then discard).
//! A connection dropped without either is closed instead of being reused.

use crate::config::DatabaseConfig;
use crate::errors::JobStoreError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgConnection, PgPool, Postgres};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use tracing::{debug, trace, warn};

/// A pool of PostgreSQL connections.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    pool: PgPool,
}

impl ConnectionPool {
    /// Open a pool for the given database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, JobStoreError> {
        let mut options = PgConnectOptions::from_str(&config.url)?;
        if let Some(user) = &config.user {
            options = options.username(user);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        debug!(url = %config.url, max_connections = config.max_connections, "Opening connection pool…");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .test_before_acquire(config.test_before_acquire)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an already configured pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying `sqlx` pool.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Take a connection out of the pool and open a transaction on it.
    pub async fn get_connection(&self) -> Result<PooledConnection, JobStoreError> {
        let mut conn = self.pool.acquire().await?;
        if let Err(error) = (&mut *conn).execute(sqlx::raw_sql("BEGIN")).await {
            conn.close_on_drop();
            return Err(error.into());
        }
        trace!("Connection checked out");
        Ok(PooledConnection {
            conn,
            settled: false,
        })
    }

    /// Commit the connection's transaction and release it to the pool.
    ///
    /// If the commit fails the connection is discarded and the error returned.
    pub async fn return_connection(&self, mut conn: PooledConnection) -> Result<(), JobStoreError> {
        conn.settled = true;
        if let Err(error) = (&mut *conn.conn).execute(sqlx::raw_sql("COMMIT")).await {
            warn!("Commit failed, discarding connection: {error}");
            conn.conn.close_on_drop();
            return Err(error.into());
        }
        trace!("Connection committed and released");
        Ok(())
    }

    /// Roll the connection's transaction back and discard the connection.
    pub async fn return_failed_connection(&self, mut conn: PooledConnection) {
        conn.settled = true;
        if let Err(error) = (&mut *conn.conn).execute(sqlx::raw_sql("ROLLBACK")).await {
            warn!("Rollback failed: {error}");
        }
        conn.conn.close_on_drop();
        debug!("Connection rolled back and discarded");
    }

    /// Route `result` through the matching return path.
    ///
    /// Commits on `Ok`, rolls back on `Err`.
    pub async fn finish<T>(
        &self,
        conn: PooledConnection,
        result: Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        match result {
            Ok(value) => {
                self.return_connection(conn).await?;
                Ok(value)
            }
            Err(error) => {
                self.return_failed_connection(conn).await;
                Err(error)
            }
        }
    }
}

/// A connection with an open transaction, borrowed from a [`ConnectionPool`].
#[derive(Debug)]
pub struct PooledConnection {
    conn: PoolConnection<Postgres>,
    settled: bool,
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.settled {
            // the transaction state is unknown, so it must not be reused
            warn!("Connection dropped without commit or rollback, closing it");
            self.conn.close_on_drop();
        }
    }
}
