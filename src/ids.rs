//! Batched allocation of unique ids.
//!
//! Two counters are persisted, each as the sole row of a two column table. A
//! generator reserves a whole block of values with one round-trip and hands
//! them out from memory until the block is exhausted. The persisted value
//! always moves past a block before any value of that block is handed out.

use crate::errors::JobStoreError;
use crate::pool::ConnectionPool;
use sqlx::PgConnection;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

const INT_COUNTER_TABLE: &str = "srmnextrequestid";
const LONG_COUNTER_TABLE: &str = "srmnextlongid";
const INT_STEP: i64 = 1_000;
const LONG_STEP: i64 = 10_000;

/// A contiguous range of reserved values, `next..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    next: i64,
    end: i64,
}

impl Reservation {
    const EMPTY: Reservation = Reservation { next: 0, end: 0 };

    /// An exhausted reservation whose fallback continues at `base`.
    fn ending_at(base: i64) -> Self {
        Self {
            next: base,
            end: base,
        }
    }

    fn starting_at(base: i64, step: i64) -> Self {
        Self {
            next: base,
            end: base + step,
        }
    }

    fn take(&mut self) -> Option<i64> {
        if self.next >= self.end {
            return None;
        }
        let value = self.next;
        self.next += 1;
        Some(value)
    }

    /// Block used when the database could not be reached: continue counting
    /// from where the previous block ended.
    fn fallback(&self, step: i64) -> Self {
        Self::starting_at(self.end, step)
    }
}

#[derive(Debug)]
struct Counter {
    table: &'static str,
    column_type: &'static str,
    step: i64,
    reservation: Mutex<Reservation>,
}

impl Counter {
    fn new(table: &'static str, column_type: &'static str, step: i64) -> Self {
        Self {
            table,
            column_type,
            step,
            reservation: Mutex::new(Reservation::EMPTY),
        }
    }

    async fn next(&self, pool: &ConnectionPool) -> i64 {
        let mut reservation = self.reservation.lock().await;
        if let Some(value) = reservation.take() {
            return value;
        }

        *reservation = match self.reserve(pool).await {
            Ok(base) => {
                debug!(table = self.table, base, step = self.step, "Reserved id block");
                Reservation::starting_at(base, self.step)
            }
            Err(error) => {
                let fallback = reservation.fallback(self.step);
                warn!(
                    table = self.table,
                    base = fallback.next,
                    "Failed to reserve id block, continuing from the in-memory base: {error}"
                );
                fallback
            }
        };

        // a fresh block is never empty
        reservation.take().unwrap_or(reservation.end)
    }

    async fn reserve(&self, pool: &ConnectionPool) -> Result<i64, JobStoreError> {
        let mut conn = pool.get_connection().await?;
        let result = self.advance(&mut conn).await;
        pool.finish(conn, result).await
    }

    async fn advance(&self, conn: &mut PgConnection) -> Result<i64, JobStoreError> {
        let select = format!(
            "SELECT nextvalue::BIGINT FROM {} WHERE id = 1 FOR UPDATE",
            self.table
        );
        let base: i64 = sqlx::query_scalar(&select).fetch_one(&mut *conn).await?;

        let update = format!(
            "UPDATE {} SET nextvalue = nextvalue + {} WHERE id = 1",
            self.table, self.step
        );
        sqlx::query(&update).execute(&mut *conn).await?;

        Ok(base)
    }

    /// Create and seed the table, returning the persisted value. Every value
    /// issued by earlier runs lies below it.
    async fn create_table(&self, conn: &mut PgConnection) -> Result<i64, JobStoreError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER NOT NULL PRIMARY KEY, nextvalue {} NOT NULL)",
            self.table, self.column_type
        );
        sqlx::query(&create).execute(&mut *conn).await?;

        let seed = format!(
            "INSERT INTO {} (id, nextvalue) VALUES (1, 1) ON CONFLICT (id) DO NOTHING",
            self.table
        );
        sqlx::query(&seed).execute(&mut *conn).await?;

        let select = format!("SELECT nextvalue::BIGINT FROM {} WHERE id = 1", self.table);
        let persisted = sqlx::query_scalar(&select).fetch_one(&mut *conn).await?;
        Ok(persisted)
    }
}

/// Issues unique ascending ids from two persisted counters.
///
/// The int counter hands out job ids, which stay in the 32 bit range expected
/// by older protocol versions. The long counter hands out history ids.
#[derive(Debug)]
pub struct IdGenerator {
    pool: ConnectionPool,
    int_counter: Counter,
    long_counter: Counter,
}

impl IdGenerator {
    /// Create the counter tables if needed and return a generator with no
    /// reserved values.
    ///
    /// Should the first reservation fail, counting falls back to the
    /// persisted values read here, so ids of earlier runs are not reissued.
    #[instrument(name = "jobstore.ids.init", skip(pool))]
    pub async fn new(pool: ConnectionPool) -> Result<Self, JobStoreError> {
        let generator = Self {
            int_counter: Counter::new(INT_COUNTER_TABLE, "INTEGER", INT_STEP),
            long_counter: Counter::new(LONG_COUNTER_TABLE, "BIGINT", LONG_STEP),
            pool,
        };

        let mut conn = generator.pool.get_connection().await?;
        let result = async {
            let int_base = generator.int_counter.create_table(&mut conn).await?;
            let long_base = generator.long_counter.create_table(&mut conn).await?;
            Ok::<_, JobStoreError>((int_base, long_base))
        }
        .await;
        let (int_base, long_base) = generator.pool.finish(conn, result).await?;
        *generator.int_counter.reservation.lock().await = Reservation::ending_at(int_base);
        *generator.long_counter.reservation.lock().await = Reservation::ending_at(long_base);

        Ok(generator)
    }

    /// Next value of the int counter.
    ///
    /// Never fails: if a new block cannot be reserved, counting continues past
    /// the last block held in memory.
    pub async fn next_int(&self) -> i64 {
        self.int_counter.next(&self.pool).await
    }

    /// Next value of the long counter.
    pub async fn next_long(&self) -> i64 {
        self.long_counter.next(&self.pool).await
    }
}
