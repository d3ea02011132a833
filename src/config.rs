use crate::request::JobKind;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_REMOVAL_PERIOD: Duration = Duration::from_secs(60 * 60);
const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 30;

/// Connection parameters for one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `postgres://` connection URL.
    pub url: String,
    /// Overrides the user given in the URL.
    pub user: Option<String>,
    /// Overrides the password given in the URL.
    pub password: Option<String>,
    /// Upper bound of pooled connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long `get_connection` waits for a free connection.
    #[serde(deserialize_with = "seconds")]
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed.
    #[serde(deserialize_with = "optional_seconds")]
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed when returned.
    #[serde(deserialize_with = "optional_seconds")]
    pub max_lifetime: Option<Duration>,
    /// Ping connections before handing them out.
    pub test_before_acquire: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/dcache".to_string(),
            user: None,
            password: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            test_before_acquire: true,
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration for the given URL with default pool settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read `DATABASE_URL`, `DATABASE_USER` and `DATABASE_PASSWORD`.
    ///
    /// Returns `None` if `DATABASE_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(Self {
            user: std::env::var("DATABASE_USER").ok(),
            password: std::env::var("DATABASE_PASSWORD").ok(),
            ..Self::new(url)
        })
    }

    /// Set the user, overriding the one in the URL.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password, overriding the one in the URL.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the maximum number of pooled connections.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Configuration of the whole job storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database used by every kind without an override.
    pub database: DatabaseConfig,
    /// Per-kind database overrides.
    ///
    /// A file-request kind always follows its container kind, since the
    /// child table references the parent table.
    pub databases: HashMap<JobKind, DatabaseConfig>,
    /// Persist job history rows and every intermediate save.
    pub history_enabled: bool,
    /// How often the reaper looks for expired jobs.
    #[serde(deserialize_with = "seconds")]
    pub expired_request_removal_period: Duration,
    /// How many days expired terminal jobs are kept before removal.
    pub history_retention_days: u32,
    /// Force in-flight jobs into a final state at startup.
    pub clean_pending_requests_on_restart: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            databases: HashMap::new(),
            history_enabled: true,
            expired_request_removal_period: DEFAULT_REMOVAL_PERIOD,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
            clean_pending_requests_on_restart: false,
        }
    }
}

impl StoreConfig {
    /// Create a configuration storing every kind in one database.
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            ..Self::default()
        }
    }

    /// Store the given kind in a separate database.
    pub fn database_for(mut self, kind: JobKind, database: DatabaseConfig) -> Self {
        self.databases.insert(kind, database);
        self
    }

    /// Enable or disable history logging.
    pub fn history_enabled(mut self, enabled: bool) -> Self {
        self.history_enabled = enabled;
        self
    }

    /// Set the reaper period.
    pub fn expired_request_removal_period(mut self, period: Duration) -> Self {
        self.expired_request_removal_period = period;
        self
    }

    /// Set the number of days expired jobs are retained.
    pub fn history_retention_days(mut self, days: u32) -> Self {
        self.history_retention_days = days;
        self
    }

    /// Enable or disable clean-on-restart.
    pub fn clean_pending_requests_on_restart(mut self, clean: bool) -> Self {
        self.clean_pending_requests_on_restart = clean;
        self
    }

    /// The database configuration in effect for `kind`.
    pub fn database_of(&self, kind: JobKind) -> &DatabaseConfig {
        let owner = kind.parent().unwrap_or(kind);
        self.databases.get(&owner).unwrap_or(&self.database)
    }

    /// The retention window as a duration.
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.history_retention_days) * 24 * 60 * 60)
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_request_kinds_follow_their_container() {
        let get_db = DatabaseConfig::new("postgres://get-host/srm");
        let config = StoreConfig::new(DatabaseConfig::new("postgres://main/srm"))
            .database_for(JobKind::Get, get_db.clone())
            .database_for(JobKind::GetFile, DatabaseConfig::new("postgres://ignored/srm"));

        assert_eq!(config.database_of(JobKind::Get), &get_db);
        assert_eq!(config.database_of(JobKind::GetFile), &get_db);
        assert_eq!(config.database_of(JobKind::Put).url, "postgres://main/srm");
    }

    #[test]
    fn retention_is_counted_in_days() {
        let config = StoreConfig::default().history_retention_days(2);
        assert_eq!(config.history_retention(), Duration::from_secs(2 * 86_400));
    }
}
