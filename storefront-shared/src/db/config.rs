/// Connection parameters and their validation
///
/// [`PoolConfig::validate`] turns a raw key/value mapping (normally the
/// process environment) into an immutable [`PoolConfig`], or fails with a
/// [`ConfigurationError`] that names every missing key at once. Validation is
/// pure; no connection is opened.
///
/// # Environment Variables
///
/// - `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_DATABASE` (required)
/// - `DB_POOL_MAX`: maximum leased connections (default: 10)
/// - `DB_IDLE_TIMEOUT_MS`: idle lifetime before reclamation (default: 30000)
/// - `DB_CONNECT_TIMEOUT_MS`: how long `acquire` waits, opening included (default: 2000, at least 1)
/// - `DB_MAX_USES`: executions before a connection is retired (default: 7500)
/// - `DB_SSL_MODE`: disable | prefer | require | verify-ca | verify-full
///   (default: disable for local hosts, require otherwise)
/// - `DB_SSL_ROOT_CERT`: CA certificate path
/// - `DB_SLOW_QUERY_MS`: slow query log threshold (default: 1000)
/// - `DB_STATEMENT_TIMEOUT_MS`: server-side statement timeout (default: unset)
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use storefront_shared::db::config::{PoolConfig, SslMode};
///
/// let raw: HashMap<String, String> = [
///     ("host", "localhost"),
///     ("port", "5432"),
///     ("user", "shop"),
///     ("password", "secret"),
///     ("database", "shop"),
/// ]
/// .into_iter()
/// .map(|(k, v)| (k.to_string(), v.to_string()))
/// .collect();
///
/// let config = PoolConfig::validate(&raw).unwrap();
/// assert_eq!(config.max_connections, 10);
/// assert_eq!(config.ssl_mode, SslMode::Disable);
/// ```

use crate::db::error::ConfigurationError;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum number of leased connections
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default idle lifetime (30 seconds)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default time `acquire` waits for a free connection (2 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Default number of executions before a connection is retired
pub const DEFAULT_MAX_USES: u64 = 7_500;

/// Default slow query log threshold (1 second)
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1_000);

/// Required keys, in the order they are reported when missing
const REQUIRED_KEYS: [&str; 5] = ["host", "port", "user", "password", "database"];

const LOCAL_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Transport encryption mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// Disabled on local hosts, required everywhere else
    pub fn default_for_host(host: &str) -> Self {
        if LOCAL_HOSTS.contains(&host) {
            SslMode::Disable
        } else {
            SslMode::Require
        }
    }
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" | "false" | "off" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" | "true" | "on" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            other => Err(format!(
                "unknown mode `{}` (expected disable, prefer, require, verify-ca or verify-full)",
                other
            )),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        f.write_str(s)
    }
}

/// Validated, immutable connection pool configuration
#[derive(Clone, PartialEq)]
pub struct PoolConfig {
    /// Database server host
    pub host: String,

    /// Database server port (1-65535)
    pub port: u16,

    /// Login role
    pub user: String,

    /// Login password (redacted in `Debug` output)
    pub password: String,

    /// Database name
    pub database: String,

    /// Maximum number of concurrently leased connections
    pub max_connections: u32,

    /// How long an idle connection may live before it is reclaimed
    pub idle_timeout: Duration,

    /// How long `acquire` waits before failing with a pool timeout
    pub connect_timeout: Duration,

    /// Executions after which a connection is retired instead of reused
    pub max_uses: u64,

    /// Transport encryption mode
    pub ssl_mode: SslMode,

    /// CA certificate used for `verify-ca` / `verify-full`
    pub ssl_root_cert: Option<PathBuf>,

    /// Queries at or above this duration are logged as slow
    pub slow_query_threshold: Duration,

    /// Server-side statement timeout, if any
    pub statement_timeout: Option<Duration>,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout", &self.idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_uses", &self.max_uses)
            .field("ssl_mode", &self.ssl_mode)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .field("slow_query_threshold", &self.slow_query_threshold)
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

impl PoolConfig {
    /// Creates a configuration with default tunables
    ///
    /// TLS mode follows the host: disabled for local hosts, required otherwise.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let ssl_mode = SslMode::default_for_host(&host);
        Self {
            host,
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_uses: DEFAULT_MAX_USES,
            ssl_mode,
            ssl_root_cert: None,
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            statement_timeout: None,
        }
    }

    /// Set the maximum number of leased connections
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the time `acquire` waits for a free connection
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the idle lifetime
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the number of executions before retirement
    pub fn with_max_uses(mut self, max_uses: u64) -> Self {
        self.max_uses = max_uses;
        self
    }

    /// Set the slow query threshold
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Validates a raw key/value mapping
    ///
    /// Keys are lowercase without prefix (`host`, `pool_max`, ...). Blank values
    /// count as absent.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::Missing`] listing every absent required key
    /// - [`ConfigurationError::Invalid`] for an out-of-range port, a negative or
    ///   non-numeric tunable, a zero pool size, or an unknown TLS mode
    pub fn validate(raw: &HashMap<String, String>) -> Result<Self, ConfigurationError> {
        let lookup = |key: &str| {
            raw.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|&&key| lookup(key).is_none())
            .map(|key| key.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(ConfigurationError::Missing { keys: missing });
        }

        // Presence checked above
        let required = |key: &str| lookup(key).unwrap_or_default().to_string();

        let port = parse_port(&required("port"))?;
        let host = required("host");

        let max_connections = parse_number(lookup("pool_max"), "pool_max")?
            .unwrap_or(u64::from(DEFAULT_MAX_CONNECTIONS));
        if max_connections == 0 {
            return Err(invalid("pool_max", "must be at least 1"));
        }
        let max_connections = u32::try_from(max_connections)
            .map_err(|_| invalid("pool_max", "value is too large"))?;

        let idle_timeout = parse_number(lookup("idle_timeout_ms"), "idle_timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let connect_timeout = parse_number(lookup("connect_timeout_ms"), "connect_timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        if connect_timeout.is_zero() {
            return Err(invalid("connect_timeout_ms", "must be at least 1"));
        }

        let max_uses = parse_number(lookup("max_uses"), "max_uses")?.unwrap_or(DEFAULT_MAX_USES);

        let slow_query_threshold = parse_number(lookup("slow_query_ms"), "slow_query_ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SLOW_QUERY_THRESHOLD);

        let statement_timeout =
            parse_number(lookup("statement_timeout_ms"), "statement_timeout_ms")?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);

        let ssl_mode = match lookup("ssl_mode") {
            Some(mode) => mode
                .parse::<SslMode>()
                .map_err(|reason| invalid("ssl_mode", &reason))?,
            None => SslMode::default_for_host(&host),
        };

        Ok(Self {
            host,
            port,
            user: required("user"),
            password: required("password"),
            database: required("database"),
            max_connections,
            idle_timeout,
            connect_timeout,
            max_uses,
            ssl_mode,
            ssl_root_cert: lookup("ssl_root_cert").map(PathBuf::from),
            slow_query_threshold,
            statement_timeout,
        })
    }

    /// Loads and validates `DB_*` variables from the process environment
    ///
    /// A `.env` file is loaded first if present (for development).
    ///
    /// # Errors
    ///
    /// Same as [`PoolConfig::validate`], plus [`ConfigurationError::Source`] if
    /// the environment cannot be read.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        dotenvy::dotenv().ok();

        let raw = config::Config::builder()
            .add_source(config::Environment::with_prefix("DB"))
            .build()
            .and_then(|c| c.try_deserialize::<HashMap<String, String>>())
            .map_err(|e| ConfigurationError::Source(e.to_string()))?;

        Self::validate(&raw)
    }

    /// Host, port and database, safe to log
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_port(raw: &str) -> Result<u16, ConfigurationError> {
    let port: i64 = raw
        .parse()
        .map_err(|_| invalid("port", &format!("`{}` is not an integer", raw)))?;

    if !(1..=65_535).contains(&port) {
        return Err(invalid("port", &format!("{} is outside 1-65535", port)));
    }

    Ok(port as u16)
}

fn parse_number(raw: Option<&str>, key: &str) -> Result<Option<u64>, ConfigurationError> {
    match raw {
        None => Ok(None),
        Some(value) => value.parse::<u64>().map(Some).map_err(|_| {
            invalid(
                key,
                &format!("`{}` is not a non-negative integer", value),
            )
        }),
    }
}
