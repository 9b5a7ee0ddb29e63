//! Configuration for the stream node
//!
//! Every knob is a plain scalar with a `Default`. `validate()` is the only
//! place configuration can fail; the node refuses to start on a
//! `ConfigError` and nothing downstream re-checks these bounds.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use types::errors::ConfigError;

/// Prefix of every environment variable read by [`NodeConfig::from_env`].
pub const ENV_PREFIX: &str = "MARKET_STREAM_";

/// Upper bound on the store connection pool.
pub const MAX_POOL_SIZE: u32 = 5;

/// Distribution side: event buffer, distributor timer, session registry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Events retained per category between drains.
    pub buffer_capacity: usize,
    /// Distributor timer period.
    pub tick_interval: Duration,
    /// Sessions silent for longer than this are unregistered.
    pub liveness_timeout: Duration,
    /// Empty batch sent to sessions idle for longer than this.
    pub heartbeat_interval: Duration,
    /// Hard deadline for one session's emit.
    pub emit_timeout: Duration,
    /// Cap on a single session's symbol filter.
    pub max_symbols_per_session: usize,
    /// Outbound frames buffered per WebSocket session.
    pub session_outbound_capacity: usize,
    /// Period of the metric threshold check.
    pub alert_check_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            tick_interval: Duration::from_millis(250),
            liveness_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            emit_timeout: Duration::from_secs(1),
            max_symbols_per_session: 500,
            session_outbound_capacity: 64,
            alert_check_interval: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("buffer_capacity", self.buffer_capacity as u64)?;
        non_zero_duration("tick_interval", self.tick_interval)?;
        non_zero_duration("liveness_timeout", self.liveness_timeout)?;
        non_zero_duration("heartbeat_interval", self.heartbeat_interval)?;
        non_zero_duration("emit_timeout", self.emit_timeout)?;
        non_zero("max_symbols_per_session", self.max_symbols_per_session as u64)?;
        non_zero("session_outbound_capacity", self.session_outbound_capacity as u64)?;
        non_zero_duration("alert_check_interval", self.alert_check_interval)?;

        if self.emit_timeout >= self.liveness_timeout {
            return Err(ConfigError::Exceeds {
                field: "emit_timeout_ms",
                value: millis(self.emit_timeout),
                limit_field: "liveness_timeout_ms",
                limit: millis(self.liveness_timeout),
            });
        }
        Ok(())
    }
}

/// Persistence side: intake queue, batching, store pool, retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    pub database_url: String,
    /// Minute-bar table.
    pub table: String,
    /// Applied-batch ledger table.
    pub ledger_table: String,
    /// Deltas held between flushes before the oldest are dropped.
    pub queue_capacity: usize,
    /// Deltas per store write.
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub pool_size: u32,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Committed delta ids remembered for re-delivery detection.
    pub dedup_window: usize,
    /// Budget for the final drain on shutdown.
    pub shutdown_flush_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/market".to_string(),
            table: "minute_bars".to_string(),
            ledger_table: "minute_bar_batches".to_string(),
            queue_capacity: 1000,
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            pool_size: MAX_POOL_SIZE,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            dedup_window: 10_000,
            shutdown_flush_timeout: Duration::from_secs(5),
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("queue_capacity", self.queue_capacity as u64)?;
        non_zero("batch_size", self.batch_size as u64)?;
        non_zero_duration("flush_interval", self.flush_interval)?;
        non_zero_duration("retry_base_delay", self.retry_base_delay)?;
        non_zero_duration("shutdown_flush_timeout", self.shutdown_flush_timeout)?;
        non_zero("dedup_window", self.dedup_window as u64)?;

        if !(1..=MAX_POOL_SIZE).contains(&self.pool_size) {
            return Err(ConfigError::OutOfRange {
                field: "pool_size",
                value: self.pool_size as u64,
                min: 1,
                max: MAX_POOL_SIZE as u64,
            });
        }
        if self.batch_size > self.queue_capacity {
            return Err(ConfigError::Exceeds {
                field: "batch_size",
                value: self.batch_size as u64,
                limit_field: "queue_capacity",
                limit: self.queue_capacity as u64,
            });
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::Exceeds {
                field: "retry_base_delay_ms",
                value: millis(self.retry_base_delay),
                limit_field: "retry_max_delay_ms",
                limit: millis(self.retry_max_delay),
            });
        }
        check_identifier("TABLE", &self.table)?;
        check_identifier("LEDGER_TABLE", &self.ledger_table)?;
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

/// Everything the node binary needs.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    pub stream: StreamConfig,
    pub persistence: PersistenceConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            stream: StreamConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults overlaid with `MARKET_STREAM_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`NodeConfig::from_env`] but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = NodeConfig::default();

        env.parse("BIND_ADDR", &mut config.bind_addr)?;

        let stream = &mut config.stream;
        env.parse("BUFFER_CAPACITY", &mut stream.buffer_capacity)?;
        env.millis("TICK_INTERVAL_MS", &mut stream.tick_interval)?;
        env.millis("LIVENESS_TIMEOUT_MS", &mut stream.liveness_timeout)?;
        env.millis("HEARTBEAT_INTERVAL_MS", &mut stream.heartbeat_interval)?;
        env.millis("EMIT_TIMEOUT_MS", &mut stream.emit_timeout)?;
        env.parse("MAX_SYMBOLS_PER_SESSION", &mut stream.max_symbols_per_session)?;
        env.parse("SESSION_OUTBOUND_CAPACITY", &mut stream.session_outbound_capacity)?;
        env.millis("ALERT_CHECK_INTERVAL_MS", &mut stream.alert_check_interval)?;

        let persistence = &mut config.persistence;
        env.parse("DATABASE_URL", &mut persistence.database_url)?;
        env.parse("TABLE", &mut persistence.table)?;
        env.parse("LEDGER_TABLE", &mut persistence.ledger_table)?;
        env.parse("QUEUE_CAPACITY", &mut persistence.queue_capacity)?;
        env.parse("BATCH_SIZE", &mut persistence.batch_size)?;
        env.millis("FLUSH_INTERVAL_MS", &mut persistence.flush_interval)?;
        env.parse("POOL_SIZE", &mut persistence.pool_size)?;
        env.parse("MAX_RETRIES", &mut persistence.max_retries)?;
        env.millis("RETRY_BASE_DELAY_MS", &mut persistence.retry_base_delay)?;
        env.millis("RETRY_MAX_DELAY_MS", &mut persistence.retry_max_delay)?;
        env.parse("DEDUP_WINDOW", &mut persistence.dedup_window)?;
        env.millis("SHUTDOWN_FLUSH_TIMEOUT_MS", &mut persistence.shutdown_flush_timeout)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.validate()?;
        self.persistence.validate()
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, suffix: &str, target: &mut T) -> Result<(), ConfigError> {
        let var = format!("{ENV_PREFIX}{suffix}");
        if let Some(raw) = (self.lookup)(&var) {
            *target = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var, value: raw })?;
        }
        Ok(())
    }

    fn millis(&self, suffix: &str, target: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = millis(*target);
        self.parse(suffix, &mut ms)?;
        *target = Duration::from_millis(ms);
        Ok(())
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn non_zero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

/// Table names are spliced into SQL text, so only plain identifiers pass.
fn check_identifier(suffix: &str, name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(ConfigError::InvalidEnv {
            var: format!("{ENV_PREFIX}{suffix}"),
            value: name.to_string(),
        });
    }
    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
