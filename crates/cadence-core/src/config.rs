//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub mailboxes: Vec<MailboxConfig>,
}

fn default_database_path() -> String { "~/.cadence/cadence.db".into() }

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sync: SyncConfig::default(),
            health: HealthConfig::default(),
            alert: AlertConfig::default(),
            mailboxes: Vec::new(),
        }
    }
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    fn validate(&self) -> Result<()> {
        for (name, policy) in [
            ("queue.sequence_step", &self.queue.sequence_step),
            ("queue.email_send", &self.queue.email_send),
        ] {
            if policy.max_attempts == 0 {
                return Err(CadenceError::Config(format!("{name}.max_attempts must be >= 1")));
            }
            if policy.factor < 1.0 {
                return Err(CadenceError::Config(format!("{name}.factor must be >= 1.0")));
            }
            if !(0.0..1.0).contains(&policy.jitter) {
                return Err(CadenceError::Config(format!("{name}.jitter must be in [0, 1)")));
            }
        }
        let h = &self.health;
        if !(h.warning <= h.error && h.error <= h.critical) {
            return Err(CadenceError::Config(
                "health thresholds must be ascending (warning <= error <= critical)".into(),
            ));
        }
        if self.worker.workers == 0 {
            return Err(CadenceError::Config("worker.workers must be >= 1".into()));
        }
        let limits = std::iter::once(("rate_limit".to_string(), self.rate_limit.per_second, self.rate_limit.per_minute))
            .chain(
                self.rate_limit
                    .overrides
                    .iter()
                    .map(|(id, o)| (format!("rate_limit.overrides.{id}"), o.per_second, o.per_minute)),
            );
        for (name, per_second, per_minute) in limits {
            if per_second == 0 || per_minute == 0 {
                return Err(CadenceError::Config(format!(
                    "{name}: per_second and per_minute must be >= 1"
                )));
            }
        }
        Ok(())
    }
}

/// Dispatcher worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long an idle worker sleeps before polling the queue again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Visibility timeout: a claimed job not completed within this is stalled.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Stalls tolerated before a job is failed outright.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub stalled_sweep_interval_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_workers() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_lease_secs() -> u64 { 180 }
fn default_max_stalled_count() -> u32 { 2 }
fn default_sweep_interval_secs() -> u64 { 30 }
fn default_shutdown_grace_secs() -> u64 { 30 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            max_stalled_count: default_max_stalled_count(),
            stalled_sweep_interval_secs: default_sweep_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Per job-class retry policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "RetryPolicy::sequence_step")]
    pub sequence_step: RetryPolicy,
    #[serde(default = "RetryPolicy::email_send")]
    pub email_send: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sequence_step: RetryPolicy::sequence_step(),
            email_send: RetryPolicy::email_send(),
        }
    }
}

/// Declarative exponential backoff.
///
/// After the n-th failed attempt (1-based) the job is delayed by
/// `min(max_delay_ms, base_delay_ms * factor^(n-1))`, spread by ±`jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Fractional random spread, 0.2 = ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_jitter() -> f64 { 0.2 }

impl RetryPolicy {
    pub fn sequence_step() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 300_000,
            jitter: default_jitter(),
        }
    }

    pub fn email_send() -> Self {
        Self {
            max_attempts: 2,
            ..Self::sequence_step()
        }
    }

    /// Un-jittered delay after `attempts_made` failed attempts.
    pub fn delay_ms(&self, attempts_made: u32) -> u64 {
        let exp = attempts_made.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.factor.powi(exp);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }
}

/// RateGate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_second")]
    pub per_second: u32,
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    /// Sleep between re-checks while a window is exhausted.
    #[serde(default = "default_quantum_ms")]
    pub quantum_ms: u64,
    /// Per-resource overrides keyed by mailbox id.
    #[serde(default)]
    pub overrides: HashMap<String, RateLimitOverride>,
}

fn default_per_second() -> u32 { 1 }
fn default_per_minute() -> u32 { 20 }
fn default_quantum_ms() -> u64 { 50 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: default_per_second(),
            per_minute: default_per_minute(),
            quantum_ms: default_quantum_ms(),
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Effective (per_second, per_minute) for a resource.
    pub fn limits_for(&self, resource: &str) -> (u32, u32) {
        match self.overrides.get(resource) {
            Some(o) => (o.per_second, o.per_minute),
            None => (self.per_second, self.per_minute),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub per_second: u32,
    pub per_minute: u32,
}

/// Mailbox history sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub poll_interval_secs: u64,
    /// Messages re-read on a full resync after the cursor expired.
    #[serde(default = "default_resync_window")]
    pub resync_window: usize,
    #[serde(default = "default_renew_margin")]
    pub watch_renew_margin_secs: u64,
}

fn default_sync_interval() -> u64 { 60 }
fn default_resync_window() -> usize { 50 }
fn default_renew_margin() -> u64 { 3600 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_sync_interval(),
            resync_window: default_resync_window(),
            watch_renew_margin_secs: default_renew_margin(),
        }
    }
}

/// HealthMonitor window and error-rate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_window")]
    pub window_secs: u64,
    #[serde(default = "default_warning")]
    pub warning: f64,
    #[serde(default = "default_error")]
    pub error: f64,
    #[serde(default = "default_critical")]
    pub critical: f64,
}

fn default_health_window() -> u64 { 86_400 }
fn default_warning() -> f64 { 0.05 }
fn default_error() -> f64 { 0.15 }
fn default_critical() -> f64 { 0.30 }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: default_health_window(),
            warning: default_warning(),
            error: default_error(),
            critical: default_critical(),
        }
    }
}

/// Where critical health alerts go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// A connected sending mailbox (SMTP out, IMAP in).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_imap_host")]
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    /// Login name; defaults to `email` when empty.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_folder")]
    pub folder: String,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_imap_host() -> String { "imap.gmail.com".into() }
fn default_imap_port() -> u16 { 993 }
fn default_folder() -> String { "INBOX".into() }

impl MailboxConfig {
    pub fn login(&self) -> &str {
        if self.username.is_empty() {
            &self.email
        } else {
            &self.username
        }
    }
}
