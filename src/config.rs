//! Configuration management for pdfium-pool
//!
//! Everything is read from the environment (a `.env` file is loaded first by
//! the binaries). Malformed values fall back to their defaults with a warning.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub kind: PoolKind,
    /// Number of instances; exclusive pools always have one
    pub size: usize,
    pub acquire_timeout: Duration,
    /// How long `close` waits for outstanding leases
    pub close_timeout: Duration,
    /// Spawn a replacement when an instance is evicted
    pub replace_crashed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// One in-process instance behind a lock
    Exclusive,
    /// Several in-process instances, each with its own module
    InProcess,
    /// Several worker processes
    Workers,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Longest a single call may take before the worker counts as crashed
    pub call_timeout: Duration,
    /// Longest spawn plus handshake may take
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub backend: Backend,
    pub wasm_path: Option<PathBuf>,
    pub memory_limit_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Simulated,
    Wasm,
}

impl BackendConfig {
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            kind: PoolKind::Exclusive,
            size: 1,
            acquire_timeout: Duration::from_millis(30_000),
            close_timeout: Duration::from_millis(5_000),
            replace_crashed: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            command: default_worker_command(),
            args: Vec::new(),
            call_timeout: Duration::from_millis(30_000),
            startup_timeout: Duration::from_millis(10_000),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            backend: Backend::Simulated,
            wasm_path: None,
            memory_limit_mb: 512,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool: PoolConfig::default(),
            worker: WorkerConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

/// `pdfium-worker` next to the running executable
fn default_worker_command() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("pdfium-worker")))
        .unwrap_or_else(|| PathBuf::from("pdfium-worker"))
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "malformed configuration value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parsed(key, default.as_millis() as u64))
}

impl FromStr for PoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" | "single" => Ok(PoolKind::Exclusive),
            "in-process" | "multi" => Ok(PoolKind::InProcess),
            "workers" | "worker" => Ok(PoolKind::Workers),
            other => Err(format!("unknown pool kind {other}")),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" => Ok(Backend::Simulated),
            "wasm" | "webassembly" => Ok(Backend::Wasm),
            other => Err(format!("unknown backend {other}")),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            pool: PoolConfig {
                kind: parsed("PDFIUM_POOL_KIND", defaults.pool.kind),
                size: parsed("PDFIUM_POOL_SIZE", defaults.pool.size).max(1),
                acquire_timeout: millis("PDFIUM_POOL_ACQUIRE_TIMEOUT_MS", defaults.pool.acquire_timeout),
                close_timeout: millis("PDFIUM_POOL_CLOSE_TIMEOUT_MS", defaults.pool.close_timeout),
                replace_crashed: parsed("PDFIUM_POOL_REPLACE_CRASHED", defaults.pool.replace_crashed),
            },
            worker: WorkerConfig {
                command: env::var("PDFIUM_WORKER_COMMAND")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.worker.command),
                args: env::var("PDFIUM_WORKER_ARGS")
                    .map(|args| args.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                call_timeout: millis("PDFIUM_WORKER_CALL_TIMEOUT_MS", defaults.worker.call_timeout),
                startup_timeout: millis(
                    "PDFIUM_WORKER_STARTUP_TIMEOUT_MS",
                    defaults.worker.startup_timeout,
                ),
            },
            backend: BackendConfig {
                backend: parsed("PDFIUM_BACKEND", defaults.backend.backend),
                wasm_path: env::var("PDFIUM_WASM_PATH").ok().map(PathBuf::from),
                memory_limit_mb: parsed("PDFIUM_MEMORY_LIMIT_MB", defaults.backend.memory_limit_mb),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.kind, PoolKind::Exclusive);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.pool.close_timeout, Duration::from_secs(5));
        assert!(config.pool.replace_crashed);
        assert_eq!(config.backend.backend, Backend::Simulated);
        assert_eq!(config.backend.memory_limit_bytes(), 512 * 1024 * 1024);
        assert!(config.worker.command.ends_with("pdfium-worker"));
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!("Workers".parse::<PoolKind>(), Ok(PoolKind::Workers));
        assert_eq!("in-process".parse::<PoolKind>(), Ok(PoolKind::InProcess));
        assert!("threads".parse::<PoolKind>().is_err());
        assert_eq!("WASM".parse::<Backend>(), Ok(Backend::Wasm));
    }

    #[test]
    fn test_from_env_falls_back_on_malformed_values() {
        // keys unique to this test, so parallel tests do not interfere
        env::set_var("PDFIUM_TEST_ONLY_NUMBER", "not-a-number");
        assert_eq!(parsed("PDFIUM_TEST_ONLY_NUMBER", 7usize), 7);
        env::set_var("PDFIUM_TEST_ONLY_NUMBER", " 42 ");
        assert_eq!(parsed("PDFIUM_TEST_ONLY_NUMBER", 7usize), 42);
        env::remove_var("PDFIUM_TEST_ONLY_NUMBER");
        assert_eq!(millis("PDFIUM_TEST_ONLY_NUMBER", Duration::from_millis(5)), Duration::from_millis(5));
    }
}
