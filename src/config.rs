//! Configuration resolution for the SSH gateway.
//!
//! Every knob follows a three-tier priority: explicit parameter (highest, used by
//! tests and programmatic callers) > environment variable > built-in default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORT` / `SSH_SERVER_PORT` | 3001 | HTTP/WebSocket listen port |
//! | `HOST` | `0.0.0.0` | Listen address |
//! | `CORS_ORIGIN` | unset | CSV or single allowed origin |
//! | `SSH_QUEUE_MAX_CONCURRENT` | 3 | Command Queue concurrency cap |
//! | `SSH_QUEUE_INTER_COMMAND_DELAY_MS` | 300 | Inter-command delay |
//! | `SSH_QUEUE_MAX_PENDING` | 256 | Queue backpressure bound |
//! | `SESSION_IDLE_TIMEOUT_SECS` | 1800 | Idle-session eviction threshold |
//! | `JANITOR_IDLE_SWEEP_INTERVAL_SECS` | 600 | Idle-sweep cadence |
//! | `JANITOR_MEMORY_SWEEP_INTERVAL_SECS` | 120 | Memory-sweep cadence |
//! | `MEMORY_PRESSURE_THRESHOLD_MIB` | 800 | Eviction threshold |
//! | `SSH_HARD_AUTH_TIMEOUT_SECS` | 15 | Hard auth timeout |
//! | `SSH_READY_TIMEOUT_SECS` | 30 | SSH dial/ready timeout |
//! | `SSH_HOST_KEY_POLICY` | `accept-any` | `accept-any` \| `tofu` |
//! | `SSH_KEEPALIVE_INTERVAL_SECS` | 10 | SSH-level keepalive cadence |
//! | `SSH_KEEPALIVE_MAX` | 3 | Missed keepalives before the connection is dead |
//! | `SSH_MAX_SESSIONS` | 6 | Concurrent session cap across the gateway |

use std::env;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_HOST: &str = "0.0.0.0";

pub const DEFAULT_QUEUE_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_QUEUE_INTER_COMMAND_DELAY_MS: u64 = 300;
pub const DEFAULT_QUEUE_MAX_PENDING: usize = 256;

pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_JANITOR_IDLE_SWEEP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_JANITOR_MEMORY_SWEEP_INTERVAL_SECS: u64 = 2 * 60;
pub const DEFAULT_MEMORY_PRESSURE_THRESHOLD_MIB: u64 = 800;

pub const DEFAULT_HARD_AUTH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SHELL_OPEN_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_OUTPUT_COALESCE_MS: u64 = 50;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_KEEPALIVE_MAX: u32 = 3;
pub const DEFAULT_MAX_SESSIONS: u32 = 6;

/// Host key verification policy. Default is `AcceptAny`, a documented weakness
/// carried from the source system; `Tofu` records the first key seen per host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    AcceptAny,
    Tofu,
}

fn resolve_string(param: Option<String>, env_var: &str) -> Option<String> {
    param.or_else(|| env::var(env_var).ok())
}

fn resolve_parsed<T: std::str::FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.parse::<T>()
    {
        return value;
    }
    default
}

pub fn resolve_port(param: Option<u16>) -> u16 {
    if let Some(value) = param {
        return value;
    }
    for var in ["PORT", "SSH_SERVER_PORT"] {
        if let Ok(raw) = env::var(var)
            && let Ok(value) = raw.parse::<u16>()
        {
            return value;
        }
    }
    DEFAULT_PORT
}

pub fn resolve_host(param: Option<String>) -> String {
    resolve_string(param, "HOST").unwrap_or_else(|| DEFAULT_HOST.to_string())
}

pub fn resolve_cors_origins(param: Option<String>) -> Vec<String> {
    resolve_string(param, "CORS_ORIGIN")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn resolve_queue_max_concurrent(param: Option<usize>) -> usize {
    resolve_parsed(param, "SSH_QUEUE_MAX_CONCURRENT", DEFAULT_QUEUE_MAX_CONCURRENT)
}

pub fn resolve_queue_inter_command_delay_ms(param: Option<u64>) -> u64 {
    resolve_parsed(
        param,
        "SSH_QUEUE_INTER_COMMAND_DELAY_MS",
        DEFAULT_QUEUE_INTER_COMMAND_DELAY_MS,
    )
}

pub fn resolve_queue_max_pending(param: Option<usize>) -> usize {
    resolve_parsed(param, "SSH_QUEUE_MAX_PENDING", DEFAULT_QUEUE_MAX_PENDING)
}

pub fn resolve_session_idle_timeout_secs(param: Option<u64>) -> u64 {
    resolve_parsed(
        param,
        "SESSION_IDLE_TIMEOUT_SECS",
        DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
    )
}

pub fn resolve_janitor_idle_sweep_interval_secs(param: Option<u64>) -> u64 {
    resolve_parsed(
        param,
        "JANITOR_IDLE_SWEEP_INTERVAL_SECS",
        DEFAULT_JANITOR_IDLE_SWEEP_INTERVAL_SECS,
    )
}

pub fn resolve_janitor_memory_sweep_interval_secs(param: Option<u64>) -> u64 {
    resolve_parsed(
        param,
        "JANITOR_MEMORY_SWEEP_INTERVAL_SECS",
        DEFAULT_JANITOR_MEMORY_SWEEP_INTERVAL_SECS,
    )
}

pub fn resolve_memory_pressure_threshold_mib(param: Option<u64>) -> u64 {
    resolve_parsed(
        param,
        "MEMORY_PRESSURE_THRESHOLD_MIB",
        DEFAULT_MEMORY_PRESSURE_THRESHOLD_MIB,
    )
}

pub fn resolve_hard_auth_timeout_secs(param: Option<u64>) -> u64 {
    resolve_parsed(param, "SSH_HARD_AUTH_TIMEOUT_SECS", DEFAULT_HARD_AUTH_TIMEOUT_SECS)
}

pub fn resolve_ready_timeout_secs(param: Option<u64>) -> u64 {
    resolve_parsed(param, "SSH_READY_TIMEOUT_SECS", DEFAULT_READY_TIMEOUT_SECS)
}

pub fn resolve_host_key_policy(param: Option<HostKeyPolicy>) -> HostKeyPolicy {
    if let Some(policy) = param {
        return policy;
    }
    match env::var("SSH_HOST_KEY_POLICY").ok().as_deref() {
        Some("tofu") => HostKeyPolicy::Tofu,
        _ => HostKeyPolicy::AcceptAny,
    }
}

pub fn resolve_keepalive_interval_secs(param: Option<u64>) -> u64 {
    resolve_parsed(param, "SSH_KEEPALIVE_INTERVAL_SECS", DEFAULT_KEEPALIVE_INTERVAL_SECS)
}

pub fn resolve_keepalive_max(param: Option<u32>) -> u32 {
    resolve_parsed(param, "SSH_KEEPALIVE_MAX", DEFAULT_KEEPALIVE_MAX)
}

pub fn resolve_max_sessions(param: Option<u32>) -> u32 {
    resolve_parsed(param, "SSH_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    unsafe fn set_env(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { env::remove_var(key) };
    }

    #[test]
    fn test_port_param_takes_priority() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { set_env("PORT", "9999") };
        let result = resolve_port(Some(4000));
        unsafe { remove_env("PORT") };
        assert_eq!(result, 4000);
    }

    #[test]
    fn test_port_default() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe {
            remove_env("PORT");
            remove_env("SSH_SERVER_PORT");
        }
        assert_eq!(resolve_port(None), DEFAULT_PORT);
    }

    #[test]
    fn test_port_falls_back_to_ssh_server_port() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe {
            remove_env("PORT");
            set_env("SSH_SERVER_PORT", "8123");
        }
        let result = resolve_port(None);
        unsafe { remove_env("SSH_SERVER_PORT") };
        assert_eq!(result, 8123);
    }

    #[test]
    fn test_cors_origins_csv() {
        let result = resolve_cors_origins(Some("https://a.com, https://b.com".to_string()));
        assert_eq!(result, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_cors_origins_empty() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { remove_env("CORS_ORIGIN") };
        assert!(resolve_cors_origins(None).is_empty());
    }

    #[test]
    fn test_queue_max_concurrent_default() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { remove_env("SSH_QUEUE_MAX_CONCURRENT") };
        assert_eq!(
            resolve_queue_max_concurrent(None),
            DEFAULT_QUEUE_MAX_CONCURRENT
        );
    }

    #[test]
    fn test_queue_max_concurrent_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { set_env("SSH_QUEUE_MAX_CONCURRENT", "7") };
        let result = resolve_queue_max_concurrent(None);
        unsafe { remove_env("SSH_QUEUE_MAX_CONCURRENT") };
        assert_eq!(result, 7);
    }

    #[test]
    fn test_host_key_policy_default_is_accept_any() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { remove_env("SSH_HOST_KEY_POLICY") };
        assert_eq!(resolve_host_key_policy(None), HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_host_key_policy_tofu_from_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { set_env("SSH_HOST_KEY_POLICY", "tofu") };
        let result = resolve_host_key_policy(None);
        unsafe { remove_env("SSH_HOST_KEY_POLICY") };
        assert_eq!(result, HostKeyPolicy::Tofu);
    }

    #[test]
    fn test_ignores_invalid_numeric_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { set_env("SSH_QUEUE_INTER_COMMAND_DELAY_MS", "not-a-number") };
        let result = resolve_queue_inter_command_delay_ms(None);
        unsafe { remove_env("SSH_QUEUE_INTER_COMMAND_DELAY_MS") };
        assert_eq!(result, DEFAULT_QUEUE_INTER_COMMAND_DELAY_MS);
    }

    #[test]
    fn test_keepalive_defaults() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe {
            remove_env("SSH_KEEPALIVE_INTERVAL_SECS");
            remove_env("SSH_KEEPALIVE_MAX");
        }
        assert_eq!(resolve_keepalive_interval_secs(None), DEFAULT_KEEPALIVE_INTERVAL_SECS);
        assert_eq!(resolve_keepalive_max(None), DEFAULT_KEEPALIVE_MAX);
    }

    #[test]
    fn test_max_sessions_param_takes_priority() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        unsafe { set_env("SSH_MAX_SESSIONS", "20") };
        let result = resolve_max_sessions(Some(2));
        unsafe { remove_env("SSH_MAX_SESSIONS") };
        assert_eq!(result, 2);
    }
}
