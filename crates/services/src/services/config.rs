use std::{env, time::Duration};

/// Orchestration tunables, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ring-buffer capacity of each run's log relay.
    pub relay_capacity: usize,
    /// Interval between relay heartbeat events.
    pub heartbeat_interval: Duration,
    /// Interval between sandbox liveness checks while a run is active.
    pub liveness_poll_interval: Duration,
    /// How long a stopped agent gets to exit before it is killed.
    pub stop_grace: Duration,
    /// Upper bound on a single provision attempt.
    pub provision_timeout: Duration,
    /// Command launched inside the sandbox to run the agent.
    pub agent_command: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            relay_capacity: 1024,
            heartbeat_interval: Duration::from_secs(15),
            liveness_poll_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(300),
            agent_command: "agent-runner".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_capacity: parsed_env_or("RELAY_CAPACITY", defaults.relay_capacity),
            heartbeat_interval: secs_env_or("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            liveness_poll_interval: secs_env_or(
                "LIVENESS_POLL_SECS",
                defaults.liveness_poll_interval,
            ),
            stop_grace: secs_env_or("STOP_GRACE_SECS", defaults.stop_grace),
            provision_timeout: secs_env_or("PROVISION_TIMEOUT_SECS", defaults.provision_timeout),
            agent_command: env::var("AGENT_COMMAND")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.agent_command),
        }
    }
}

fn parsed_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_env_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
