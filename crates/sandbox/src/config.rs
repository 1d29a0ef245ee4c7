use std::{env, path::PathBuf};

/// Sandbox runtime knobs, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image every project sandbox is created from.
    pub base_image: String,
    /// Docker network to attach sandboxes to, if any.
    pub network: Option<String>,
    /// Host directory under which per-project workspaces live.
    pub volume_prefix: PathBuf,
    pub memory_limit: String,
    pub cpu_limit: f64,
    /// Prefix for container names, followed by the project id.
    pub container_prefix: String,
    /// `--depth` used when cloning project repositories.
    pub git_depth: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_image: "agent-base:latest".to_string(),
            network: None,
            volume_prefix: PathBuf::from("/tmp/agent-workspaces"),
            memory_limit: "2g".to_string(),
            cpu_limit: 2.0,
            container_prefix: "agent-sbx".to_string(),
            git_depth: 1,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_image: env_or("SANDBOX_BASE_IMAGE", defaults.base_image),
            network: env::var("SANDBOX_NETWORK").ok().filter(|v| !v.is_empty()),
            volume_prefix: env::var("SANDBOX_VOLUME_PREFIX")
                .map(PathBuf::from)
                .unwrap_or(defaults.volume_prefix),
            memory_limit: env_or("SANDBOX_MEMORY_LIMIT", defaults.memory_limit),
            cpu_limit: parsed_env_or("SANDBOX_CPU_LIMIT", defaults.cpu_limit),
            container_prefix: env_or("SANDBOX_CONTAINER_PREFIX", defaults.container_prefix),
            git_depth: parsed_env_or("SANDBOX_GIT_DEPTH", defaults.git_depth),
        }
    }

    /// Container name for a project's sandbox.
    pub fn container_name(&self, project_id: &str) -> String {
        format!("{}-{}", self.container_prefix, project_id)
    }

    /// Host workspace directory for a project.
    pub fn workspace_dir(&self, project_id: &str) -> PathBuf {
        self.volume_prefix.join(project_id)
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn parsed_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
