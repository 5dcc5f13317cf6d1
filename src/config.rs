use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::project::{ProjectEntry, StaticAccessPolicy, TokenAccess};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub work: WorkConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address peers use to reach this node. Defaults to the bind address.
    #[serde(default)]
    pub advertised_address: Option<String>,
    /// Shared secret for node-to-node calls. Must match on every node and
    /// must never be handed to end users.
    #[serde(default)]
    pub credential: String,
    /// How long to wait for ownership of a moving project to settle before
    /// failing a request.
    #[serde(default = "default_ownership_wait_secs")]
    pub ownership_wait_secs: u64,
    /// Initial project ownership: project id (as a string key) to node
    /// address. Updated at runtime by membership changes.
    #[serde(default)]
    pub owners: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Allow unauthenticated fetch from any project.
    #[serde(default)]
    pub anonymous_read: bool,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    #[serde(default)]
    pub write: bool,
    /// Projects the token covers; omit for all projects.
    #[serde(default)]
    pub projects: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Path of the git executable driving pack subprocesses. Resolved
    /// through PATH when not absolute.
    #[serde(default = "default_git_command")]
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Worker count of the pack subprocess executor.
    #[serde(default = "default_work_threads")]
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Delay before retrying cache row creation after a uniqueness
    /// conflict.
    #[serde(default = "default_conflict_retry_secs")]
    pub conflict_retry_secs: u64,
    /// Interval of the scheduled cache eviction pass.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Optional JSON snapshot file for cache metadata rows, relative to
    /// the data directory.
    #[serde(default = "default_index_snapshot")]
    pub index_snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: u64,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default = "default_cache_preserve_days")]
    pub cache_preserve_days: u32,
}

fn default_bind_address() -> String {
    "127.0.0.1:6610".to_string()
}

fn default_ownership_wait_secs() -> u64 {
    15
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_git_command() -> String {
    "git".to_string()
}

fn default_work_threads() -> usize {
    4
}

fn default_conflict_retry_secs() -> u64 {
    5
}

fn default_eviction_interval_secs() -> u64 {
    24 * 3600
}

fn default_index_snapshot() -> Option<String> {
    Some("caches.json".to_string())
}

fn default_cache_preserve_days() -> u32 {
    7
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address() }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            advertised_address: None,
            credential: String::new(),
            ownership_wait_secs: default_ownership_wait_secs(),
            owners: HashMap::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { command: default_git_command() }
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self { threads: default_work_threads() }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            conflict_retry_secs: default_conflict_retry_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            index_snapshot: default_index_snapshot(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Address peers dial to reach this node.
    pub fn advertised_address(&self) -> &str {
        self.cluster
            .advertised_address
            .as_deref()
            .unwrap_or(&self.server.bind_address)
    }

    pub fn ownership_wait(&self) -> Duration {
        Duration::from_secs(self.cluster.ownership_wait_secs)
    }

    pub fn conflict_retry(&self) -> Duration {
        Duration::from_secs(self.cache.conflict_retry_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.cache.eviction_interval_secs)
    }

    /// Ownership seed table with numeric project ids. Entries with
    /// non-numeric keys are rejected.
    pub fn owner_table(&self) -> Result<HashMap<u64, String>> {
        self.cluster
            .owners
            .iter()
            .map(|(id, address)| {
                let id = id
                    .parse()
                    .with_context(|| format!("invalid project id {id:?} in [cluster.owners]"))?;
                Ok((id, address.clone()))
            })
            .collect()
    }

    pub fn project_entries(&self) -> Vec<ProjectEntry> {
        self.projects
            .iter()
            .map(|p| ProjectEntry {
                id: p.id,
                parent: p.parent,
                cache_preserve_days: p.cache_preserve_days,
            })
            .collect()
    }

    pub fn access_policy(&self) -> StaticAccessPolicy {
        StaticAccessPolicy {
            anonymous_read: self.auth.anonymous_read,
            tokens: self
                .auth
                .tokens
                .iter()
                .map(|t| {
                    (
                        t.token.clone(),
                        TokenAccess {
                            write: t.write,
                            projects: t.projects.as_ref().map(|p| p.iter().copied().collect()),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "127.0.0.1:6610");
        assert_eq!(config.cluster.ownership_wait_secs, 15);
        assert_eq!(config.work.threads, 4);
        assert_eq!(config.git.command, "git");
        assert_eq!(config.cache.conflict_retry_secs, 5);
        assert_eq!(config.advertised_address(), "127.0.0.1:6610");
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind_address = "0.0.0.0:6610"

            [cluster]
            advertised_address = "10.0.0.1:6610"
            credential = "s3cret"

            [cluster.owners]
            1 = "10.0.0.1:6610"
            2 = "10.0.0.2:6610"

            [auth]
            anonymous_read = true

            [git]
            command = "/usr/local/bin/git"

            [[auth.tokens]]
            token = "builder"
            write = true
            projects = [1]

            [[projects]]
            id = 1

            [[projects]]
            id = 2
            parent = 1
            cache_preserve_days = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.advertised_address(), "10.0.0.1:6610");
        assert_eq!(config.git.command, "/usr/local/bin/git");
        let owners = config.owner_table().unwrap();
        assert_eq!(owners[&1], "10.0.0.1:6610");
        assert_eq!(owners[&2], "10.0.0.2:6610");

        let entries = config.project_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].parent, Some(1));
        assert_eq!(entries[1].cache_preserve_days, 3);
        assert_eq!(entries[0].cache_preserve_days, 7);

        let policy = config.access_policy();
        assert!(policy.anonymous_read);
        assert!(policy.tokens["builder"].write);
    }

    #[test]
    fn test_bad_owner_key_rejected() {
        let config: Config = toml::from_str(
            r#"
            [cluster.owners]
            website = "10.0.0.1:6610"
            "#,
        )
        .unwrap();
        assert!(config.owner_table().is_err());
    }
}
