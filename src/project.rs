//! Project registry
//!
//! Projects are opaque integer ids arranged in a tree. Each project maps to
//! a directory root holding its git repository, build artifacts, job caches
//! and generated site. Which node holds that directory is decided
//! elsewhere (see [`crate::cluster`]); this registry only answers layout
//! and hierarchy questions, plus the yes/no permission boundary the git
//! router consumes.

use axum::http::HeaderMap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProjectEntry {
    pub id: u64,
    pub parent: Option<u64>,
    /// Retention window for job caches, in days.
    pub cache_preserve_days: u32,
}

/// Layout and hierarchy of the projects this deployment knows about.
#[derive(Clone)]
pub struct ProjectRegistry {
    root: PathBuf,
    projects: HashMap<u64, ProjectEntry>,
}

impl ProjectRegistry {
    pub fn new(root: impl Into<PathBuf>, projects: Vec<ProjectEntry>) -> Self {
        Self {
            root: root.into(),
            projects: projects.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    pub fn get(&self, id: u64) -> Option<&ProjectEntry> {
        self.projects.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.projects.keys().copied()
    }

    pub fn parent(&self, id: u64) -> Option<u64> {
        self.projects.get(&id).and_then(|p| p.parent)
    }

    pub fn cache_preserve_days(&self, id: u64) -> Option<u32> {
        self.projects.get(&id).map(|p| p.cache_preserve_days)
    }

    pub fn project_dir(&self, id: u64) -> PathBuf {
        self.root.join("projects").join(id.to_string())
    }

    pub fn git_dir(&self, id: u64) -> PathBuf {
        self.project_dir(id).join("git")
    }

    pub fn cache_dir(&self, id: u64) -> PathBuf {
        self.project_dir(id).join("cache")
    }

    pub fn artifacts_dir(&self, id: u64, build_number: u64) -> PathBuf {
        self.project_dir(id)
            .join("artifacts")
            .join(build_number.to_string())
    }

    pub fn site_dir(&self, id: u64) -> PathBuf {
        self.project_dir(id).join("site")
    }

    pub fn attachment_dir(&self, id: u64, group: &str) -> PathBuf {
        self.project_dir(id).join("attachment").join(group)
    }

    /// File of a package registry blob, content-addressed and sharded by
    /// the first two hash characters.
    pub fn pack_blob_file(&self, id: u64, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or(hash);
        self.project_dir(id).join("packages").join(shard).join(hash)
    }

    /// Directory of an exported server-side index (commit info, visit info).
    pub fn index_dir(&self, id: u64, kind: &str) -> PathBuf {
        self.project_dir(id).join("index").join(kind)
    }
}

/// Parse the project component of a git URL. Clients may append `.git`.
pub fn parse_project_component(component: &str) -> Option<u64> {
    let trimmed = component.strip_suffix(".git").unwrap_or(component);
    trimmed.parse().ok()
}

/// Join a caller-supplied relative path onto `base`, refusing traversal
/// outside it.
pub fn join_sandboxed(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut joined = base.to_path_buf();
    for part in relative.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains('\\') => return None,
            part => joined.push(part),
        }
    }
    Some(joined)
}

/// Yes/no permission boundary consumed by the git router. Policy
/// evaluation itself lives outside this core.
pub trait AccessPolicy: Send + Sync {
    fn can_read(&self, principal: Option<&str>, project_id: u64) -> bool;
    fn can_write(&self, principal: Option<&str>, project_id: u64) -> bool;
}

/// One link in the chain of alternative pull authorizations (build-scoped
/// tokens and the like), consulted in order when the regular read check
/// denies a fetch.
pub trait PullAuthorization: Send + Sync {
    fn can_pull(&self, headers: &HeaderMap, project_id: u64) -> bool;
}

/// Token access table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenAccess {
    pub write: bool,
    /// None grants access to every project.
    pub projects: Option<HashSet<u64>>,
}

impl TokenAccess {
    fn covers(&self, project_id: u64) -> bool {
        match &self.projects {
            Some(projects) => projects.contains(&project_id),
            None => true,
        }
    }
}

/// Static policy: optional anonymous read plus a token table.
#[derive(Default)]
pub struct StaticAccessPolicy {
    pub anonymous_read: bool,
    pub tokens: HashMap<String, TokenAccess>,
}

impl AccessPolicy for StaticAccessPolicy {
    fn can_read(&self, principal: Option<&str>, project_id: u64) -> bool {
        if self.anonymous_read {
            return true;
        }
        principal
            .and_then(|p| self.tokens.get(p))
            .map(|t| t.covers(project_id))
            .unwrap_or(false)
    }

    fn can_write(&self, principal: Option<&str>, project_id: u64) -> bool {
        principal
            .and_then(|p| self.tokens.get(p))
            .map(|t| t.write && t.covers(project_id))
            .unwrap_or(false)
    }
}
