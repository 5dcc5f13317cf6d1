mod auth;
mod cluster;
mod error;
mod git;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;

use crate::cache::{CacheIndex, JobCacheStore, MemoryCacheIndex};
use crate::cluster::{ClusterDirectory, ClusterProxyClient};
use crate::config::Config;
use crate::lock::LockRegistry;
use crate::project::{AccessPolicy, ProjectRegistry, PullAuthorization};
use crate::work::WorkExecutor;

pub use auth::{caller_from_headers, Caller};
pub use error::ApiError;

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub registry: ProjectRegistry,
    pub directory: ClusterDirectory,
    pub proxy: ClusterProxyClient,
    pub locks: LockRegistry,
    pub work: WorkExecutor,
    pub cache: Arc<JobCacheStore>,
    pub policy: Arc<dyn AccessPolicy>,
    pub pull_authorizations: Arc<Vec<Box<dyn PullAuthorization>>>,
    /// Path of the git executable driving pack subprocesses.
    pub git_program: String,
    /// Flipped once the node is serving. Requests arriving earlier get 503
    /// so clients retry instead of failing on half-initialized state.
    pub ready: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    let cluster_routes = Router::new()
        .route("/~cluster/git-advertise-refs", get(cluster::git_advertise_refs))
        .route("/~cluster/git-pack", post(cluster::git_pack))
        .route(
            "/~cluster/cache",
            get(cluster::cache_download)
                .post(cluster::cache_upload)
                .delete(cluster::cache_delete),
        )
        .route("/~cluster/cache-size", get(cluster::cache_size))
        .route(
            "/~cluster/artifact",
            get(cluster::artifact_download).post(cluster::artifact_upload),
        )
        .route("/~cluster/site", get(cluster::site_download))
        .route(
            "/~cluster/attachment",
            get(cluster::attachment_download).post(cluster::attachment_upload),
        )
        .route(
            "/~cluster/pack-blob",
            get(cluster::pack_blob_download).post(cluster::pack_blob_upload),
        )
        .route("/~cluster/blob", get(cluster::blob_download))
        .route("/~cluster/commit-info", get(cluster::commit_info_download))
        .route("/~cluster/visit-info", get(cluster::visit_info_download))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_cluster_credential,
        ));

    let git_routes = Router::new()
        .route("/:project/info/refs", get(git::info_refs))
        .route("/:project/git-upload-pack", post(git::upload_pack))
        .route("/:project/git-receive-pack", post(git::receive_pack));

    cluster_routes
        .merge(git_routes)
        // Pushed packs and cache payloads can be arbitrarily large; they
        // are streamed, never buffered whole.
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024 * 1024))
        .with_state(state)
}

pub struct GrangeServer {
    state: AppState,
    bind_address: String,
    eviction_interval: Duration,
}

impl GrangeServer {
    /// Assemble a node from configuration. Must run inside the tokio
    /// runtime (the work executor spawns its workers here).
    pub fn new(config: &Config) -> Result<Self> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        let registry = ProjectRegistry::new(data_dir.clone(), config.project_entries());
        let directory = ClusterDirectory::new(
            config.advertised_address().to_string(),
            config.cluster.credential.clone(),
            config.owner_table()?,
            config.ownership_wait(),
        );
        let proxy = ClusterProxyClient::new(config.cluster.credential.clone());
        let locks = LockRegistry::new();

        let index: Arc<dyn CacheIndex> = match &config.cache.index_snapshot {
            Some(relative) => {
                std::fs::create_dir_all(&data_dir)?;
                Arc::new(MemoryCacheIndex::with_snapshot(data_dir.join(relative))?)
            }
            None => Arc::new(MemoryCacheIndex::new()),
        };
        let cache = Arc::new(JobCacheStore::new(
            registry.clone(),
            index,
            locks.clone(),
            directory.clone(),
            proxy.clone(),
            config.conflict_retry(),
        ));

        Ok(Self {
            state: AppState {
                registry,
                directory,
                proxy,
                locks,
                work: WorkExecutor::new(config.work.threads),
                cache,
                policy: Arc::new(config.access_policy()),
                pull_authorizations: Arc::new(Vec::new()),
                git_program: config.git.command.clone(),
                ready: Arc::new(AtomicBool::new(false)),
            },
            bind_address: config.server.bind_address.clone(),
            eviction_interval: config.eviction_interval(),
        })
    }

    /// Append a fallback pull authorization, consulted when the regular
    /// read check denies a fetch. Must be called before the state is
    /// shared.
    pub fn with_pull_authorization(mut self, authorization: Box<dyn PullAuthorization>) -> Self {
        Arc::get_mut(&mut self.state.pull_authorizations)
            .expect("pull authorizations are configured before the server starts")
            .push(authorization);
        self
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self.router();

        let store = self.state.cache.clone();
        let period = self.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so startup does not
            // begin with an eviction pass.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::debug!("running scheduled cache eviction");
                store.evict().await;
            }
        });

        self.state.ready.store(true, Ordering::SeqCst);
        axum::serve(listener, app).await?;
        Ok(())
    }
}
