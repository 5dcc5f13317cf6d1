//! Internal node-to-node endpoints
//!
//! Everything under `/~cluster` is the private surface peers call when a
//! request lands on a node that does not own the target project. Callers
//! hold the shared cluster credential (enforced by middleware in the
//! router) and have already performed end-user permission checks, so
//! handlers here trust their parameters.
//!
//! Git handlers run their subprocess inline rather than through the work
//! executor: the originating node already queued the request through its
//! own pool, and parking it here again could wedge both pools against each
//! other.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};

use grange_git::{PackProcess, Service};

use crate::lock::{artifacts_lock_key, attachment_lock_key, pack_blob_lock_key, site_lock_key};
use crate::project::join_sandboxed;
use crate::server::error::ApiError;
use crate::server::git::PRINCIPAL_ENV;
use crate::server::AppState;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

fn service_for(upload: bool) -> Service {
    if upload {
        Service::UploadPack
    } else {
        Service::ReceivePack
    }
}

fn local_git_dir(state: &AppState, project_id: u64) -> Result<PathBuf, ApiError> {
    let git_dir = state.registry.git_dir(project_id);
    if git_dir.is_dir() {
        Ok(git_dir)
    } else {
        Err(ApiError::NotFound(format!(
            "repository of project {project_id} not found"
        )))
    }
}

fn resolve_file(base: PathBuf, relative: &str) -> Result<PathBuf, ApiError> {
    join_sandboxed(&base, relative)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid path {relative:?}")))
}

/// Open `path` and stream it while keeping `guard` held until the last
/// byte is sent.
async fn stream_file_guarded<G: Send + 'static>(
    guard: G,
    path: PathBuf,
) -> Result<Body, ApiError> {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("{} not found", path.display())));
        }
        Err(e) => return Err(e.into()),
    };
    let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    tokio::spawn(async move {
        let _guard = guard;
        let mut file = file;
        if let Err(e) = tokio::io::copy(&mut file, &mut server_side).await {
            tracing::warn!("file stream aborted: {e}");
        }
    });
    Ok(Body::from_stream(ReaderStream::new(client_side)))
}

/// Stream `body` into a freshly created file at `path`, creating parent
/// directories. The caller holds the appropriate write lock.
async fn receive_file(path: &PathBuf, body: Body) -> Result<(), ApiError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut input = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    tokio::io::copy(&mut input, &mut file).await?;
    file.flush().await?;
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAdvertiseQuery {
    project_id: u64,
    upload: bool,
    protocol: Option<String>,
}

/// GET /~cluster/git-advertise-refs
pub async fn git_advertise_refs(
    State(state): State<AppState>,
    Query(query): Query<GitAdvertiseQuery>,
) -> Result<Body, ApiError> {
    let git_dir = local_git_dir(&state, query.project_id)?;
    let service = service_for(query.upload);
    let process = PackProcess::spawn_advertisement(
        &state.git_program,
        &git_dir,
        service,
        query.protocol.as_deref(),
    )?;
    let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    tokio::spawn(async move {
        if let Err(e) = process.stream_advertisement(&mut server_side).await {
            tracing::warn!(query.project_id, "relayed ref advertisement failed: {e}");
        }
    });
    Ok(Body::from_stream(ReaderStream::new(client_side)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitPackQuery {
    project_id: u64,
    upload: bool,
    principal: Option<String>,
    protocol: Option<String>,
}

/// POST /~cluster/git-pack
pub async fn git_pack(
    State(state): State<AppState>,
    Query(query): Query<GitPackQuery>,
    body: Body,
) -> Result<Body, ApiError> {
    let git_dir = local_git_dir(&state, query.project_id)?;
    let service = service_for(query.upload);
    let mut envs = HashMap::new();
    if let Some(principal) = &query.principal {
        envs.insert(PRINCIPAL_ENV.to_string(), principal.clone());
    }
    let process = PackProcess::spawn_negotiation(
        &state.git_program,
        &git_dir,
        service,
        query.protocol.as_deref(),
        &envs,
    )?;
    let mut input = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    tokio::spawn(async move {
        if let Err(e) = process.stream(&mut input, &mut server_side).await {
            tracing::warn!(query.project_id, service = service.name(), "relayed pack run failed: {e}");
        }
    });
    Ok(Body::from_stream(ReaderStream::new(client_side)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheQuery {
    project_id: u64,
    cache_id: u64,
    /// Newline-joined cache path list, matching the stamp format.
    #[serde(default)]
    cache_paths: String,
}

fn split_cache_paths(joined: &str) -> Vec<String> {
    joined.split('\n').map(|s| s.to_string()).collect()
}

/// GET /~cluster/cache, sentinel-prefixed cache payload (1 = hit then
/// marks and data, 0 = miss).
pub async fn cache_download(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Result<Body, ApiError> {
    let paths = split_cache_paths(&query.cache_paths);
    let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let cache = state.cache.clone();
    tokio::spawn(async move {
        if let Err(e) = cache
            .download_with_sentinel(query.project_id, query.cache_id, &paths, &mut server_side)
            .await
        {
            tracing::warn!(query.project_id, query.cache_id, "cache download failed: {e}");
        }
    });
    Ok(Body::from_stream(ReaderStream::new(client_side)))
}

/// POST /~cluster/cache
pub async fn cache_upload(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let paths = split_cache_paths(&query.cache_paths);
    let mut input = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    state
        .cache
        .upload(query.project_id, query.cache_id, &paths, &mut input)
        .await?;
    Ok(StatusCode::OK)
}

/// DELETE /~cluster/cache: remove the local payload directory. The
/// metadata row was already removed by the caller.
pub async fn cache_delete(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .cache
        .remove_local_dir(query.project_id, query.cache_id)
        .await?;
    Ok(StatusCode::OK)
}

/// GET /~cluster/cache-size, decimal byte count of the cache payload.
pub async fn cache_size(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Result<String, ApiError> {
    match state.cache.cache_size(query.project_id, query.cache_id).await? {
        Some(size) => Ok(size.to_string()),
        None => Err(ApiError::NotFound(format!(
            "cache {} of project {} not found",
            query.cache_id, query.project_id
        ))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactQuery {
    project_id: u64,
    build_number: u64,
    artifact_path: String,
}

/// GET /~cluster/artifact
pub async fn artifact_download(
    State(state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Body, ApiError> {
    let base = state.registry.artifacts_dir(query.project_id, query.build_number);
    let path = resolve_file(base, &query.artifact_path)?;
    let guard = state
        .locks
        .read(&artifacts_lock_key(query.project_id, query.build_number))
        .await;
    stream_file_guarded(guard, path).await
}

/// POST /~cluster/artifact
pub async fn artifact_upload(
    State(state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let base = state.registry.artifacts_dir(query.project_id, query.build_number);
    let path = resolve_file(base, &query.artifact_path)?;
    let _guard = state
        .locks
        .write(&artifacts_lock_key(query.project_id, query.build_number))
        .await;
    receive_file(&path, body).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackBlobQuery {
    project_id: u64,
    hash: String,
}

fn pack_blob_path(state: &AppState, project_id: u64, hash: &str) -> Result<PathBuf, ApiError> {
    // Content hashes are plain hex; anything else is not a blob we store.
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ApiError::BadRequest(format!("invalid blob hash {hash:?}")));
    }
    Ok(state.registry.pack_blob_file(project_id, hash))
}

/// GET /~cluster/pack-blob, raw bytes of a package registry blob stored by
/// content hash.
pub async fn pack_blob_download(
    State(state): State<AppState>,
    Query(query): Query<PackBlobQuery>,
) -> Result<Body, ApiError> {
    let path = pack_blob_path(&state, query.project_id, &query.hash)?;
    let guard = state
        .locks
        .read(&pack_blob_lock_key(query.project_id, &query.hash))
        .await;
    stream_file_guarded(guard, path).await
}

/// POST /~cluster/pack-blob
pub async fn pack_blob_upload(
    State(state): State<AppState>,
    Query(query): Query<PackBlobQuery>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let path = pack_blob_path(&state, query.project_id, &query.hash)?;
    let _guard = state
        .locks
        .write(&pack_blob_lock_key(query.project_id, &query.hash))
        .await;
    receive_file(&path, body).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteQuery {
    project_id: u64,
    file_path: String,
}

/// GET /~cluster/site
pub async fn site_download(
    State(state): State<AppState>,
    Query(query): Query<SiteQuery>,
) -> Result<Body, ApiError> {
    let base = state.registry.site_dir(query.project_id);
    let path = resolve_file(base, &query.file_path)?;
    let guard = state.locks.read(&site_lock_key(query.project_id)).await;
    stream_file_guarded(guard, path).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentQuery {
    project_id: u64,
    attachment_group: String,
    attachment: String,
}

/// GET /~cluster/attachment
pub async fn attachment_download(
    State(state): State<AppState>,
    Query(query): Query<AttachmentQuery>,
) -> Result<Body, ApiError> {
    let base = state
        .registry
        .attachment_dir(query.project_id, &query.attachment_group);
    let path = resolve_file(base, &query.attachment)?;
    let guard = state
        .locks
        .read(&attachment_lock_key(query.project_id, &query.attachment_group))
        .await;
    stream_file_guarded(guard, path).await
}

/// POST /~cluster/attachment
pub async fn attachment_upload(
    State(state): State<AppState>,
    Query(query): Query<AttachmentQuery>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let base = state
        .registry
        .attachment_dir(query.project_id, &query.attachment_group);
    let path = resolve_file(base, &query.attachment)?;
    let _guard = state
        .locks
        .write(&attachment_lock_key(query.project_id, &query.attachment_group))
        .await;
    receive_file(&path, body).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobQuery {
    project_id: u64,
    revision: String,
    path: String,
}

/// GET /~cluster/blob, raw content of a blob at `revision:path`.
pub async fn blob_download(
    State(state): State<AppState>,
    Query(query): Query<BlobQuery>,
) -> Result<Body, ApiError> {
    let git_dir = local_git_dir(&state, query.project_id)?;
    let git_program = state.git_program.clone();
    let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    tokio::spawn(async move {
        if let Err(e) = grange_git::cat_file_blob(
            &git_program,
            &git_dir,
            &query.revision,
            &query.path,
            &mut server_side,
        )
        .await
        {
            tracing::warn!(query.project_id, "blob stream failed: {e}");
        }
    });
    Ok(Body::from_stream(ReaderStream::new(client_side)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexQuery {
    project_id: u64,
}

/// GET /~cluster/commit-info, a tar archive of the commit info index, used
/// when a project moves to another node.
pub async fn commit_info_download(
    State(state): State<AppState>,
    Query(query): Query<IndexQuery>,
) -> Result<Body, ApiError> {
    index_archive(&state, query.project_id, "commit").await
}

/// GET /~cluster/visit-info, a tar archive of the visit info index.
pub async fn visit_info_download(
    State(state): State<AppState>,
    Query(query): Query<IndexQuery>,
) -> Result<Body, ApiError> {
    index_archive(&state, query.project_id, "visit").await
}

async fn index_archive(state: &AppState, project_id: u64, kind: &str) -> Result<Body, ApiError> {
    let dir = state.registry.index_dir(project_id, kind);
    if !dir.is_dir() {
        return Err(ApiError::NotFound(format!(
            "{kind} index of project {project_id} not found"
        )));
    }
    let (client_side, server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    // The tar builder is synchronous; bridge it onto the duplex from a
    // blocking thread.
    let writer = SyncIoBridge::new(server_side);
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(writer);
        let result = builder
            .append_dir_all(".", &dir)
            .and_then(|()| builder.finish());
        if let Err(e) = result {
            tracing::warn!("index archive failed: {e}");
        }
    });
    Ok(Body::from_stream(ReaderStream::new(client_side)))
}
