//! Behavior when the configured git executable cannot be launched: pack
//! endpoints must answer with an error status instead of a truncated
//! success body.

use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use grange::config::{Config, ProjectConfig};
use grange::{AppState, GrangeServer};

async fn start_node_with_broken_git(tmp: &TempDir) -> (SocketAddr, AppState) {
    let mut config = Config::default();
    config.cluster.credential = "cluster-secret".to_string();
    config.storage.data_dir = tmp.path().display().to_string();
    config.cache.index_snapshot = None;
    config.auth.anonymous_read = true;
    config.git.command = "/nonexistent/grange-no-such-git".to_string();
    config.projects = vec![ProjectConfig { id: 1, parent: None, cache_preserve_days: 7 }];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.server.bind_address = addr.to_string();
    let server = GrangeServer::new(&config).unwrap();
    let state = server.state();
    tokio::spawn(server.serve(listener));
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, state)
}

#[tokio::test]
async fn test_advertisement_launch_failure_is_an_error_status() {
    let tmp = TempDir::new().unwrap();
    // A bare directory is enough; the executable fails before looking at it
    std::fs::create_dir_all(tmp.path().join("projects/1/git")).unwrap();
    let (addr, state) = start_node_with_broken_git(&tmp).await;
    state.directory.assign(1, addr.to_string());

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/1/info/refs?service=git-upload-pack"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn test_pack_launch_failure_is_an_error_status() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("projects/1/git")).unwrap();
    let (addr, state) = start_node_with_broken_git(&tmp).await;
    state.directory.assign(1, addr.to_string());

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/1/git-upload-pack"))
        .body(&b"0000"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn test_relayed_launch_failure_is_an_error_status() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("projects/1/git")).unwrap();
    let (addr, state) = start_node_with_broken_git(&tmp).await;
    state.directory.assign(1, addr.to_string());

    let response = reqwest::Client::new()
        .get(format!(
            "http://{addr}/~cluster/git-advertise-refs?projectId=1&upload=true"
        ))
        .bearer_auth("cluster-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}
