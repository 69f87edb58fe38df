//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use mediagrab::Result;
use mediagrab::github::{Commit, Release, ReleaseAsset, ReleaseSource};

/// Serves `body` with a 200 and content-length to every connection.
pub async fn serve_bytes(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });

    format!("http://{addr}/download")
}

pub struct FakeReleases {
    pub releases: Vec<Release>,
}

impl ReleaseSource for FakeReleases {
    fn releases(
        &self,
        _owner: &str,
        _repo: &str,
    ) -> impl Future<Output = Result<Vec<Release>>> + Send {
        async move { Ok(self.releases.clone()) }
    }

    fn latest_release(
        &self,
        _owner: &str,
        _repo: &str,
    ) -> impl Future<Output = Result<Option<Release>>> + Send {
        async move { Ok(self.releases.first().cloned()) }
    }

    fn commits_since(
        &self,
        _owner: &str,
        _repo: &str,
        _sha: &str,
    ) -> impl Future<Output = Result<Vec<Commit>>> + Send {
        async move { Ok(Vec::new()) }
    }
}

pub fn release(tag: &str, assets: Vec<ReleaseAsset>) -> Release {
    Release {
        tag_name: tag.to_string(),
        prerelease: false,
        assets,
    }
}

pub fn asset(name: &str, url: &str, size: u64, digest: Option<String>) -> ReleaseAsset {
    ReleaseAsset {
        name: name.to_string(),
        browser_download_url: url.to_string(),
        size,
        digest,
    }
}

/// Writes an executable shell script standing in for the media tool.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
    path
}
