//! Artifact server.
//!
//! Hosts fetch the executor and key-value store binaries from the scheduler
//! when a member is launched. Both binaries must exist at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::ArtifactConfig;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("binary not found: {0}")]
    Missing(PathBuf),

    #[error("binary path has no file name: {0}")]
    InvalidName(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves member binaries over HTTP.
#[derive(Debug, Clone)]
pub struct ArtifactServer {
    address: String,
    port: u16,
    files: Arc<HashMap<String, PathBuf>>,
}

impl ArtifactServer {
    /// Check both binaries exist and index them by file name.
    pub fn new(config: &ArtifactConfig) -> Result<Self, ArtifactError> {
        let mut files = HashMap::new();
        for path in [&config.executor_bin, &config.store_bin] {
            let name = file_name(path)?;
            if !path.is_file() {
                return Err(ArtifactError::Missing(path.clone()));
            }
            files.insert(name, path.clone());
        }
        Ok(Self {
            address: config.address.clone(),
            port: config.port,
            files: Arc::new(files),
        })
    }

    /// URIs placed into every launch spec, sorted by file name.
    pub fn uris(&self) -> Vec<String> {
        let mut names: Vec<&String> = self.files.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| format!("http://{}:{}/{}", self.address, self.port, name))
            .collect()
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/{file}", get(serve_file))
            .layer(TraceLayer::new_for_http())
            .with_state(self.files.clone())
    }
}

fn file_name(path: &Path) -> Result<String, ArtifactError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ArtifactError::InvalidName(path.to_path_buf()))
}

async fn serve_file(
    State(files): State<Arc<HashMap<String, PathBuf>>>,
    UrlPath(file): UrlPath<String>,
) -> Response {
    let Some(path) = files.get(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(path).await {
        Ok(contents) => {
            debug!(file = %file, bytes = contents.len(), "Serving artifact");
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                Bytes::from(contents),
            )
                .into_response()
        }
        Err(e) => {
            warn!(file = %file, error = %e, "Failed to read artifact");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn config(dir: &Path) -> ArtifactConfig {
        ArtifactConfig {
            address: "10.0.0.5".to_string(),
            port: 12300,
            executor_bin: dir.join("seedkeeper-executor"),
            store_bin: dir.join("etcd"),
        }
    }

    #[test]
    fn test_missing_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seedkeeper-executor"), b"exec").unwrap();
        let err = ArtifactServer::new(&config(dir.path())).unwrap_err();
        assert!(matches!(err, ArtifactError::Missing(p) if p.ends_with("etcd")));
    }

    #[tokio::test]
    async fn test_serves_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seedkeeper-executor"), b"exec").unwrap();
        std::fs::write(dir.path().join("etcd"), b"store").unwrap();
        let server = ArtifactServer::new(&config(dir.path())).unwrap();

        assert_eq!(
            server.uris(),
            vec![
                "http://10.0.0.5:12300/etcd".to_string(),
                "http://10.0.0.5:12300/seedkeeper-executor".to_string(),
            ]
        );

        let response = server
            .router()
            .oneshot(Request::get("/etcd").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"store");

        let response = server
            .router()
            .oneshot(Request::get("/passwd").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
