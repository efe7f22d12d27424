//! Static asset handler for the workbench and webview endpoints.
//!
//! A deliberately small file server: resolve the request path under the
//! configured web root, refuse traversal, map extension to content type,
//! and answer 404 on anything unreadable.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// A fully prepared HTTP response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StaticResponse {
    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: b"Not found".to_vec(),
        }
    }
}

/// Serve `request_path` from `root`. `None` root means no UI assets are
/// installed and everything 404s.
pub async fn serve(root: Option<&Path>, request_path: &str) -> StaticResponse {
    let Some(root) = root else {
        return StaticResponse::not_found();
    };

    let Some(relative) = sanitize(request_path) else {
        warn!(path = request_path, "refusing asset path");
        return StaticResponse::not_found();
    };

    let file = root.join(&relative);
    match tokio::fs::read(&file).await {
        Ok(body) => {
            debug!(path = %file.display(), len = body.len(), "served asset");
            StaticResponse {
                status: 200,
                content_type: content_type_for(&file),
                body,
            }
        }
        Err(e) => {
            warn!(path = %file.display(), error = %e, "asset read failed");
            StaticResponse::not_found()
        }
    }
}

/// Whether the web root contains a built UI entry point.
pub fn has_built_ui(root: Option<&Path>) -> bool {
    root.map(|r| r.join("index.html").is_file()).unwrap_or(false)
}

/// Map a request path to a safe relative path, or refuse it.
fn sanitize(request_path: &str) -> Option<PathBuf> {
    let path = request_path.trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\'))
    {
        return None;
    }
    Some(PathBuf::from(path))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("js") | Some("mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff") | Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        Some("map") => "application/json",
        _ => "application/octet-stream",
    }
}
