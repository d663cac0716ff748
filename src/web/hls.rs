use super::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::{Path as FsPath, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// 只允许根目录下的普通文件名
fn resolve_file(root: &FsPath, file_name: &str) -> Option<PathBuf> {
    let valid = !file_name.is_empty()
        && file_name != "."
        && file_name != ".."
        && !file_name.contains(['/', '\\']);
    valid.then(|| root.join(file_name))
}

/// 提供本地 HLS 输出 (播放列表与分片)
pub async fn serve_hls_file(
    State(state): State<SharedState>,
    Path(file_name): Path<String>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let root = FsPath::new(&state.config.server.hls_root);
    let file_path = resolve_file(root, &file_name)
        .ok_or((StatusCode::BAD_REQUEST, "Invalid file name".to_string()))?;
    stream_file(&file_path).await
}

/// 提供最新的快照图片
pub async fn serve_snapshot(
    State(state): State<SharedState>,
) -> Result<Response<Body>, (StatusCode, String)> {
    stream_file(&state.config.server.snapshot_path()).await
}

async fn stream_file(file_path: &FsPath) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. 打开文件
    let file = File::open(file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 2. 根据扩展名确定 Content-Type
    let content_type = mime_guess::from_path(file_path)
        .first_or_octet_stream()
        .to_string();

    // 3. 以流的方式返回文件内容
    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
