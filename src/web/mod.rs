pub mod admin;
pub mod events;
pub mod hls;

use crate::config::AppConfig;
use crate::notify::EventBus;
use crate::supervisor::{Command, Supervisor};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// web 层共享状态: 只读访问 supervisor，指令通过通道送入
pub struct AppState {
    pub config: AppConfig,
    pub supervisor: Arc<Supervisor>,
    pub events: Arc<EventBus>,
    pub commands: mpsc::Sender<Command>,
}

pub type SharedState = Arc<AppState>;

/// 注册 HTTP 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/version", get(admin::version)) // 版本信息
        .route("/v1/states", get(admin::states)) // 流状态
        .route("/v1/progresses", get(admin::progresses)) // 进度
        .route("/v1/process", get(admin::sys_status)) // 系统状态
        .route("/v1/command", post(admin::post_command)) // 前端指令
        .route("/v1/events", get(events::events_handler)) // SSE 推送
        .route("/hls/:file_name", get(hls::serve_hls_file)) // 本地 HLS 输出
        .route("/images/live.jpg", get(hls::serve_snapshot)) // 最新快照
        .with_state(state)
}
