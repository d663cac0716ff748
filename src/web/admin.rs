use super::SharedState;
use crate::state::{redact_token, Progress, StreamState, StreamType};
use crate::supervisor::Command;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::error;

/// 版本信息 API
pub async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "update": "n/a",
    }))
}

fn state_json(state: &StreamState) -> Value {
    json!({
        "type": state.kind,
        "message": redact_token(&state.message),
    })
}

/// 两路流的状态，消息中的 token 被隐藏
pub async fn states(State(state): State<SharedState>) -> Json<Value> {
    let data = state.supervisor.stream_data();
    Json(json!({
        "repeat_to_local_nginx": state_json(data.states.get(StreamType::Ingest)),
        "repeat_to_optional_output": state_json(data.states.get(StreamType::Repeat)),
    }))
}

fn progress_json(progress: &Progress) -> Value {
    json!({
        "frames": progress.frames,
        "current_fps": progress.current_fps,
        "current_kbps": progress.current_kbps,
    })
}

pub async fn progresses(State(state): State<SharedState>) -> Json<Value> {
    let progresses = state.supervisor.progresses();
    Json(json!({
        "repeat_to_local_nginx": progress_json(progresses.get(StreamType::Ingest)),
        "repeat_to_optional_output": progress_json(progresses.get(StreamType::Repeat)),
    }))
}

/// 获取系统状态 API
/// 返回系统的内存和负载信息
pub async fn sys_status() -> Json<Value> {
    // 获取失败时按 0 处理
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // MB
        "mem_avail": mem.1 / 1024, // MB
        "load_avg": load,
    }))
}

/// 接收前端指令并交给 supervisor 串行处理
///
/// 请求体格式错误时由 `Json` 提取器直接拒绝
pub async fn post_command(
    State(state): State<SharedState>,
    Json(command): Json<Command>,
) -> StatusCode {
    match state.commands.send(command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            error!("Command loop is gone: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateKind;
    use crate::web::testing::app_state;

    #[tokio::test]
    async fn test_states_redact_token() {
        let (state, _dir, _rx) = app_state();
        state
            .supervisor
            .update_state(StreamType::Repeat, StateKind::Error, "rtmp://out/live?token=abc failed");

        let Json(body) = states(State(state)).await;
        assert_eq!(body["repeat_to_optional_output"]["type"], "error");
        assert_eq!(
            body["repeat_to_optional_output"]["message"],
            "rtmp://out/live?token=*** failed"
        );
        assert_eq!(body["repeat_to_local_nginx"]["type"], "stopped");
    }

    #[tokio::test]
    async fn test_progresses_shape() {
        let (state, _dir, _rx) = app_state();
        let Json(body) = progresses(State(state)).await;
        assert_eq!(body["repeat_to_local_nginx"]["frames"], 0);
        assert!(body["repeat_to_optional_output"].get("current_kbps").is_some());
    }

    #[tokio::test]
    async fn test_post_command_forwards_to_loop() {
        let (state, _dir, mut rx) = app_state();
        let status = post_command(State(state.clone()), Json(Command::CheckStates)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(matches!(rx.recv().await, Some(Command::CheckStates)));

        drop(rx);
        let status = post_command(State(state), Json(Command::CheckStates)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_version() {
        let Json(body) = version().await;
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
