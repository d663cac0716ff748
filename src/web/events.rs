use super::SharedState;
use crate::notify::ServerEvent;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::{Stream, StreamExt};

fn to_sse(event: &str, payload: &Value) -> Event {
    Event::default().event(event).data(payload.to_string())
}

/// 推送事件流
///
/// 连接建立后先发送当前的 updateStreamData，之后转发事件总线。
/// 落后太多被总线丢弃的事件直接跳过。
pub async fn events_handler(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // 先订阅再取快照，避免两者之间的事件丢失
    let rx = state.events.subscribe();
    let snapshot = serde_json::to_value(state.supervisor.stream_data()).unwrap_or(Value::Null);

    let initial = tokio_stream::once(Ok::<_, Infallible>(to_sse("updateStreamData", &snapshot)));
    let updates = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event: ServerEvent| Ok(to_sse(&event.event, &event.payload)));

    let heartbeat = IntervalStream::new(tokio::time::interval(Duration::from_secs(30)))
        .map(|_| Ok(Event::default().event("heartbeat").data("{}")));

    Sse::new(initial.chain(updates).merge(heartbeat)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
