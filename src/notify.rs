use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// 推送给前端的事件出口
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);

    /// 没有观察者时可以跳过高频事件
    fn has_observers(&self) -> bool {
        true
    }
}

pub fn emit_event<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    if let Ok(value) = serde_json::to_value(payload) {
        sink.emit(event, value);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent {
    pub event: String,
    pub payload: Value,
}

/// 基于 broadcast 的事件总线，web 层订阅后以 SSE 转发
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, payload: Value) {
        // 没有订阅者时 send 返回 Err，直接丢弃
        let _ = self.tx.send(ServerEvent {
            event: event.to_string(),
            payload,
        });
    }

    fn has_observers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// 丢弃所有事件
    pub struct NoopEventSink;

    impl EventSink for NoopEventSink {
        fn emit(&self, _event: &str, _payload: Value) {}

        fn has_observers(&self) -> bool {
            false
        }
    }

    /// 记录所有事件，供测试断言
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<ServerEvent>>,
        pub observers: bool,
    }

    impl RecordingSink {
        pub fn with_observers() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                observers: true,
            }
        }

        pub fn count(&self, event: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.event == event)
                .count()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &str, payload: Value) {
            self.events.lock().unwrap().push(ServerEvent {
                event: event.to_string(),
                payload,
            });
        }

        fn has_observers(&self) -> bool {
            self.observers
        }
    }
}
