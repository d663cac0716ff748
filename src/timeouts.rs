use crate::state::StreamType;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Retry,
    Stale,
    Snapshot,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutKind::Retry => "retry",
            TimeoutKind::Stale => "stale",
            TimeoutKind::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// 按 (流, 类别) 登记的延时任务
///
/// 同一槽位再次登记会先中止旧任务，保证每个槽位最多一个待执行任务。
#[derive(Default)]
pub struct TimeoutRegistry {
    slots: Mutex<HashMap<(StreamType, TimeoutKind), JoinHandle<()>>>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 快照只属于 ingest 流
    pub fn accepts(stream: StreamType, kind: TimeoutKind) -> bool {
        !(kind == TimeoutKind::Snapshot && stream != StreamType::Ingest)
    }

    /// 登记并立即开始执行 `fut`，返回是否登记成功
    pub fn set<F>(&self, stream: StreamType, kind: TimeoutKind, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !Self::accepts(stream, kind) {
            error!("Rejected unknown timeout [{}] for stream [{}]", kind, stream);
            return false;
        }

        let mut slots = self.slots.lock().unwrap();
        if let Some(previous) = slots.remove(&(stream, kind)) {
            debug!("Replacing pending timeout [{}] for [{}]", kind, stream);
            previous.abort();
        }
        slots.insert((stream, kind), tokio::spawn(fut));
        true
    }

    pub fn clear(&self, stream: StreamType, kind: TimeoutKind) -> bool {
        if !Self::accepts(stream, kind) {
            error!("Rejected unknown timeout [{}] for stream [{}]", kind, stream);
            return false;
        }

        match self.slots.lock().unwrap().remove(&(stream, kind)) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self, stream: StreamType, kind: TimeoutKind) -> bool {
        self.slots
            .lock()
            .unwrap()
            .get(&(stream, kind))
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn clear_all(&self) {
        for (_, handle) in self.slots.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
