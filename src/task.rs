use crate::engine::ProcessHandle;
use crate::state::StreamType;
use crate::timer::{GrowingTimer, Timer};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    connected: bool,
    n_frames: u64,
    /// 上一次停滞检查时的帧数，None 表示尚未取基准
    prev_n_frame: Option<u64>,
}

/// 停滞检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleCheck {
    NotConnected,
    /// 首次检查只记录基准帧数
    Baseline,
    Advanced,
    Stale,
}

/// 一条流的一次"尝试谱系"
///
/// 同一个源地址的重试复用同一个 task，用户换地址时整个 task 被替换。
pub struct StreamTask {
    pub stream_url: String,
    pub stream_type: StreamType,
    restart_wait: Duration,
    counters: Mutex<Counters>,
    pub probe_timer: GrowingTimer,
    pub retry_timer: Timer,
    process: Mutex<Option<Arc<ProcessHandle>>>,
}

impl StreamTask {
    pub fn new(
        stream_url: impl Into<String>,
        stream_type: StreamType,
        restart_wait: Duration,
        probe_backoff_increment: Duration,
    ) -> Self {
        Self {
            stream_url: stream_url.into(),
            stream_type,
            restart_wait,
            counters: Mutex::new(Counters::default()),
            probe_timer: GrowingTimer::new(restart_wait, probe_backoff_increment),
            retry_timer: Timer::new(),
            process: Mutex::new(None),
        }
    }

    pub fn restart_wait(&self) -> Duration {
        self.restart_wait
    }

    /// 回到基线: 清空计数器，probe 退避从头开始
    pub fn reset(&self) {
        *self.counters.lock().unwrap() = Counters::default();
        self.probe_timer.reset();
    }

    pub fn set_connected(&self) {
        self.counters.lock().unwrap().connected = true;
    }

    pub fn is_connected(&self) -> bool {
        self.counters.lock().unwrap().connected
    }

    /// 记录最新帧数，返回上一次的帧数
    pub fn record_frames(&self, frames: u64) -> u64 {
        let mut counters = self.counters.lock().unwrap();
        std::mem::replace(&mut counters.n_frames, frames)
    }

    pub fn frames(&self) -> u64 {
        self.counters.lock().unwrap().n_frames
    }

    /// 比较当前帧数与上次检查时的帧数
    pub fn check_stale(&self) -> StaleCheck {
        let mut counters = self.counters.lock().unwrap();
        if !counters.connected {
            return StaleCheck::NotConnected;
        }

        let current = counters.n_frames;
        match counters.prev_n_frame.replace(current) {
            None => StaleCheck::Baseline,
            Some(previous) if previous == current => StaleCheck::Stale,
            Some(_) => StaleCheck::Advanced,
        }
    }

    pub fn set_process(&self, process: Arc<ProcessHandle>) {
        *self.process.lock().unwrap() = Some(process);
    }

    pub fn take_process(&self) -> Option<Arc<ProcessHandle>> {
        self.process.lock().unwrap().take()
    }

    /// 仅当记录的句柄就是给定句柄时才清除
    pub fn clear_process(&self, process: &Arc<ProcessHandle>) {
        let mut current = self.process.lock().unwrap();
        if current.as_ref().is_some_and(|p| Arc::ptr_eq(p, process)) {
            *current = None;
        }
    }

    pub fn process(&self) -> Option<Arc<ProcessHandle>> {
        self.process.lock().unwrap().clone()
    }

    /// 取消所有计时器
    pub fn cancel_timers(&self) {
        self.probe_timer.cancel();
        self.retry_timer.cancel();
    }
}
