use crate::config::AppConfig;
use crate::engine::{ProcessError, ProcessEvent, ProcessHandle, ProcessSpec};
use crate::notify::EventSink;
use crate::template::CommandBuilder;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const MINIMAL_INTERVAL: Duration = Duration::from_secs(10);

/// 解析快照间隔表达式
///
/// 纯数字为毫秒，可带 `ms`/`s`/`m` 后缀。`0` 表示关闭快照，
/// 其他小于 10 秒的值按 10 秒处理，无法解析时使用默认的 60 秒。
pub fn snapshot_interval(expr: Option<&str>) -> Duration {
    let interval = match expr.and_then(parse_interval) {
        Some(interval) => interval,
        None => {
            if expr.is_some() {
                warn!("Invalid value for snapshot interval. Using default.");
            }
            DEFAULT_INTERVAL
        }
    };

    if interval.is_zero() {
        Duration::ZERO
    } else {
        interval.max(MINIMAL_INTERVAL)
    }
}

fn parse_interval(expr: &str) -> Option<Duration> {
    let digits_end = expr
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(expr.len());
    if digits_end == 0 {
        return None;
    }

    let value: u64 = expr[..digits_end].parse().ok()?;
    match &expr[digits_end..] {
        "" | "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        _ => None,
    }
}

/// 下一轮的等待时间，扣除本轮已经消耗的时间
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// 从本地 HLS 播放列表中截取一帧作为预览图
pub struct SnapshotFetcher {
    spec: ProcessSpec,
    output: PathBuf,
    interval: Duration,
}

impl SnapshotFetcher {
    pub fn new(config: &AppConfig, interval: Duration) -> Self {
        let output = config.server.snapshot_path();
        let spec = CommandBuilder::new(
            &config.ffmpeg.options,
            config.server.ffmpeg_binary.clone(),
            config.server.local_playlist().to_string_lossy(),
        )
        .add("global", &[])
        .add("snapshot", &[])
        .output(output.to_string_lossy())
        .build();

        Self {
            spec,
            output,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// 运行一次截图进程并等待其结束
    pub async fn fetch_once(&self) -> Result<(), ProcessError> {
        if let Some(parent) = self.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (_handle, mut events) = ProcessHandle::spawn("snapshot", self.spec.clone());
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Started(command_line) => debug!("Spawned: {}", command_line),
                ProcessEvent::Stderr(_) => {}
                ProcessEvent::Ended => return Ok(()),
                ProcessEvent::Failed(e) => return Err(e),
            }
        }

        Err(ProcessError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "snapshot process vanished without exit status",
        )))
    }

    /// 只要 `is_connected` 为真就按间隔截图
    ///
    /// 失败与成功使用相同的节奏重新安排，避免在源流异常时频繁启动进程。
    pub async fn run<F>(self: Arc<Self>, is_connected: F, events: Arc<dyn EventSink>)
    where
        F: Fn() -> bool + Send + Sync,
    {
        if !self.is_enabled() {
            info!("Snapshots disabled");
            return;
        }

        loop {
            if !is_connected() {
                debug!("Snapshots paused, because stream is not connected");
                return;
            }

            let started = Instant::now();
            match self.fetch_once().await {
                Ok(()) => {
                    info!(
                        "Snapshot updated. Next scheduled update in {:?}",
                        self.interval
                    );
                    events.emit("snapshot", serde_json::Value::Null);
                }
                Err(e) => error!("Snapshot failed: {}", e),
            }

            tokio::time::sleep(next_delay(self.interval, started.elapsed())).await;
        }
    }
}
