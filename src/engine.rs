use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// 子进程退出后继续读取 stderr 的最长时间
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// 一次进程调用的完整描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("exited with code {code}: {detail}")]
    Exited { code: i32, detail: String },
    #[error("killed with signal {}", .signal.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    Signaled { signal: Option<i32> },
    #[error("process io error: {0}")]
    Io(#[from] io::Error),
}

/// 进程事件，`Ended` 与 `Failed` 每次运行恰好出现一个且位于最后
#[derive(Debug)]
pub enum ProcessEvent {
    /// 携带实际执行的命令行
    Started(String),
    Stderr(String),
    Ended,
    Failed(ProcessError),
}

/// 外部转码进程句柄
///
/// 每个句柄只对应一次运行。终止事件发出后事件通道随即关闭，
/// 需要重试时必须重新 `spawn`。
pub struct ProcessHandle {
    name: String,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// 启动子进程并返回句柄与事件流
    ///
    /// # 副作用
    /// - 启动后台驱动任务，负责读取 stderr 并等待进程退出
    ///
    /// # 错误处理
    /// - 启动失败不会返回 Err，而是以 `ProcessEvent::Failed` 的形式发出
    pub fn spawn(
        name: impl Into<String>,
        spec: ProcessSpec,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessEvent>) {
        let name = name.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(drive(name.clone(), spec, events_tx, kill_rx, exited_tx));

        let handle = Arc::new(Self {
            name,
            kill_tx: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
        });
        (handle, events_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 请求强制结束进程 (SIGKILL)，进程已退出或已请求过时返回 false
    pub fn kill(&self) -> bool {
        if *self.exited.borrow() {
            return false;
        }
        match self.kill_tx.lock().unwrap().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// 结束进程并等待其完全退出
    pub async fn terminate(&self) {
        self.kill();
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    pub fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }
}

async fn drive(
    name: String,
    spec: ProcessSpec,
    events: mpsc::UnboundedSender<ProcessEvent>,
    mut kill_rx: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
) {
    let terminal = run_child(&name, &spec, &events, &mut kill_rx).await;
    let _ = events.send(terminal);
    let _ = exited.send(true);
}

async fn run_child(
    name: &str,
    spec: &ProcessSpec,
    events: &mpsc::UnboundedSender<ProcessEvent>,
    kill_rx: &mut oneshot::Receiver<()>,
) -> ProcessEvent {
    // 1. 启动子进程
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            return ProcessEvent::Failed(ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            })
        }
    };
    debug!("Process [{}] spawned with pid {:?}", name, child.id());
    let _ = events.send(ProcessEvent::Started(spec.command_line()));

    // 2. 转发 stderr，直到进程退出
    let mut lines = child.stderr.take().map(StderrLines::new);
    let mut last_line = String::new();
    let mut kill_requested = false;

    let status = loop {
        tokio::select! {
            line = next_line(&mut lines) => match line {
                Some(line) => {
                    last_line.clone_from(&line);
                    let _ = events.send(ProcessEvent::Stderr(line));
                }
                None => lines = None,
            },
            // 句柄被丢弃同样视为结束请求
            _ = &mut *kill_rx, if !kill_requested => {
                kill_requested = true;
                info!("Killing process [{}]", name);
                let _ = child.start_kill();
            }
            status = child.wait() => break status,
        }
    };

    // 3. 读完剩余输出
    let drain = async {
        while let Some(line) = next_line(&mut lines).await {
            last_line.clone_from(&line);
            let _ = events.send(ProcessEvent::Stderr(line));
        }
    };
    let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, drain).await;

    match status {
        Ok(status) => exit_event(status, last_line),
        Err(e) => ProcessEvent::Failed(ProcessError::Io(e)),
    }
}

fn exit_event(status: ExitStatus, last_line: String) -> ProcessEvent {
    if status.success() {
        return ProcessEvent::Ended;
    }
    match status.code() {
        Some(code) => ProcessEvent::Failed(ProcessError::Exited {
            code,
            detail: last_line,
        }),
        None => ProcessEvent::Failed(ProcessError::Signaled {
            signal: exit_signal(&status),
        }),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

async fn next_line<R: AsyncRead + Unpin>(lines: &mut Option<StderrLines<R>>) -> Option<String> {
    match lines {
        Some(reader) => reader.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// 按 `\r` 或 `\n` 切分诊断输出，忽略空行
///
/// ffmpeg 的进度行以 `\r` 结尾，不能按普通行读取。
pub struct StderrLines<R> {
    reader: R,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl<R: AsyncRead + Unpin> StderrLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(None);
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.done = true;
                self.flush();
                continue;
            }

            for &byte in &chunk[..n] {
                if byte == b'\r' || byte == b'\n' {
                    self.flush();
                } else {
                    self.buf.push(byte);
                }
            }
        }
    }

    fn flush(&mut self) {
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if !line.is_empty() {
            self.pending.push_back(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut events: mpsc::UnboundedReceiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut all = Vec::new();
        while let Some(event) = events.recv().await {
            all.push(event);
        }
        all
    }

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn test_stderr_lines_split_on_cr_and_lf() {
        let input: &[u8] = b"first\r\n\rframe=  10 fps=0.0\rframe=  20 fps=9.5\n  \nlast";
        let mut lines = StderrLines::new(input);

        let mut all = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            all.push(line);
        }
        assert_eq!(
            all,
            vec!["first", "frame=  10 fps=0.0", "frame=  20 fps=9.5", "last"]
        );
    }

    #[test]
    fn test_command_line() {
        let spec = ProcessSpec {
            program: "ffmpeg".to_string(),
            args: vec!["-i".to_string(), "rtmp://src".to_string()],
        };
        assert_eq!(spec.command_line(), "ffmpeg -i rtmp://src");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_emits_lines_then_end() {
        let (handle, events) =
            ProcessHandle::spawn("test", sh("echo one >&2; printf 'frame=1\\rframe=2\\n' >&2"));
        let events = collect(events).await;

        assert!(matches!(&events[0], ProcessEvent::Started(line) if line.starts_with("sh -c")));
        let lines: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                ProcessEvent::Stderr(line) => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["one", "frame=1", "frame=2"]);
        assert!(matches!(events.last(), Some(ProcessEvent::Ended)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ProcessEvent::Ended | ProcessEvent::Failed(_)))
                .count(),
            1
        );

        assert!(!handle.is_running());
        assert!(!handle.kill());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_carries_last_line() {
        let (_handle, events) = ProcessHandle::spawn("test", sh("echo 'Connection refused' >&2; exit 3"));
        let events = collect(events).await;

        match events.last() {
            Some(ProcessEvent::Failed(ProcessError::Exited { code, detail })) => {
                assert_eq!(*code, 3);
                assert_eq!(detail, "Connection refused");
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_event() {
        let spec = ProcessSpec {
            program: "/nonexistent/ffmpeg-binary".to_string(),
            args: Vec::new(),
        };
        let (handle, events) = ProcessHandle::spawn("test", spec);
        let events = collect(events).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProcessEvent::Failed(ProcessError::Spawn { .. })
        ));
        handle.terminate().await;
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (handle, mut events) = ProcessHandle::spawn("test", sh("exec sleep 30"));
        assert!(matches!(events.recv().await, Some(ProcessEvent::Started(_))));

        assert!(handle.kill());
        assert!(!handle.kill());

        let rest = collect(events).await;
        assert!(matches!(
            rest.last(),
            Some(ProcessEvent::Failed(ProcessError::Signaled { .. }))
        ));
        handle.terminate().await;
        assert!(!handle.is_running());
    }
}
