use crate::config::NginxConfig;
use crate::engine::StderrLines;
use anyhow::{bail, Context};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 健康检查间隔
const PING_INTERVAL: Duration = Duration::from_millis(256);
/// 退出后重启前的等待
const RESTART_DELAY: Duration = Duration::from_millis(4 * 256);

/// 本地 nginx-rtmp 进程
///
/// 首次启动成功之后才允许自动重启。
pub struct Nginx {
    config: NginxConfig,
    use_ssl: bool,
    client: reqwest::Client,
}

impl Nginx {
    pub fn new(config: NginxConfig, use_ssl: bool) -> Arc<Self> {
        Arc::new(Self {
            config,
            use_ssl,
            client: reqwest::Client::new(),
        })
    }

    fn args(&self) -> &[String] {
        if self.use_ssl {
            &self.config.args_ssl
        } else {
            &self.config.args
        }
    }

    /// 启动 nginx 并等待健康检查通过，随后在后台守护进程
    ///
    /// # 错误处理
    /// 进程无法启动或在健康检查通过前退出时返回错误
    pub async fn start(self: Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let child = self.launch().await?;
        Ok(tokio::spawn(self.supervise(child)))
    }

    async fn launch(&self) -> anyhow::Result<Child> {
        info!("Starting nginx ...");
        if self.use_ssl {
            info!("Enabling HTTPS");
        }

        let mut child = Command::new(&self.config.command)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.command))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        let url = self.config.streaming.health_url();
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.context("failed to wait for nginx")?;
                    error!("Exited with code: {:?}", status.code());
                    bail!("Failed to start nginx");
                }
                _ = tokio::time::sleep(PING_INTERVAL) => {
                    let running = self.is_running(&url).await;
                    if running {
                        break;
                    }
                    info!("isRunning: {}", running);
                }
            }
        }

        info!("Successfully started nginx");
        Ok(child)
    }

    async fn is_running(&self, url: &str) -> bool {
        match self.client.get(url).timeout(Duration::from_secs(1)).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// 正常退出码时重启，被信号终止时不再重启
    async fn supervise(self: Arc<Self>, mut child: Child) {
        loop {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    error!("Failed to wait for nginx: {}", e);
                    return;
                }
            };
            error!("Exited with code: {:?}", status.code());
            if !should_restart(&status) {
                return;
            }

            // 重启失败时同样按退出码决定是否继续
            loop {
                tokio::time::sleep(RESTART_DELAY).await;
                info!("Trying to restart nginx ...");
                match self.launch().await {
                    Ok(next) => {
                        child = next;
                        break;
                    }
                    Err(e) => {
                        error!("{:#}", e);
                        if e.downcast_ref::<std::io::Error>().is_some() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn should_restart(status: &ExitStatus) -> bool {
    status.code().is_some_and(|code| code >= 0)
}

/// 去掉 nginx 日志行的 `[...]` 前缀
fn clean_line(line: &str) -> Option<&str> {
    let rest = match line.rfind(']') {
        Some(pos) => &line[pos + 1..],
        None => line,
    };
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = StderrLines::new(reader);
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(line) = clean_line(&line) else {
            continue;
        };
        if is_stderr {
            error!("nginx: {}", line);
        } else {
            info!("nginx: {}", line);
        }
    }
}
