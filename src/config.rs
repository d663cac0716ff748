use crate::template::OptionTemplate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub nginx: NginxConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_ffprobe_binary")]
    pub ffprobe_binary: String,

    /// 本地 HLS 输出目录 (ingest 流写入 live.stream.m3u8)
    /// 建议配置为 /dev/shm 下的目录以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    /// 持久化状态文件 (v1 结构)
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// 前端静态目录: 快照图片与播放器配置都写在这里
    #[serde(default = "default_public_root")]
    pub public_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ffmpeg_binary: default_ffmpeg_binary(),
            ffprobe_binary: default_ffprobe_binary(),
            hls_root: default_hls_root(),
            db_path: default_db_path(),
            public_root: default_public_root(),
        }
    }
}

impl ServerConfig {
    /// ingest 流写入的本地 HLS 播放列表
    pub fn local_playlist(&self) -> PathBuf {
        Path::new(&self.hls_root).join("live.stream.m3u8")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.public_root.join("images").join("live.jpg")
    }

    pub fn player_config_path(&self) -> PathBuf {
        self.public_root.join("config.js")
    }
}

/// 进程监控策略
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// 进程退出后的固定重连间隔，同时也是 probe 退避的初始值 (毫秒)
    #[serde(default = "default_restart_wait_ms")]
    pub restart_wait_ms: u64,
    /// probe 连续失败时每次增加的等待时间 (毫秒)
    #[serde(default = "default_probe_backoff_increment_ms")]
    pub probe_backoff_increment_ms: u64,
    /// 帧数停滞检测周期 (毫秒)
    #[serde(default = "default_stale_wait_ms")]
    pub stale_wait_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            restart_wait_ms: default_restart_wait_ms(),
            probe_backoff_increment_ms: default_probe_backoff_increment_ms(),
            stale_wait_ms: default_stale_wait_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn restart_wait(&self) -> Duration {
        Duration::from_millis(self.restart_wait_ms)
    }

    pub fn probe_backoff_increment(&self) -> Duration {
        Duration::from_millis(self.probe_backoff_increment_ms)
    }

    pub fn stale_wait(&self) -> Duration {
        Duration::from_millis(self.stale_wait_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// RTSP over TCP 时附加的 socket 超时参数，例如 "-timeout"
    #[serde(default)]
    pub socket_timeout_key: Option<String>,
    #[serde(default)]
    pub socket_timeout: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            socket_timeout_key: None,
            socket_timeout: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// 为 false 时假定 nginx 由外部管理，只使用 streaming 地址
    #[serde(default = "default_true")]
    pub managed: bool,
    #[serde(default = "default_nginx_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub args_ssl: Vec<String>,
    #[serde(default)]
    pub streaming: StreamingEndpoint,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            managed: true,
            command: default_nginx_command(),
            args: Vec::new(),
            args_ssl: Vec::new(),
            streaming: StreamingEndpoint::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingEndpoint {
    #[serde(default = "default_streaming_ip")]
    pub ip: String,
    #[serde(default = "default_rtmp_port")]
    pub rtmp_port: u16,
    #[serde(default = "default_rtmp_hls_path")]
    pub rtmp_hls_path: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_http_health_path")]
    pub http_health_path: String,
}

impl Default for StreamingEndpoint {
    fn default() -> Self {
        Self {
            ip: default_streaming_ip(),
            rtmp_port: default_rtmp_port(),
            rtmp_hls_path: default_rtmp_hls_path(),
            http_port: default_http_port(),
            http_health_path: default_http_health_path(),
        }
    }
}

impl StreamingEndpoint {
    pub fn health_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.ip, self.http_port, self.http_health_path
        )
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FfmpegConfig {
    /// 命名的参数模板，由 probe 结果和用户选项决定取用哪些
    #[serde(default)]
    pub options: BTreeMap<String, OptionTemplate>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_binary() -> String {
    "ffprobe".to_string()
}

fn default_hls_root() -> String {
    "/tmp/hls".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("db/v1.json")
}

fn default_public_root() -> PathBuf {
    PathBuf::from("public")
}

fn default_restart_wait_ms() -> u64 {
    6000
}

fn default_probe_backoff_increment_ms() -> u64 {
    1000
}

fn default_stale_wait_ms() -> u64 {
    60000
}

fn default_probe_timeout_ms() -> u64 {
    10000
}

fn default_true() -> bool {
    true
}

fn default_nginx_command() -> String {
    "nginx".to_string()
}

fn default_streaming_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_rtmp_port() -> u16 {
    1935
}

fn default_rtmp_hls_path() -> String {
    "/hls".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_http_health_path() -> String {
    "/ping".to_string()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // 空文件视为全部使用默认值
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

/// 启动时读取的环境变量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    /// RS_AUDIO: 首次启动时的音频预设
    pub audio: Option<String>,
    /// RS_INPUTSTREAM: 首次启动时自动拉取的源地址
    pub input_stream: Option<String>,
    /// RS_OUTPUTSTREAM: 首次启动时自动转推的目标地址
    pub output_stream: Option<String>,
    /// RS_SNAPSHOT_INTERVAL: 快照间隔表达式
    pub snapshot_interval: Option<String>,
    /// RS_TOKEN: 覆盖 auth.token
    pub token: Option<String>,
    /// RS_HTTPS: nginx 使用 args_ssl 启动
    pub https: bool,
    /// RS_DEBUG: 打开调试日志
    pub debug: bool,
}

impl Environment {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 通过查找函数构造，便于测试时不修改进程环境
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let flag = |name: &str| {
            matches!(
                lookup(name).map(|v| v.to_lowercase()).as_deref(),
                Some("true") | Some("1") | Some("yes")
            )
        };

        Self {
            audio: non_empty("RS_AUDIO"),
            input_stream: non_empty("RS_INPUTSTREAM"),
            output_stream: non_empty("RS_OUTPUTSTREAM"),
            snapshot_interval: lookup("RS_SNAPSHOT_INTERVAL"),
            token: lookup("RS_TOKEN"),
            https: flag("RS_HTTPS"),
            debug: flag("RS_DEBUG"),
        }
    }

    /// RS_TOKEN 优先于配置文件中的 token
    pub fn effective_token<'a>(&'a self, config: &'a AppConfig) -> &'a str {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => config.auth.token.as_str(),
        }
    }
}
