use crate::config::Environment;
use crate::state::{AudioOptions, PlayerOptions, StateKind, StreamData, StreamState, UserAction};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode state: {0}")]
    Json(#[from] serde_json::Error),
}

/// HLS 超时大于该值时 ffmpeg 会拒绝启动
const MAX_HLS_TIMEOUT: u64 = 2147;

/// 持久化状态文件 (v1.json)
///
/// 所有写入都是同步的，先写临时文件再 rename，
/// 保证进程崩溃时磁盘上总有一份完整的数据。
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取并规范化状态文件
    ///
    /// # 副作用
    /// - 文件缺失或无法解析时写入默认结构
    /// - 规范化后的结果总是立即回写
    pub fn load(&self, env: &Environment) -> Result<StreamData, StoreError> {
        let data = match self.read_existing(env) {
            Some(data) => data,
            None => {
                info!("Creating default state file at {:?}", self.path);
                bootstrap(env)
            }
        };

        self.write(&data)?;
        Ok(data)
    }

    fn read_existing(&self, env: &Environment) -> Option<StreamData> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {:?}: {}", self.path, e);
                return None;
            }
        };

        // 1. 先按通用 JSON 读取，用于识别缺失的字段
        let raw: serde_json::Value = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("State file {:?} is not valid JSON: {}", self.path, e);
                return None;
            }
        };
        let missing_audio = raw
            .get("options")
            .map(|options| options.get("audio").is_none())
            .unwrap_or(false);

        // 2. 类型化校验
        let mut data: StreamData = match serde_json::from_value(raw) {
            Ok(data) => data,
            Err(e) => {
                warn!("State file {:?} failed validation: {}", self.path, e);
                return None;
            }
        };

        // 3. 旧版本文件补齐音频设置
        if missing_audio {
            let mut audio = AudioOptions::default();
            audio.apply_preset(env.audio.as_deref());
            data.options.audio = audio;
        }

        // 4. 修正超出范围的 HLS 超时
        let hls = &mut data.options.output.hls;
        if hls
            .timeout
            .trim()
            .parse::<u64>()
            .map(|timeout| timeout > MAX_HLS_TIMEOUT)
            .unwrap_or(false)
        {
            hls.timeout = "10".to_string();
        }

        Some(data)
    }

    /// 原子写入完整状态
    pub fn write(&self, data: &StreamData) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(data)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// 首次启动时的默认结构，按环境变量预置音频和自动拉流地址
pub fn bootstrap(env: &Environment) -> StreamData {
    let mut data = StreamData::default();
    data.options.audio.apply_preset(env.audio.as_deref());

    if let Some(input) = &env.input_stream {
        data.addresses.src_address = input.clone();
        data.states.ingest = StreamState::new(StateKind::Connected);
        data.user_actions.ingest = UserAction::Start;

        if let Some(output) = &env.output_stream {
            data.addresses.optional_output_address = output.clone();
            data.states.repeat = StreamState::new(StateKind::Connected);
            data.user_actions.repeat = UserAction::Start;
        }
    }

    data
}

/// 生成前端使用的播放器配置 `var playerConfig = {...}`
pub fn write_player_config(path: &Path, player: &PlayerOptions) -> Result<(), StoreError> {
    let json = serde_json::to_string(player)?;
    write_atomic(path, format!("var playerConfig = {}", json).as_bytes())
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
