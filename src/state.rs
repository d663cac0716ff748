use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 两路逻辑流: 拉流到本地 nginx / 转推到可选输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    #[serde(rename = "repeatToLocalNginx")]
    Ingest,
    #[serde(rename = "repeatToOptionalOutput")]
    Repeat,
}

impl StreamType {
    pub const ALL: [StreamType; 2] = [StreamType::Ingest, StreamType::Repeat];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Ingest => "repeatToLocalNginx",
            StreamType::Repeat => "repeatToOptionalOutput",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stream type: {0}")]
pub struct UnknownStreamType(pub String);

impl FromStr for StreamType {
    type Err = UnknownStreamType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repeatToLocalNginx" => Ok(StreamType::Ingest),
            "repeatToOptionalOutput" => Ok(StreamType::Repeat),
            other => Err(UnknownStreamType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Disconnected,
    Stopped,
    Connecting,
    Connected,
    Error,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Disconnected => "disconnected",
            StateKind::Stopped => "stopped",
            StateKind::Connecting => "connecting",
            StateKind::Connected => "connected",
            StateKind::Error => "error",
        }
    }

    /// connecting/connected 时不允许再次非强制启动
    pub fn is_active(&self) -> bool {
        matches!(self, StateKind::Connecting | StateKind::Connected)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(rename = "type")]
    pub kind: StateKind,
    #[serde(default)]
    pub message: String,
}

impl StreamState {
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAction {
    Start,
    Stop,
}

/// 每路流各一份，保证任何时刻两路都有值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerStream<T> {
    #[serde(rename = "repeatToLocalNginx")]
    pub ingest: T,
    #[serde(rename = "repeatToOptionalOutput")]
    pub repeat: T,
}

impl<T> PerStream<T> {
    pub fn new(ingest: T, repeat: T) -> Self {
        Self { ingest, repeat }
    }

    pub fn get(&self, stream: StreamType) -> &T {
        match stream {
            StreamType::Ingest => &self.ingest,
            StreamType::Repeat => &self.repeat,
        }
    }

    pub fn get_mut(&mut self, stream: StreamType) -> &mut T {
        match stream {
            StreamType::Ingest => &mut self.ingest,
            StreamType::Repeat => &mut self.repeat,
        }
    }
}

impl<T: Default> Default for PerStream<T> {
    fn default() -> Self {
        Self::new(T::default(), T::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub frames: u64,
    pub current_fps: f64,
    pub current_kbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOptions {
    #[serde(default = "default_true")]
    pub rtsp_tcp: bool,
    #[serde(default)]
    pub video: VideoOptions,
    #[serde(default = "AudioOptions::silent")]
    pub audio: AudioOptions,
    #[serde(default)]
    pub player: PlayerOptions,
    #[serde(default)]
    pub output: OutputOptions,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            rtsp_tcp: true,
            video: VideoOptions::default(),
            audio: AudioOptions::silent(),
            player: PlayerOptions::default(),
            output: OutputOptions::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOptions {
    pub codec: String,
    pub preset: String,
    pub bitrate: String,
    pub fps: String,
    pub profile: String,
    pub tune: String,
    /// probe 选中的视频流序号，只在运行期使用
    #[serde(skip)]
    pub id: String,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            codec: "copy".to_string(),
            preset: "ultrafast".to_string(),
            bitrate: "4096".to_string(),
            fps: "25".to_string(),
            profile: "auto".to_string(),
            tune: "none".to_string(),
            id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOptions {
    pub codec: String,
    pub preset: String,
    pub bitrate: String,
    pub channels: String,
    pub sampling: String,
    /// probe 选中的音频流序号，无音频时为 "a"
    #[serde(skip)]
    pub id: String,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            codec: "auto".to_string(),
            preset: "silence".to_string(),
            bitrate: "64".to_string(),
            channels: "mono".to_string(),
            sampling: "44100".to_string(),
            id: String::new(),
        }
    }
}

impl AudioOptions {
    /// 全新安装时的音频设置: 不输出音频
    pub fn silent() -> Self {
        Self {
            codec: "none".to_string(),
            ..Self::default()
        }
    }

    /// 按 RS_AUDIO 改写音频设置，未知值保持不变
    pub fn apply_preset(&mut self, preset: Option<&str>) {
        let (codec, audio_preset, bitrate, channels, sampling) = match preset {
            Some("auto") => {
                self.codec = "auto".to_string();
                return;
            }
            Some("none") => {
                self.codec = "none".to_string();
                return;
            }
            Some("silence") => ("aac", "silence", "8", "mono", "44100"),
            Some("aac") => ("aac", "encode", "64", "inherit", "inherit"),
            Some("mp3") => ("mp3", "encode", "64", "inherit", "inherit"),
            _ => return,
        };

        self.codec = codec.to_string();
        self.preset = audio_preset.to_string();
        self.bitrate = bitrate.to_string();
        self.channels = channels.to_string();
        self.sampling = sampling.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerOptions {
    pub autoplay: bool,
    pub mute: bool,
    pub statistics: bool,
    pub color: String,
    pub logo: PlayerLogo,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            autoplay: true,
            mute: true,
            statistics: false,
            color: "#3daa48".to_string(),
            logo: PlayerLogo::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLogo {
    pub image: String,
    pub position: String,
    pub link: String,
}

impl Default for PlayerLogo {
    fn default() -> Self {
        Self {
            image: String::new(),
            position: "bottom-right".to_string(),
            link: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Rtmp,
    Hls,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputOptions {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub rtmp: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub hls: HlsOptions,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            kind: OutputKind::Rtmp,
            rtmp: serde_json::Map::new(),
            hls: HlsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsOptions {
    pub method: String,
    pub time: String,
    pub list_size: String,
    pub timeout: String,
}

impl Default for HlsOptions {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            time: "2".to_string(),
            list_size: "6".to_string(),
            timeout: "10".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Addresses {
    #[serde(default)]
    pub src_address: String,
    #[serde(default)]
    pub optional_output_address: String,
    #[serde(default)]
    pub src_streams: SrcStreams,
}

/// probe 记录下来的源流信息，仅用于展示
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrcStreams {
    #[serde(default, deserialize_with = "empty_object_as_none")]
    pub video: Option<VideoStreamInfo>,
    #[serde(default, deserialize_with = "empty_object_as_none")]
    pub audio: Option<AudioStreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub codec: String,
    #[serde(default)]
    pub layout: String,
    pub channels: u32,
    #[serde(default)]
    pub sampling: String,
}

/// 旧版数据库用 `{}` 表示"尚未探测"
fn empty_object_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// 持久化到 v1.json 并推送给前端的完整快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamData {
    pub addresses: Addresses,
    pub options: StreamOptions,
    pub states: PerStream<StreamState>,
    pub user_actions: PerStream<UserAction>,
}

impl Default for StreamData {
    fn default() -> Self {
        Self {
            addresses: Addresses::default(),
            options: StreamOptions::default(),
            states: PerStream::new(
                StreamState::new(StateKind::Stopped),
                StreamState::new(StateKind::Stopped),
            ),
            user_actions: PerStream::new(UserAction::Stop, UserAction::Stop),
        }
    }
}

/// 遮蔽 URL 中的 `?token=...` 查询参数
pub fn redact_token(text: &str) -> String {
    const MARKER: &str = "?token=";
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(MARKER) {
        let (head, tail) = rest.split_at(pos + MARKER.len());
        result.push_str(head);
        let end = tail
            .find(|c: char| c.is_whitespace() || matches!(c, '&' | ':' | '\'' | '"'))
            .unwrap_or(tail.len());
        let value = &tail[..end];
        if value.is_empty() {
            rest = tail;
            continue;
        }
        result.push_str("***");
        rest = &tail[value.len()..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_names() {
        for stream in StreamType::ALL {
            assert_eq!(stream.as_str().parse::<StreamType>(), Ok(stream));
        }
        assert_eq!(
            "repeatToNowhere".parse::<StreamType>(),
            Err(UnknownStreamType("repeatToNowhere".to_string()))
        );
    }

    #[test]
    fn test_stream_data_uses_legacy_keys() {
        let data = StreamData::default();
        let value = serde_json::to_value(&data).unwrap();

        assert_eq!(value["states"]["repeatToLocalNginx"]["type"], "stopped");
        assert_eq!(value["userActions"]["repeatToOptionalOutput"], "stop");
        assert_eq!(value["options"]["rtspTcp"], true);
        assert_eq!(value["options"]["output"]["hls"]["listSize"], "6");
        assert_eq!(value["addresses"]["srcAddress"], "");
        assert!(value["options"]["video"].get("id").is_none());
    }

    #[test]
    fn test_empty_src_streams_read_as_none() {
        let json = r#"{"srcAddress":"rtmp://a","optionalOutputAddress":"","srcStreams":{"audio":{},"video":{}}}"#;
        let addresses: Addresses = serde_json::from_str(json).unwrap();
        assert_eq!(addresses.src_streams, SrcStreams::default());

        let json = r#"{"srcStreams":{"video":{"index":1,"type":"video","codec":"h264","width":1280,"height":720,"format":"yuv420p"}}}"#;
        let addresses: Addresses = serde_json::from_str(json).unwrap();
        let video = addresses.src_streams.video.expect("video info");
        assert_eq!(video.index, 1);
        assert_eq!(video.width * video.height, 1280 * 720);
        assert!(addresses.src_streams.audio.is_none());
    }

    #[test]
    fn test_audio_presets() {
        let mut audio = AudioOptions::silent();
        audio.apply_preset(Some("silence"));
        assert_eq!(audio.codec, "aac");
        assert_eq!(audio.preset, "silence");
        assert_eq!(audio.bitrate, "8");

        audio.apply_preset(Some("mp3"));
        assert_eq!(audio.codec, "mp3");
        assert_eq!(audio.channels, "inherit");

        audio.apply_preset(Some("auto"));
        assert_eq!(audio.codec, "auto");
        assert_eq!(audio.preset, "encode");

        audio.apply_preset(Some("unknown"));
        audio.apply_preset(None);
        assert_eq!(audio.codec, "auto");
    }

    #[test]
    fn test_partial_options_keep_defaults() {
        let options: StreamOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, StreamOptions::default());
        assert!(options.rtsp_tcp);

        let options: StreamOptions = serde_json::from_str(r#"{"rtspTcp":false}"#).unwrap();
        assert!(!options.rtsp_tcp);
        assert_eq!(options.audio.codec, "none");
    }

    #[test]
    fn test_redact_token() {
        assert_eq!(
            redact_token("rtmp://127.0.0.1:1935/hls/live.stream?token=secret: Connection refused"),
            "rtmp://127.0.0.1:1935/hls/live.stream?token=***: Connection refused"
        );
        assert_eq!(
            redact_token("a?token=x b?token=y"),
            "a?token=*** b?token=***"
        );
        assert_eq!(
            redact_token("'rtmp://cdn/live?token=abc&app=live' failed"),
            "'rtmp://cdn/live?token=***&app=live' failed"
        );
        assert_eq!(redact_token("no credentials here"), "no credentials here");
        assert_eq!(redact_token("dangling?token="), "dangling?token=");
    }
}
