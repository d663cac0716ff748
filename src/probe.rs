use crate::config::AppConfig;
use crate::state::{AudioStreamInfo, StreamOptions, StreamType, VideoStreamInfo};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("ffprobe timeout")]
    Timeout,
    /// ffprobe 运行失败，携带 stderr 最后一个非空行
    #[error("{0}")]
    Failed(String),
    #[error("failed to parse probe result: {0}")]
    Parse(String),
    #[error("no video stream detected")]
    NoVideo,
    #[error("video stream must be h264, found {0}")]
    IncompatibleVideo(String),
    #[error("can't copy audio stream, found unsupported codec {0}")]
    UnsupportedAudio(String),
}

/// ffprobe `-show_streams` 输出中的单个流
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    #[serde(default)]
    pub codec_type: String,
    #[serde(default)]
    pub codec_name: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub pix_fmt: String,
    #[serde(default)]
    pub channels: u32,
    #[serde(default)]
    pub channel_layout: String,
    #[serde(default)]
    pub sample_rate: String,
}

impl ProbeStream {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn video_info(&self) -> VideoStreamInfo {
        VideoStreamInfo {
            index: self.index,
            kind: "video".to_string(),
            codec: self.codec_name.clone(),
            width: self.width,
            height: self.height,
            format: self.pix_fmt.clone(),
        }
    }

    pub fn audio_info(&self) -> AudioStreamInfo {
        AudioStreamInfo {
            index: self.index,
            kind: "audio".to_string(),
            codec: self.codec_name.clone(),
            layout: self.channel_layout.clone(),
            channels: self.channels,
            sampling: self.sample_rate.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

/// 按名称引用的参数模板，由调用方在配置中解析
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedOptions {
    pub video: Vec<String>,
    pub audio: Vec<String>,
}

/// 一次成功探测的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub options: SelectedOptions,
    pub video: ProbeStream,
    pub audio: Option<ProbeStream>,
}

pub struct Prober {
    binary: String,
    timeout: Duration,
    socket_timeout: Option<(String, String)>,
}

impl Prober {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            socket_timeout: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut prober = Self::new(
            config.server.ffprobe_binary.clone(),
            Duration::from_millis(config.probe.timeout_ms),
        );
        if let (Some(key), Some(value)) = (&config.probe.socket_timeout_key, &config.probe.socket_timeout) {
            prober.socket_timeout = Some((key.clone(), value.clone()));
        }
        prober
    }

    pub fn args(&self, url: &str, rtsp_tcp: bool) -> Vec<String> {
        let mut args: Vec<String> = ["-of", "json", "-v", "error", "-show_streams", "-show_format"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if url.starts_with("rtsp") && rtsp_tcp {
            args.push("-rtsp_transport".to_string());
            args.push("tcp".to_string());
            if let Some((key, value)) = &self.socket_timeout {
                args.push(key.clone());
                args.push(value.clone());
            }
        }

        args.push(url.to_string());
        args
    }

    /// 探测源地址并按流类型选出参数模板
    ///
    /// # 错误处理
    /// - 超时: 子进程被强制结束，返回 `ProbeError::Timeout`
    /// - 运行失败: 返回 stderr 最后一个非空行
    /// - 输出无法解析或不满足要求: 返回对应的 `ProbeError`
    pub async fn probe(
        &self,
        url: &str,
        stream_type: StreamType,
        options: &StreamOptions,
    ) -> Result<Selection, ProbeError> {
        let streams = self.run(url, options.rtsp_tcp).await?;

        let (video, audio) = select_streams(&streams);
        let video = video.ok_or(ProbeError::NoVideo)?.clone();
        let audio = audio.cloned();

        let selected = decide(stream_type, &video, audio.as_ref(), options)?;
        debug!(
            "Probe selected video={:?} audio={:?}",
            selected.video, selected.audio
        );

        Ok(Selection {
            options: selected,
            video,
            audio,
        })
    }

    async fn run(&self, url: &str, rtsp_tcp: bool) -> Result<Vec<ProbeStream>, ProbeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(url, rtsp_tcp))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // 超时后 future 被丢弃，kill_on_drop 负责结束子进程
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => return Err(ProbeError::Timeout),
            Ok(Err(e)) => return Err(ProbeError::Failed(e.to_string())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let line = stderr
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .last()
                .map(str::to_string)
                .unwrap_or_else(|| format!("ffprobe failed: {}", output.status));
            return Err(ProbeError::Failed(line));
        }

        parse_output(&output.stdout)
    }
}

pub fn parse_output(stdout: &[u8]) -> Result<Vec<ProbeStream>, ProbeError> {
    serde_json::from_slice::<ProbeOutput>(stdout)
        .map(|output| output.streams)
        .map_err(|e| ProbeError::Parse(e.to_string()))
}

/// 选出像素最多的视频流和声道最多的音频流，相同时保留先出现的
pub fn select_streams(streams: &[ProbeStream]) -> (Option<&ProbeStream>, Option<&ProbeStream>) {
    let mut video: Option<&ProbeStream> = None;
    let mut audio: Option<&ProbeStream> = None;

    for stream in streams {
        match stream.codec_type.as_str() {
            "video" => {
                if video.map_or(true, |best| stream.pixels() > best.pixels()) {
                    video = Some(stream);
                }
            }
            "audio" => {
                if audio.map_or(true, |best| stream.channels > best.channels) {
                    audio = Some(stream);
                }
            }
            _ => {}
        }
    }

    (video, audio)
}

/// 根据流类型、用户选项和源流信息决定参数模板
pub fn decide(
    stream_type: StreamType,
    video: &ProbeStream,
    audio: Option<&ProbeStream>,
    options: &StreamOptions,
) -> Result<SelectedOptions, ProbeError> {
    let mut selected = SelectedOptions::default();

    if stream_type == StreamType::Repeat {
        selected.video.push("video_codec_copy".to_string());
        match audio {
            Some(audio) => {
                selected.audio.push("audio_preset_copy".to_string());
                if audio.codec_name == "aac" {
                    selected.audio.push("audio_codec_copy_aac".to_string());
                } else {
                    selected.audio.push("audio_codec_copy".to_string());
                }
            }
            None => selected.audio.push("audio_codec_none".to_string()),
        }
        return Ok(selected);
    }

    // 1. 视频: 转码为 h264，或要求源流已经是 h264
    let video_options = &options.video;
    if video_options.codec == "h264" {
        selected.video.push("video_codec_h264".to_string());
        if video_options.profile != "auto" {
            selected.video.push("video_codec_h264_profile".to_string());
        }
        if video_options.tune != "none" {
            selected.video.push("video_codec_h264_tune".to_string());
        }
    } else {
        if video.codec_name != "h264" {
            return Err(ProbeError::IncompatibleVideo(video.codec_name.clone()));
        }
        selected.video.push("video_codec_copy".to_string());
    }

    // 2. 音频
    let audio_options = &options.audio;
    let codec = audio_options.codec.as_str();
    let Some(audio) = audio else {
        // 源流没有音频时按需补静音
        match codec {
            "aac" | "auto" => selected.audio.extend([
                "audio_codec_aac",
                "audio_preset_silence",
                "audio_filter_all",
            ].map(String::from)),
            "mp3" => selected.audio.extend([
                "audio_codec_mp3",
                "audio_preset_silence",
                "audio_filter_all",
            ].map(String::from)),
            _ => selected.audio.push("audio_codec_none".to_string()),
        }
        return Ok(selected);
    };

    match codec {
        "none" => selected.audio.push("audio_codec_none".to_string()),
        "aac" | "mp3" => {
            if audio_options.preset == "encode" {
                selected.audio.push("audio_preset_copy".to_string());
            }
            selected.audio.push(format!("audio_codec_{}", codec));
            selected.audio.push(format!("audio_preset_{}", audio_options.preset));

            let channels = audio_options.channels != "inherit";
            let sampling = audio_options.sampling != "inherit";
            match (channels, sampling) {
                (true, true) => selected.audio.push("audio_filter_all".to_string()),
                (true, false) => selected.audio.push("audio_filter_channels".to_string()),
                (false, true) => selected.audio.push("audio_filter_sampling".to_string()),
                (false, false) => {}
            }
        }
        "auto" => {
            selected.audio.push("audio_preset_copy".to_string());
            match audio.codec_name.as_str() {
                "aac" => selected.audio.push("audio_codec_copy_aac".to_string()),
                "mp3" => selected.audio.push("audio_codec_copy".to_string()),
                _ => selected
                    .audio
                    .extend(["audio_codec_aac", "audio_preset_encode"].map(String::from)),
            }
        }
        _ => {
            selected.audio.push("audio_preset_copy".to_string());
            match audio.codec_name.as_str() {
                // FLV 容器允许直接复制的编码
                "mp3" | "pcm_alaw" | "pcm_mulaw" => selected.audio.push("audio_codec_copy".to_string()),
                "aac" => selected.audio.push("audio_codec_copy_aac".to_string()),
                other => {
                    if codec == "copy" {
                        return Err(ProbeError::UnsupportedAudio(other.to_string()));
                    }
                    selected
                        .audio
                        .extend(["audio_codec_aac", "audio_preset_encode"].map(String::from));
                }
            }
        }
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(index: u32, codec: &str, width: u32, height: u32) -> ProbeStream {
        ProbeStream {
            index,
            codec_type: "video".to_string(),
            codec_name: codec.to_string(),
            width,
            height,
            ..ProbeStream::default()
        }
    }

    fn audio(index: u32, codec: &str, channels: u32) -> ProbeStream {
        ProbeStream {
            index,
            codec_type: "audio".to_string(),
            codec_name: codec.to_string(),
            channels,
            ..ProbeStream::default()
        }
    }

    fn options_with_audio(codec: &str, preset: &str) -> StreamOptions {
        let mut options = StreamOptions::default();
        options.audio.codec = codec.to_string();
        options.audio.preset = preset.to_string();
        options
    }

    #[test]
    fn test_selects_largest_video_and_most_channels() {
        let streams = vec![
            video(0, "h264", 640, 480),
            video(1, "h264", 1920, 1080),
            audio(2, "aac", 2),
            audio(3, "aac", 6),
        ];
        let (v, a) = select_streams(&streams);
        assert_eq!(v.map(|s| s.index), Some(1));
        assert_eq!(a.map(|s| s.index), Some(3));
    }

    #[test]
    fn test_ties_keep_first_stream() {
        let streams = vec![
            audio(0, "aac", 2),
            video(1, "h264", 1280, 720),
            video(2, "hevc", 720, 1280),
            audio(3, "mp3", 2),
        ];
        let (v, a) = select_streams(&streams);
        assert_eq!(v.map(|s| s.index), Some(1));
        assert_eq!(a.map(|s| s.index), Some(0));
    }

    #[test]
    fn test_parse_output() {
        let json = br#"{"streams":[{"index":0,"codec_type":"video","codec_name":"h264","width":1280,"height":720,"pix_fmt":"yuv420p"},{"index":1,"codec_type":"audio","codec_name":"aac","channels":2,"channel_layout":"stereo","sample_rate":"44100"}],"format":{}}"#;
        let streams = parse_output(json).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].pix_fmt, "yuv420p");
        assert_eq!(streams[1].audio_info().sampling, "44100");

        assert!(parse_output(b"{}").unwrap().is_empty());
        assert!(matches!(parse_output(b"garbage"), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_ingest_requires_h264_for_copy() {
        let options = StreamOptions::default();
        let err = decide(StreamType::Ingest, &video(0, "hevc", 1, 1), None, &options).unwrap_err();
        assert_eq!(err.to_string(), "video stream must be h264, found hevc");

        let mut options = StreamOptions::default();
        options.video.codec = "h264".to_string();
        options.video.profile = "high".to_string();
        let selected = decide(StreamType::Ingest, &video(0, "hevc", 1, 1), None, &options).unwrap();
        assert_eq!(
            selected.video,
            vec!["video_codec_h264", "video_codec_h264_profile"]
        );
    }

    #[test]
    fn test_ingest_without_source_audio() {
        let v = video(0, "h264", 1280, 720);

        let selected = decide(StreamType::Ingest, &v, None, &options_with_audio("none", "silence")).unwrap();
        assert_eq!(selected.video, vec!["video_codec_copy"]);
        assert_eq!(selected.audio, vec!["audio_codec_none"]);

        let selected = decide(StreamType::Ingest, &v, None, &options_with_audio("auto", "encode")).unwrap();
        assert_eq!(
            selected.audio,
            vec!["audio_codec_aac", "audio_preset_silence", "audio_filter_all"]
        );

        let selected = decide(StreamType::Ingest, &v, None, &options_with_audio("mp3", "encode")).unwrap();
        assert_eq!(selected.audio[0], "audio_codec_mp3");
    }

    #[test]
    fn test_ingest_audio_encode_with_filters() {
        let v = video(0, "h264", 1280, 720);
        let a = audio(1, "opus", 2);

        let mut options = options_with_audio("aac", "encode");
        options.audio.channels = "mono".to_string();
        options.audio.sampling = "inherit".to_string();
        let selected = decide(StreamType::Ingest, &v, Some(&a), &options).unwrap();
        assert_eq!(
            selected.audio,
            vec![
                "audio_preset_copy",
                "audio_codec_aac",
                "audio_preset_encode",
                "audio_filter_channels"
            ]
        );

        let mut options = options_with_audio("mp3", "silence");
        options.audio.channels = "inherit".to_string();
        options.audio.sampling = "inherit".to_string();
        let selected = decide(StreamType::Ingest, &v, Some(&a), &options).unwrap();
        assert_eq!(selected.audio, vec!["audio_codec_mp3", "audio_preset_silence"]);
    }

    #[test]
    fn test_ingest_audio_auto_and_copy() {
        let v = video(0, "h264", 1280, 720);
        let auto = options_with_audio("auto", "encode");

        let selected = decide(StreamType::Ingest, &v, Some(&audio(1, "aac", 2)), &auto).unwrap();
        assert_eq!(selected.audio, vec!["audio_preset_copy", "audio_codec_copy_aac"]);

        let selected = decide(StreamType::Ingest, &v, Some(&audio(1, "opus", 2)), &auto).unwrap();
        assert_eq!(
            selected.audio,
            vec!["audio_preset_copy", "audio_codec_aac", "audio_preset_encode"]
        );

        let copy = options_with_audio("copy", "encode");
        let selected = decide(StreamType::Ingest, &v, Some(&audio(1, "pcm_alaw", 1)), &copy).unwrap();
        assert_eq!(selected.audio, vec!["audio_preset_copy", "audio_codec_copy"]);

        let err = decide(StreamType::Ingest, &v, Some(&audio(1, "opus", 2)), &copy).unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't copy audio stream, found unsupported codec opus"
        );
    }

    #[test]
    fn test_repeat_always_copies() {
        let mut options = StreamOptions::default();
        options.video.codec = "h264".to_string();
        let v = video(0, "hevc", 1280, 720);

        let selected = decide(StreamType::Repeat, &v, Some(&audio(1, "aac", 2)), &options).unwrap();
        assert_eq!(selected.video, vec!["video_codec_copy"]);
        assert_eq!(selected.audio, vec!["audio_preset_copy", "audio_codec_copy_aac"]);

        let selected = decide(StreamType::Repeat, &v, None, &options).unwrap();
        assert_eq!(selected.audio, vec!["audio_codec_none"]);
    }

    #[test]
    fn test_rtsp_args() {
        let mut config = AppConfig::default();
        config.probe.socket_timeout_key = Some("-timeout".to_string());
        config.probe.socket_timeout = Some("5000000".to_string());
        let prober = Prober::from_config(&config);

        let args = prober.args("rtsp://cam/1", true);
        assert_eq!(
            &args[6..],
            &["-rtsp_transport", "tcp", "-timeout", "5000000", "rtsp://cam/1"]
        );

        let args = prober.args("rtsp://cam/1", false);
        assert_eq!(&args[6..], &["rtsp://cam/1"]);

        let args = prober.args("rtmp://src/live", true);
        assert_eq!(args.last().map(String::as_str), Some("rtmp://src/live"));
        assert_eq!(args.len(), 7);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::testutil::write_script;
        use tempfile::tempdir;

        #[tokio::test]
        async fn test_probe_with_fake_ffprobe() {
            let dir = tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "ffprobe",
                r#"echo '{"streams":[{"index":0,"codec_type":"video","codec_name":"h264","width":1920,"height":1080}]}'"#,
            );
            let prober = Prober::new(script.to_string_lossy(), Duration::from_secs(10));

            let selection = prober
                .probe("rtmp://src/live", StreamType::Ingest, &StreamOptions::default())
                .await
                .unwrap();
            assert_eq!(selection.video.index, 0);
            assert!(selection.audio.is_none());
            assert_eq!(selection.options.video, vec!["video_codec_copy"]);
            assert_eq!(selection.options.audio, vec!["audio_codec_none"]);
        }

        #[tokio::test]
        async fn test_probe_failure_reports_last_line() {
            let dir = tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "ffprobe",
                "echo 'opening' >&2\necho 'rtmp://src/live: Connection refused' >&2\necho '' >&2\nexit 1",
            );
            let prober = Prober::new(script.to_string_lossy(), Duration::from_secs(10));

            let err = prober
                .probe("rtmp://src/live", StreamType::Ingest, &StreamOptions::default())
                .await
                .unwrap_err();
            assert_eq!(
                err,
                ProbeError::Failed("rtmp://src/live: Connection refused".to_string())
            );
        }

        #[tokio::test]
        async fn test_probe_timeout() {
            let dir = tempdir().unwrap();
            let script = write_script(dir.path(), "ffprobe", "exec sleep 30");
            let prober = Prober::new(script.to_string_lossy(), Duration::from_millis(200));

            let err = prober
                .probe("rtmp://src/live", StreamType::Ingest, &StreamOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err, ProbeError::Timeout);
            assert_eq!(err.to_string(), "ffprobe timeout");
        }

        #[tokio::test]
        async fn test_probe_without_video() {
            let dir = tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "ffprobe",
                r#"echo '{"streams":[{"index":0,"codec_type":"audio","codec_name":"aac","channels":2}]}'"#,
            );
            let prober = Prober::new(script.to_string_lossy(), Duration::from_secs(10));

            let err = prober
                .probe("rtmp://src/live", StreamType::Repeat, &StreamOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err, ProbeError::NoVideo);
        }
    }
}
