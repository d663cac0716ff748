use crate::engine::ProcessSpec;
use crate::state::{AudioOptions, HlsOptions, VideoOptions};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// 一个命名的 ffmpeg 参数模板
///
/// 每个选项字符串形如 `-flag value`，在第一个空格处拆成两个参数，
/// 值中的 `{key}` 占位符在构建命令时替换。
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct OptionTemplate {
    /// 出现时开启一个新的输入
    #[serde(default)]
    pub input: Option<String>,
    /// 追加到最近一个输入之前的选项
    #[serde(default)]
    pub input_options: Vec<String>,
    #[serde(default)]
    pub output_options: Vec<String>,
}

/// 有序的占位符替换表
pub type Replacements = Vec<(&'static str, String)>;

/// 替换文本中所有 `{key}` 占位符，未知占位符原样保留
pub fn substitute(template: &str, replacements: &[(&str, String)]) -> String {
    let mut result = template.to_string();
    for (key, value) in replacements {
        let placeholder = format!("{{{}}}", key);
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, value);
        }
    }
    result
}

pub fn video_replacements(video: &VideoOptions) -> Replacements {
    let mut replacements = vec![
        ("videoid", video.id.clone()),
        ("preset", video.preset.clone()),
        ("bitrate", video.bitrate.clone()),
        ("fps", video.fps.clone()),
    ];
    // fps 不是数字时不提供 gop，占位符保持原样
    if let Ok(fps) = video.fps.trim().parse::<u64>() {
        replacements.push(("gop", fps.saturating_mul(2).to_string()));
    }
    replacements.push(("profile", video.profile.clone()));
    replacements.push(("tune", video.tune.clone()));
    replacements
}

pub fn audio_replacements(audio: &AudioOptions) -> Replacements {
    vec![
        ("audioid", audio.id.clone()),
        ("bitrate", audio.bitrate.clone()),
        ("channels", audio.channels.clone()),
        ("sampling", audio.sampling.clone()),
    ]
}

pub fn hls_replacements(hls: &HlsOptions) -> Replacements {
    vec![
        ("method", hls.method.clone()),
        ("time", hls.time.clone()),
        ("listSize", hls.list_size.clone()),
        ("timeout", hls.timeout.clone()),
    ]
}

#[derive(Debug, Default)]
struct InputSection {
    url: String,
    options: Vec<String>,
}

/// 把命名模板解析成扁平的 ffmpeg 参数列表
pub struct CommandBuilder<'a> {
    templates: &'a BTreeMap<String, OptionTemplate>,
    program: String,
    inputs: Vec<InputSection>,
    output_options: Vec<String>,
    output: String,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(
        templates: &'a BTreeMap<String, OptionTemplate>,
        program: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            templates,
            program: program.into(),
            inputs: vec![InputSection {
                url: input.into(),
                options: Vec::new(),
            }],
            output_options: Vec::new(),
            output: String::new(),
        }
    }

    /// 按名称追加模板，名称不存在时跳过
    pub fn add(&mut self, name: &str, replacements: &[(&str, String)]) -> &mut Self {
        let Some(template) = self.templates.get(name) else {
            debug!("Option template [{}] not configured, skipping", name);
            return self;
        };

        if let Some(input) = &template.input {
            self.inputs.push(InputSection {
                url: substitute(input, replacements),
                options: Vec::new(),
            });
        }

        if let Some(current) = self.inputs.last_mut() {
            for option in &template.input_options {
                current.options.push(substitute(option, replacements));
            }
        }

        for option in &template.output_options {
            self.output_options.push(substitute(option, replacements));
        }

        self
    }

    pub fn output(&mut self, target: impl Into<String>) -> &mut Self {
        self.output = target.into();
        self
    }

    pub fn build(&self) -> ProcessSpec {
        let mut args = Vec::new();

        for input in &self.inputs {
            for option in &input.options {
                push_split(&mut args, option);
            }
            args.push("-i".to_string());
            args.push(input.url.clone());
        }

        for option in &self.output_options {
            push_split(&mut args, option);
        }

        if !self.output.is_empty() {
            args.push(self.output.clone());
        }

        ProcessSpec {
            program: self.program.clone(),
            args,
        }
    }
}

fn push_split(args: &mut Vec<String>, option: &str) {
    for part in option.splitn(2, ' ') {
        if !part.is_empty() {
            args.push(part.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn templates() -> BTreeMap<String, OptionTemplate> {
        let yaml = r#"
global:
  input_options: ["-err_detect ignore_err"]
  output_options: ["-loglevel info", "-stats_period 2"]
video_codec_h264:
  output_options: ["-map 0:{videoid}", "-g {gop}", "-b:v {bitrate}k"]
rtsp-tcp:
  input_options: ["-rtsp_transport tcp"]
overlay:
  input: "{logo}"
  input_options: ["-loop 1"]
  output_options: ["-filter_complex overlay"]
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_substitute_keeps_unknown_placeholders() {
        let replacements = vec![("bitrate", "4096".to_string())];
        assert_eq!(
            substitute("-b:v {bitrate}k -maxrate {bitrate}k {unknown}", &replacements),
            "-b:v 4096k -maxrate 4096k {unknown}"
        );
    }

    #[test]
    fn test_gop_is_twice_fps() {
        let mut video = VideoOptions::default();
        video.fps = "30".to_string();
        let replacements = video_replacements(&video);
        assert!(replacements.contains(&("gop", "60".to_string())));

        video.fps = "auto".to_string();
        let replacements = video_replacements(&video);
        assert!(replacements.iter().all(|(key, _)| *key != "gop"));
    }

    #[test]
    fn test_build_flattens_inputs_and_outputs() {
        let templates = templates();
        let mut video = VideoOptions::default();
        video.id = "1".to_string();
        video.fps = "25".to_string();
        video.bitrate = "2048".to_string();

        let spec = CommandBuilder::new(&templates, "ffmpeg", "rtsp://cam/1")
            .add("global", &[])
            .add("rtsp-tcp", &[])
            .add("missing", &[])
            .add("video_codec_h264", &video_replacements(&video))
            .output("/tmp/hls/live.stream.m3u8")
            .build();

        assert_eq!(spec.program, "ffmpeg");
        assert_eq!(
            spec.args,
            vec![
                "-err_detect", "ignore_err", "-rtsp_transport", "tcp", "-i", "rtsp://cam/1",
                "-loglevel", "info", "-stats_period", "2", "-map", "0:1", "-g", "50", "-b:v",
                "2048k", "/tmp/hls/live.stream.m3u8",
            ]
        );
    }

    #[test]
    fn test_template_input_opens_new_section() {
        let templates = templates();
        let spec = CommandBuilder::new(&templates, "ffmpeg", "rtmp://src")
            .add("overlay", &[("logo", "logo.png".to_string())])
            .output("out.flv")
            .build();

        assert_eq!(
            spec.args,
            vec![
                "-i", "rtmp://src", "-loop", "1", "-i", "logo.png", "-filter_complex", "overlay",
                "out.flv",
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_substitute_without_braces_is_identity(text in "[a-z0-9 :_-]{0,40}", value in "[a-z0-9]{0,8}") {
            let replacements = vec![("bitrate", value)];
            prop_assert_eq!(substitute(&text, &replacements), text);
        }

        #[test]
        fn prop_substitute_replaces_every_occurrence(count in 1usize..5, value in "[a-z0-9]{1,8}") {
            let template = "{fps} ".repeat(count);
            let replacements = vec![("fps", value.clone())];
            let result = substitute(&template, &replacements);
            prop_assert_eq!(result.matches(value.as_str()).count() >= count, true);
            let leftover = result.contains("{fps}");
            prop_assert!(!leftover, "placeholder left in {:?}", result);
        }
    }
}
