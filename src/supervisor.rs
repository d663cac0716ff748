use crate::config::{AppConfig, Environment};
use crate::engine::{ProcessError, ProcessEvent, ProcessHandle, ProcessSpec};
use crate::notify::{emit_event, EventSink};
use crate::probe::{Prober, Selection};
use crate::snapshot::{snapshot_interval, SnapshotFetcher};
use crate::state::{
    redact_token, OutputKind, PerStream, PlayerOptions, Progress, StateKind, StreamData,
    StreamOptions, StreamState, StreamType, UserAction,
};
use crate::store::{write_player_config, JsonStore};
use crate::task::{StaleCheck, StreamTask};
use crate::template::{audio_replacements, hls_replacements, video_replacements, CommandBuilder};
use crate::timeouts::{TimeoutKind, TimeoutRegistry};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub type StartFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// 前端发来的指令
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Command {
    StartStream(StartStream),
    StopStream(StreamType),
    CheckStates,
    PlayerOptions(PlayerOptions),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStream {
    pub stream_type: StreamType,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub optional_output: Option<String>,
    pub options: StreamOptions,
}

struct Record {
    data: StreamData,
    progresses: PerStream<Progress>,
}

enum StartGate {
    Skip,
    StoppedByUser,
    Proceed,
}

/// 两路流的唯一状态所有者
///
/// 共享记录只通过这里的方法修改。每个可挂起点 (probe、进程运行、计时器)
/// 恢复后都要重新确认 task 仍是当前 task 且用户没有点击停止。
pub struct Supervisor {
    config: AppConfig,
    env: Environment,
    store: JsonStore,
    record: Mutex<Record>,
    tasks: Mutex<HashMap<StreamType, Arc<StreamTask>>>,
    processes: Mutex<HashMap<StreamType, Arc<ProcessHandle>>>,
    timeouts: TimeoutRegistry,
    prober: Prober,
    snapshot: Arc<SnapshotFetcher>,
    events: Arc<dyn EventSink>,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        env: Environment,
        store: JsonStore,
        data: StreamData,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let prober = Prober::from_config(&config);
        let interval = snapshot_interval(env.snapshot_interval.as_deref());
        let snapshot = Arc::new(SnapshotFetcher::new(&config, interval));

        Arc::new(Self {
            config,
            env,
            store,
            record: Mutex::new(Record {
                data,
                progresses: PerStream::default(),
            }),
            tasks: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            timeouts: TimeoutRegistry::new(),
            prober,
            snapshot,
            events,
        })
    }

    // ---- 状态读写 ----

    pub fn stream_data(&self) -> StreamData {
        self.record.lock().unwrap().data.clone()
    }

    pub fn progresses(&self) -> PerStream<Progress> {
        self.record.lock().unwrap().progresses.clone()
    }

    pub fn state(&self, stream: StreamType) -> StreamState {
        self.record.lock().unwrap().data.states.get(stream).clone()
    }

    pub fn user_action(&self, stream: StreamType) -> UserAction {
        *self.record.lock().unwrap().data.user_actions.get(stream)
    }

    fn stopped_by_user(&self, stream: StreamType) -> bool {
        self.user_action(stream) == UserAction::Stop
    }

    /// 更新流状态，类型未变化时不通知
    ///
    /// # 副作用
    /// - 类型变化时推送 updateStreamData
    /// - ingest 进入 connected 时启动快照
    pub fn update_state(
        self: &Arc<Self>,
        stream: StreamType,
        kind: StateKind,
        message: impl Into<String>,
    ) -> StateKind {
        let previous = {
            let mut record = self.record.lock().unwrap();
            Self::set_state(&mut record, stream, kind, message.into())
        };

        if previous != kind {
            self.after_state_change(stream, previous, kind);
        }
        kind
    }

    fn set_state(record: &mut Record, stream: StreamType, kind: StateKind, message: String) -> StateKind {
        let state = record.data.states.get_mut(stream);
        let previous = state.kind;
        *state = StreamState { kind, message };
        previous
    }

    fn after_state_change(self: &Arc<Self>, stream: StreamType, previous: StateKind, kind: StateKind) {
        debug!("Stream [{}] state {} -> {}", stream, previous, kind);
        if stream == StreamType::Ingest && kind == StateKind::Connected {
            self.start_snapshots();
        }
        self.notify_stream_data();
    }

    /// 更新用户动作，变化时持久化并通知
    pub fn update_user_action(&self, stream: StreamType, action: UserAction) -> UserAction {
        let data = {
            let mut record = self.record.lock().unwrap();
            let current = record.data.user_actions.get_mut(stream);
            if *current == action {
                return action;
            }
            debug!("Stream [{}] user action {:?} -> {:?}", stream, *current, action);
            *current = action;
            record.data.clone()
        };

        self.persist(&data);
        emit_event(self.events.as_ref(), "updateStreamData", &data);
        action
    }

    /// 整体替换编码选项
    pub fn update_options(&self, options: StreamOptions) {
        let data = {
            let mut record = self.record.lock().unwrap();
            record.data.options = options;
            record.data.clone()
        };
        self.persist(&data);
        emit_event(self.events.as_ref(), "updateStreamData", &data);
    }

    /// 只更新播放器选项并重新生成 config.js
    pub fn update_player_options(&self, player: PlayerOptions) {
        debug!("Storing player options");
        let data = {
            let mut record = self.record.lock().unwrap();
            record.data.options.player = player;
            record.data.clone()
        };
        self.write_player_config(&data.options.player);
        self.persist(&data);
    }

    fn set_address(&self, stream: StreamType, url: &str) {
        let data = {
            let mut record = self.record.lock().unwrap();
            let addresses = &mut record.data.addresses;
            match stream {
                StreamType::Ingest => addresses.src_address = url.to_string(),
                StreamType::Repeat => addresses.optional_output_address = url.to_string(),
            }
            record.data.clone()
        };
        self.persist(&data);
    }

    fn address(&self, stream: StreamType) -> String {
        let record = self.record.lock().unwrap();
        match stream {
            StreamType::Ingest => record.data.addresses.src_address.clone(),
            StreamType::Repeat => record.data.addresses.optional_output_address.clone(),
        }
    }

    fn persist(&self, data: &StreamData) {
        if let Err(e) = self.store.write(data) {
            error!("Failed to write state file: {}", e);
        }
    }

    fn write_player_config(&self, player: &PlayerOptions) {
        let path = self.config.server.player_config_path();
        if let Err(e) = write_player_config(&path, player) {
            error!("Failed to write player config: {}", e);
        }
    }

    pub fn notify_stream_data(&self) {
        let data = self.stream_data();
        emit_event(self.events.as_ref(), "updateStreamData", &data);
    }

    fn notify_progress(&self) {
        if !self.events.has_observers() {
            return;
        }
        let progresses = self.progresses();
        emit_event(self.events.as_ref(), "updateProgress", &progresses);
    }

    /// 本地 nginx 的 RTMP 地址，repeat 流从这里拉取
    pub fn local_rtmp_url(&self) -> String {
        let streaming = &self.config.nginx.streaming;
        let mut url = format!(
            "rtmp://{}:{}{}/live.stream",
            streaming.ip, streaming.rtmp_port, streaming.rtmp_hls_path
        );
        let token = self.env.effective_token(&self.config);
        if !token.is_empty() {
            url.push_str("?token=");
            url.push_str(token);
        }
        url
    }

    // ---- task 管理 ----

    fn current_task(&self, stream: StreamType) -> Option<Arc<StreamTask>> {
        self.tasks.lock().unwrap().get(&stream).cloned()
    }

    fn is_current(&self, task: &Arc<StreamTask>) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .get(&task.stream_type)
            .is_some_and(|current| Arc::ptr_eq(current, task))
    }

    fn new_task(&self, stream: StreamType, url: &str) -> Arc<StreamTask> {
        Arc::new(StreamTask::new(
            url,
            stream,
            self.config.monitor.restart_wait(),
            self.config.monitor.probe_backoff_increment(),
        ))
    }

    /// 换上新 task，返回被替换的旧 task
    fn install_task(&self, task: Arc<StreamTask>) -> Option<Arc<StreamTask>> {
        self.tasks.lock().unwrap().insert(task.stream_type, task)
    }

    /// 释放旧 task 拥有的一切: 计时器、延时任务、进程
    async fn release_task(&self, task: Arc<StreamTask>) {
        let stream = task.stream_type;
        debug!("Stream [{}] releasing task for {}", stream, redact_token(&task.stream_url));

        task.cancel_timers();
        self.timeouts.clear(stream, TimeoutKind::Retry);
        self.timeouts.clear(stream, TimeoutKind::Stale);

        let owned = task.process();
        let registered = {
            let mut processes = self.processes.lock().unwrap();
            let is_owned = matches!(
                (processes.get(&stream), &owned),
                (Some(current), Some(owned)) if Arc::ptr_eq(current, owned)
            );
            if is_owned {
                processes.remove(&stream)
            } else {
                None
            }
        };

        for process in [task.take_process(), registered].into_iter().flatten() {
            process.terminate().await;
        }
    }

    /// 每次进程开始、结束或出错时回到基线，同时取消停滞检测
    fn reset_task(&self, task: &StreamTask) {
        task.reset();
        self.timeouts.clear(task.stream_type, TimeoutKind::Stale);
    }

    // ---- 状态机 ----

    /// 启动流
    ///
    /// 返回装箱的 future，供重试时在新任务中再次进入。
    pub fn start_stream(self: Arc<Self>, task: Arc<StreamTask>, force: bool) -> StartFuture {
        Box::pin(async move { self.run_stream(task, force).await })
    }

    fn begin_start(self: &Arc<Self>, stream: StreamType, force: bool) -> StartGate {
        let previous = {
            let mut record = self.record.lock().unwrap();
            let kind = record.data.states.get(stream).kind;

            // 1. 非强制启动时不打断正在进行的连接
            if !force && kind.is_active() {
                debug!("Stream [{}] skipping start because state is {}", stream, kind);
                return StartGate::Skip;
            }

            // 2. 用户已点击停止
            if *record.data.user_actions.get(stream) == UserAction::Stop {
                return StartGate::StoppedByUser;
            }

            // 3. 检查与置位在同一把锁内完成
            Self::set_state(&mut record, stream, StateKind::Connecting, String::new())
        };

        if previous != StateKind::Connecting {
            self.after_state_change(stream, previous, StateKind::Connecting);
        }
        StartGate::Proceed
    }

    async fn run_stream(self: &Arc<Self>, task: Arc<StreamTask>, force: bool) {
        let stream = task.stream_type;
        if !self.is_current(&task) {
            debug!("Stream [{}] skipping start of a replaced task", stream);
            return;
        }

        match self.begin_start(stream, force) {
            StartGate::Skip => return,
            StartGate::StoppedByUser => {
                debug!("Stream [{}] skipping start because stop has been clicked", stream);
                self.stop_stream(stream);
                self.update_state(stream, StateKind::Disconnected, "");
                return;
            }
            StartGate::Proceed => {}
        }
        info!("Stream [{}] start streaming", stream);

        // 1. probe，失败后按递增间隔重试
        let Some(selection) = self.probe_until_ready(&task).await else {
            return;
        };
        self.apply_probe(stream, &selection);

        // 2. 构建命令
        let options = self.stream_data().options;
        let spec = self.build_command(&task, &selection, &options);
        if stream == StreamType::Ingest {
            if let Err(e) = tokio::fs::create_dir_all(&self.config.server.hls_root).await {
                error!("Failed to create HLS root {}: {}", self.config.server.hls_root, e);
            }
        }

        // 3. 启动进程，检查与登记在同一把锁内完成
        let (handle, mut events) = {
            let tasks = self.tasks.lock().unwrap();
            if !tasks.get(&stream).is_some_and(|current| Arc::ptr_eq(current, &task)) {
                debug!("Stream [{}] task replaced before spawn", stream);
                return;
            }
            // 停止指令先写用户动作再取 tasks 锁，这里看到 start 即可安全启动
            if self.stopped_by_user(stream) {
                drop(tasks);
                self.update_state(stream, StateKind::Disconnected, "");
                return;
            }
            let (handle, events) = ProcessHandle::spawn(stream.as_str(), spec);
            task.set_process(handle.clone());
            (handle, events)
        };
        self.record.lock().unwrap().progresses.get_mut(stream).frames = 0;

        // 4. 处理进程事件直到终止
        let mut outcome: Result<(), ProcessError> = Ok(());
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Started(command_line) => self.on_process_started(&task, &handle, &command_line),
                ProcessEvent::Stderr(line) => {
                    if !task.is_connected() {
                        self.on_first_line(&task);
                    }
                    self.on_stderr(&task, &line);
                }
                ProcessEvent::Ended => outcome = Ok(()),
                ProcessEvent::Failed(e) => outcome = Err(e),
            }
        }

        self.on_process_exit(&task, &handle, outcome);
    }

    async fn probe_until_ready(self: &Arc<Self>, task: &Arc<StreamTask>) -> Option<Selection> {
        let stream = task.stream_type;
        let url = match stream {
            StreamType::Ingest => task.stream_url.clone(),
            StreamType::Repeat => self.local_rtmp_url(),
        };

        loop {
            let options = self.stream_data().options;
            let result = self.prober.probe(&url, stream, &options).await;

            if !self.should_continue(task) {
                return None;
            }

            let e = match result {
                Ok(selection) => return Some(selection),
                Err(e) => e,
            };

            let message = redact_token(&e.to_string());
            error!("Stream [{}] failed to spawn ffprobe: {}", stream, message);
            self.update_state(stream, StateKind::Error, message);

            debug!(
                "Stream [{}] try spawn ffprobe in {:?}",
                stream,
                task.probe_timer.current()
            );
            let fired = task.probe_timer.wait().await;
            if !self.should_continue(task) || !fired {
                return None;
            }
        }
    }

    /// 挂起点恢复后的检查: task 被替换时静默退出，用户停止时转为 disconnected
    fn should_continue(self: &Arc<Self>, task: &Arc<StreamTask>) -> bool {
        let stream = task.stream_type;
        if !self.is_current(task) {
            debug!("Stream [{}] task replaced while waiting", stream);
            return false;
        }
        if self.stopped_by_user(stream) {
            debug!("Stream [{}] skipping retry since stop has been clicked", stream);
            self.update_state(stream, StateKind::Disconnected, "");
            return false;
        }
        true
    }

    /// 记录 probe 选中的流序号，ingest 还要落盘源流信息
    fn apply_probe(&self, stream: StreamType, selection: &Selection) {
        let data = {
            let mut record = self.record.lock().unwrap();
            let options = &mut record.data.options;
            (options.video.id, options.audio.id) = selected_ids(selection);

            if stream != StreamType::Ingest {
                return;
            }

            let src_streams = &mut record.data.addresses.src_streams;
            src_streams.video = Some(selection.video.video_info());
            if let Some(audio) = &selection.audio {
                src_streams.audio = Some(audio.audio_info());
            }
            record.data.clone()
        };
        self.persist(&data);
    }

    fn build_command(
        &self,
        task: &StreamTask,
        selection: &Selection,
        options: &StreamOptions,
    ) -> ProcessSpec {
        let templates = &self.config.ffmpeg.options;
        let program = self.config.server.ffmpeg_binary.clone();

        // 流序号取自本次 probe，共享 options 里的 id 可能已被另一路覆盖
        let (video_id, audio_id) = selected_ids(selection);
        let mut video_options = options.video.clone();
        video_options.id = video_id;
        let mut audio_options = options.audio.clone();
        audio_options.id = audio_id;
        let video = video_replacements(&video_options);
        let audio = audio_replacements(&audio_options);

        let mut builder = match task.stream_type {
            StreamType::Ingest => {
                let mut builder = CommandBuilder::new(templates, program, task.stream_url.clone());
                builder.add("global", &[]).add("video", &video).add("local_mpegts", &[]);
                if task.stream_url.starts_with("rtsp") {
                    builder.add("rtsp", &[]);
                    if options.rtsp_tcp {
                        builder.add("rtsp-tcp", &[]);
                    }
                }
                builder.output(self.config.server.local_playlist().to_string_lossy());
                builder
            }
            StreamType::Repeat => {
                let mut builder = CommandBuilder::new(templates, program, self.local_rtmp_url());
                builder.add("global", &[]).add("video", &video);
                match options.output.kind {
                    OutputKind::Hls => builder.add("hls", &hls_replacements(&options.output.hls)),
                    OutputKind::Rtmp => builder.add("rtmp", &[]),
                };
                builder.output(task.stream_url.clone());
                builder
            }
        };

        for name in &selection.options.video {
            builder.add(name, &video);
        }
        for name in &selection.options.audio {
            builder.add(name, &audio);
        }

        builder.build()
    }

    fn on_process_started(self: &Arc<Self>, task: &Arc<StreamTask>, handle: &Arc<ProcessHandle>, command_line: &str) {
        let stream = task.stream_type;
        self.reset_task(task);

        if !self.is_current(task) {
            handle.kill();
            return;
        }
        self.processes.lock().unwrap().insert(stream, handle.clone());

        if self.stopped_by_user(stream) {
            debug!("Stream [{}] stopping freshly spawned process because stop has been clicked", stream);
            self.stop_stream(stream);
            return;
        }
        debug!("Stream [{}] spawned: {}", stream, redact_token(command_line));
    }

    /// 第一行诊断输出即视为已连接
    fn on_first_line(self: &Arc<Self>, task: &Arc<StreamTask>) {
        let stream = task.stream_type;
        if !self.is_current(task) || self.stopped_by_user(stream) {
            return;
        }
        debug!("Stream [{}] connected", stream);
        task.set_connected();
        self.update_state(stream, StateKind::Connected, "");
        self.begin_stale_detection(task);
    }

    fn on_stderr(&self, task: &Arc<StreamTask>, line: &str) {
        let stream = task.stream_type;
        let Some((frames, kbps)) = parse_progress(line) else {
            warn!("Stream [{}] msg: '{}'", stream, redact_token(line));
            return;
        };
        if !self.is_current(task) {
            return;
        }

        {
            let mut record = self.record.lock().unwrap();
            let progress = record.progresses.get_mut(stream);
            progress.current_fps = (frames as f64 - progress.frames as f64) / 2.0;
            progress.frames = frames;
            if let Some(kbps) = kbps {
                progress.current_kbps = kbps;
            }
        }
        task.record_frames(frames);
        self.notify_progress();
    }

    fn on_process_exit(
        self: &Arc<Self>,
        task: &Arc<StreamTask>,
        handle: &Arc<ProcessHandle>,
        outcome: Result<(), ProcessError>,
    ) {
        let stream = task.stream_type;
        task.clear_process(handle);
        {
            let mut processes = self.processes.lock().unwrap();
            if processes.get(&stream).is_some_and(|current| Arc::ptr_eq(current, handle)) {
                processes.remove(&stream);
            }
        }

        if !self.is_current(task) {
            debug!("Stream [{}] process of a replaced task exited", stream);
            return;
        }

        self.reset_task(task);
        {
            let mut record = self.record.lock().unwrap();
            let progress = record.progresses.get_mut(stream);
            progress.current_fps = 0.0;
            progress.current_kbps = 0.0;
        }

        if self.stopped_by_user(stream) {
            debug!("Stream [{}] skipping retry because stop has been clicked", stream);
            self.update_state(stream, StateKind::Disconnected, "");
            return;
        }

        match outcome {
            Ok(()) => {
                info!("Stream [{}] ended normally", stream);
                self.update_state(stream, StateKind::Stopped, "");
            }
            Err(e) => {
                let message = redact_token(&e.to_string());
                error!("Stream [{}] {}", stream, message);
                self.update_state(stream, StateKind::Error, message);
            }
        }
        self.schedule_retry(task);
    }

    /// 固定间隔后重新启动同一个 task
    fn schedule_retry(self: &Arc<Self>, task: &Arc<StreamTask>) {
        let stream = task.stream_type;
        let wait = task.restart_wait();
        info!(
            "Stream [{}] schedule connect to \"{}\" in {:?}",
            stream,
            redact_token(&task.stream_url),
            wait
        );

        let waiting = task.retry_timer.wait(wait);
        let supervisor = Arc::downgrade(self);
        let task = task.clone();

        self.timeouts.set(stream, TimeoutKind::Retry, async move {
            let fired = waiting.await;
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };

            // 等待期间用户可能点击了停止
            if !supervisor.should_continue(&task) || !fired {
                return;
            }

            info!(
                "Stream [{}] retry to connect to \"{}\"",
                stream,
                redact_token(&task.stream_url)
            );
            tokio::spawn(supervisor.start_stream(task, false));
        });
    }

    /// 周期比较帧数，停滞时强制停止进程
    fn begin_stale_detection(self: &Arc<Self>, task: &Arc<StreamTask>) {
        let stream = task.stream_type;
        let wait = self.config.monitor.stale_wait();
        let supervisor = Arc::downgrade(self);
        let task = task.clone();

        self.timeouts.set(stream, TimeoutKind::Stale, async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + wait, wait);
            loop {
                ticker.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };

                match task.check_stale() {
                    StaleCheck::NotConnected => return,
                    StaleCheck::Stale => {
                        warn!("Stream [{}] stale connection, frames stuck at {}", stream, task.frames());
                        supervisor.stop_stream(stream);
                        return;
                    }
                    StaleCheck::Baseline | StaleCheck::Advanced => {}
                }
            }
        });
    }

    fn start_snapshots(self: &Arc<Self>) {
        if !self.snapshot.is_enabled() {
            info!("Snapshots disabled");
            return;
        }

        info!("Snapshots every {:?}", self.snapshot.interval());
        let supervisor = Arc::downgrade(self);
        let is_connected = move || {
            supervisor
                .upgrade()
                .is_some_and(|s| s.state(StreamType::Ingest).kind == StateKind::Connected)
        };
        let fetcher = self.snapshot.clone();
        let events = self.events.clone();
        self.timeouts.set(
            StreamType::Ingest,
            TimeoutKind::Snapshot,
            fetcher.run(is_connected, events),
        );
    }

    /// 停止流: 置为 stopped，强制结束进程并取消 probe 重试
    ///
    /// 用户停止且没有进程可结束时直接进入 disconnected，
    /// 否则由进程的退出事件完成后续状态转换。
    pub fn stop_stream(self: &Arc<Self>, stream: StreamType) {
        self.update_state(stream, StateKind::Stopped, "");
        info!("Stream [{}] stop streaming", stream);

        let mut killed = self
            .processes
            .lock()
            .unwrap()
            .remove(&stream)
            .is_some_and(|process| process.kill());

        let stopped_by_user = self.stopped_by_user(stream);
        if let Some(task) = self.current_task(stream) {
            if let Some(process) = task.process() {
                killed |= process.kill();
            }
            task.probe_timer.cancel();
            if stopped_by_user {
                task.retry_timer.cancel();
            }
        }

        if !killed && stopped_by_user {
            self.update_state(stream, StateKind::Disconnected, "");
        }
    }

    // ---- 指令 ----

    pub async fn handle_command(self: &Arc<Self>, command: Command) {
        match command {
            Command::StartStream(start) => self.handle_start(start).await,
            Command::StopStream(stream) => {
                self.update_user_action(stream, UserAction::Stop);
                self.stop_stream(stream);
            }
            Command::CheckStates => self.notify_stream_data(),
            Command::PlayerOptions(player) => self.update_player_options(player),
        }
    }

    async fn handle_start(self: &Arc<Self>, start: StartStream) {
        let stream = start.stream_type;
        let url = match stream {
            StreamType::Ingest => start.src,
            StreamType::Repeat => start.optional_output,
        }
        .unwrap_or_default();

        self.update_user_action(stream, UserAction::Start);
        self.update_options(start.options);
        self.set_address(stream, &url);

        if let Some(current) = self.current_task(stream) {
            if current.stream_url == url && self.state(stream).kind.is_active() {
                debug!("Stream [{}] already running for this address", stream);
                return;
            }
        }

        // 先换上新 task，旧 task 的回调随之失效，再等待旧进程退出
        let task = self.new_task(stream, &url);
        let previous = self.install_task(task.clone());
        let force = previous.is_some();
        if let Some(previous) = previous {
            self.release_task(previous).await;
        }

        tokio::spawn(self.clone().start_stream(task, force));
    }

    /// 串行处理指令，直到发送端全部关闭
    pub async fn run_commands(self: Arc<Self>, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle_command(command).await;
        }
        debug!("Command channel closed");
    }

    /// 启动时按持久化状态恢复流
    pub fn restore_processes(self: &Arc<Self>) {
        let data = self.stream_data();
        self.write_player_config(&data.options.player);

        for stream in StreamType::ALL {
            let kind = data.states.get(stream).kind;
            let resumable = match stream {
                StreamType::Ingest => matches!(
                    kind,
                    StateKind::Connected | StateKind::Connecting | StateKind::Error
                ),
                StreamType::Repeat => matches!(kind, StateKind::Connected | StateKind::Connecting),
            };
            let url = self.address(stream);

            if resumable && !url.is_empty() {
                info!("Stream [{}] restoring {}", stream, redact_token(&url));
                let task = self.new_task(stream, &url);
                self.install_task(task.clone());
                tokio::spawn(self.clone().start_stream(task, true));
            } else {
                self.update_state(stream, StateKind::Disconnected, "");
            }
        }
    }

    /// 退出前结束所有进程，持久化的用户动作保持不变
    pub async fn shutdown(&self) {
        self.timeouts.clear_all();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain().map(|(_, task)| task).collect();
        let mut handles: Vec<_> = self.processes.lock().unwrap().drain().map(|(_, p)| p).collect();
        for task in &tasks {
            task.cancel_timers();
            handles.extend(task.take_process());
        }

        for handle in handles {
            info!("Stopping process [{}]", handle.name());
            handle.terminate().await;
        }
    }
}

/// probe 选中的视频和音频流序号，没有音频时为 `a`
fn selected_ids(selection: &Selection) -> (String, String) {
    let audio = selection
        .audio
        .as_ref()
        .map(|audio| audio.index.to_string())
        .unwrap_or_else(|| "a".to_string());
    (selection.video.index.to_string(), audio)
}

/// 解析 `frame=  123 fps=25 ... bitrate=1024.0kbits/s` 形式的进度行
pub fn parse_progress(line: &str) -> Option<(u64, Option<f64>)> {
    let rest = line.strip_prefix("frame=")?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let frames = rest[..end].parse().ok()?;

    let kbps = line.find("bitrate=").and_then(|pos| {
        let value = line[pos + "bitrate=".len()..].trim_start();
        let end = value.find("kbits/s")?;
        value[..end].trim().parse().ok()
    });

    Some((frames, kbps))
}
