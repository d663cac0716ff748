mod config;
mod engine;
mod nginx;
mod notify;
mod probe;
mod snapshot;
mod state;
mod store;
mod supervisor;
mod task;
mod template;
#[cfg(all(test, unix))]
mod testutil;
mod timeouts;
mod timer;
mod web;

use clap::Parser;
use config::{AppConfig, Environment};
use nginx::Nginx;
use notify::EventBus;
use std::sync::Arc;
use store::JsonStore;
use supervisor::Supervisor;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use web::AppState;

/// VTX Restreamer - Live Stream Supervisor
/// 解析命令行参数，加载配置与持久化状态，启动 HTTP 服务、nginx 及两路转推
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "restreamer.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = Environment::from_env();

    // 初始化日志系统，RS_DEBUG 打开调试级别
    let level = if env.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!("VTX Restreamer initialized. HLS Root: {}", config.server.hls_root);

    // 读取持久化状态，文件缺失或无效时写入默认结构
    let store = JsonStore::new(config.server.db_path.clone());
    let data = store.load(&env)?;

    let events = Arc::new(EventBus::default());
    let supervisor = Supervisor::new(config.clone(), env.clone(), store, data, events.clone());

    // 指令串行进入 supervisor
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(supervisor.clone().run_commands(rx));

    let state = Arc::new(AppState {
        config: config.clone(),
        supervisor: supervisor.clone(),
        events,
        commands: tx,
    });
    let app = web::router(state);

    // 监听失败直接退出
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;

    // nginx 就绪后才恢复上次的流
    let boot = supervisor.clone();
    let nginx_config = config.nginx.clone();
    let use_ssl = env.https;
    tokio::spawn(async move {
        if nginx_config.managed {
            if let Err(e) = Nginx::new(nginx_config, use_ssl).start().await {
                error!("Error starting nginx: {:#}", e);
                return;
            }
        }
        boot.restore_processes();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 结束所有转码进程，用户动作保持不变以便下次启动恢复
    supervisor.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
