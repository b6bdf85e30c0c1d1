use std::sync::Arc;

use chrono::Local;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;

use whatsapp_edge_worker::config::Config;
use whatsapp_edge_worker::edge::EdgeClient;
use whatsapp_edge_worker::health;
use whatsapp_edge_worker::manager::InstanceManager;
use whatsapp_edge_worker::wa::SocketFactory;
use whatsapp_edge_worker::wa::loopback::LoopbackFactory;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let exit_code = rt.block_on(run());
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let cfg = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("configuration error: {e}");
            return 1;
        }
    };

    let http = match reqwest::Client::builder().timeout(cfg.http_timeout).build() {
        Ok(http) => http,
        Err(e) => {
            error!("failed to build HTTP client: {e}");
            return 1;
        }
    };
    let edge = Arc::new(EdgeClient::new(
        http.clone(),
        cfg.edge_base_url.clone(),
        cfg.worker_secret.clone(),
    ));

    let listener = match TcpListener::bind(("0.0.0.0", cfg.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind liveness port {}: {e}", cfg.port);
            return 1;
        }
    };
    let health_shutdown = Arc::new(Notify::new());
    let health_task = tokio::spawn(health::serve(listener, Arc::clone(&health_shutdown)));

    let factory: Arc<dyn SocketFactory> = match cfg.wa_backend.as_str() {
        "loopback" => LoopbackFactory::new(),
        other => {
            error!("unknown WA_BACKEND {other:?} (expected \"loopback\")");
            return 1;
        }
    };

    info!("starting worker against {}", cfg.edge_base_url);
    let manager = InstanceManager::new(Arc::clone(&cfg), edge, http, factory);
    let mut manager_task = tokio::spawn(Arc::clone(&manager).run());

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            manager.shutdown().await;
            return 1;
        }
    };

    let mut exit_code = 0;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
        }
        result = &mut manager_task => {
            // The discovery loop only ends on shutdown; anything else is a
            // fatal fault.
            match result {
                Ok(()) => error!("manager loop ended unexpectedly"),
                Err(e) => error!("manager task failed: {e}"),
            }
            exit_code = 1;
        }
    }

    manager.shutdown().await;
    manager_task.abort();
    health_shutdown.notify_one();
    if let Ok(Err(e)) = health_task.await {
        error!("liveness server error: {e}");
    }
    info!("worker exited");
    exit_code
}
