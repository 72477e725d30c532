mod aggregator;
mod collectors;
mod config;
mod http;
mod metrics;
mod report;
mod runner;

use aggregator::Aggregator;
use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use runner::ProcessRunner;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nodestatd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let Some(secret_key) = cfg.resolve_secret_key() else {
        error!(
            env = %cfg.auth.secret_key_env,
            "не найден секретный ключ: задайте переменную окружения или auth.secret_key в config"
        );
        std::process::exit(1);
    };

    for warning in cfg.warnings() {
        warn!("{warning}");
    }

    info!(
        listen = %cfg.listen,
        gc_log = %cfg.gc.log_path.display(),
        disk_mount = %cfg.disk.mount_point,
        "запуск nodestatd"
    );
    for repo in &cfg.repositories {
        info!(
            role = %repo.role,
            path = %repo.path.display(),
            risk_tier = ?repo.risk_tier,
            monitor_size = repo.monitor_size,
            monitor_blocks = repo.monitor_blocks,
            monitor_pins = repo.monitor_pins,
            "репозиторий"
        );
    }

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let aggregator = Arc::new(Aggregator::from_config(&cfg, Arc::new(ProcessRunner)));
    let app = http::build_router(metrics, aggregator, secret_key);

    let addr: SocketAddr = match cfg.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
            std::process::exit(1);
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            error!(error = %err, "не удалось запустить HTTP-сервер");
            std::process::exit(1);
        }
    };

    let server = serve(listener, app).with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
        }
        info!("получен Ctrl+C, выполняется остановка");
    });

    if let Err(err) = server.await {
        error!(error = %err, "ошибка HTTP-сервера");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
