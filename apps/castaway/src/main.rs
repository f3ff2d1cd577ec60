use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use castaway_client_core::config::Config;
use castaway_client_core::session::{NoticeLevel, Session};
use castaway_client_core::transport::http::HttpApi;
use castaway_client_core::transport::websocket::WebSocketConnector;

#[derive(Parser, Debug)]
#[command(name = "castaway", about = "Headless console client for a casting fleet service")]
struct Cli {
    /// Service base URL.
    #[arg(long, env = "CASTAWAY_SERVER")]
    server: Option<Url>,

    /// Write debug logs to a file instead of stderr.
    #[arg(long)]
    debug_log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = init_tracing(cli.debug_log.as_deref())?;

    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    info!(server = %config.server_url, "starting session");

    let api = Arc::new(HttpApi::new(config.server_url.clone()));
    let connector = Arc::new(
        WebSocketConnector::new(&config.server_url).context("deriving push endpoint")?,
    );
    let mut handle = Session::start(config, connector, api.clone(), api);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(notice) = handle.notices.recv() => {
                match notice.level {
                    NoticeLevel::Warning => eprintln!("! {}", notice.message),
                    NoticeLevel::Info => println!("{}", notice.message),
                }
            }
            Some(update) = handle.views.recv() => {
                info!(entity_id = %update.entity_id, kind = ?update.kind, reason = ?update.reason, "view update");
            }
        }
    }

    handle.stop().await;
    Ok(())
}

fn init_tracing(debug_log: Option<&str>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match debug_log {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating debug log {path}"))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
