use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use heval_server::config::{self, ServerConfig};
use heval_server::http::HttpServer;
use heval_server::service::EvaluationService;

#[derive(Parser)]
#[command(name = "heval-server", about = "Encrypted model evaluation server")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = config::DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Worker threads (defaults to available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Directory holding `{name}-{version}.json` parameter files
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Model manifest (defaults to `<data-dir>/manifest.json`)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Largest accepted request body in bytes
    #[arg(long, default_value_t = config::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = ServerConfig {
        listen: cli.listen,
        workers: cli.workers.unwrap_or_else(config::default_workers),
        max_body_bytes: cli.max_body_bytes,
        data_dir: cli.data_dir,
        manifest: cli.manifest,
    };

    let registry = config.load_registry()?;
    if registry.is_empty() {
        log::warn!("manifest {} lists no models", config.manifest_path().display());
    }
    let service = EvaluationService::new(Arc::new(registry));

    let server = HttpServer::new(&config.listen.to_string())?
        .with_max_body_bytes(config.max_body_bytes);
    eprintln!(
        "heval-server listening on {} ({} models)",
        config.listen,
        service.list_models().len()
    );
    server.serve(&service, config.workers);
    Ok(())
}
