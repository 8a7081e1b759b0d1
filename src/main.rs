use anyhow::{Context, Result};
use clap::Parser;
use ldap_gal_gateway::mapper::AttributeMapper;
use ldap_gal_gateway::search::SearchContext;
use ldap_gal_gateway::{run_metrics_server, Config, GalServer, MemoryDirectory, Metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ldap-gal-gateway")]
#[command(about = "LDAP gateway serving a Global Address List and personal contacts to mail clients")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_gal_gateway={},info", log_level))
        .init();

    info!("Starting LDAP GAL gateway");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {}", path.display());
            Config::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => {
            warn!("No configuration file given, serving an empty directory");
            Config::default()
        }
    };
    if let Some(listen) = args.listen {
        config.listen.url = listen;
    }
    info!("Listen URL: {}", config.listen.url);

    let mapper = Arc::new(AttributeMapper::default());
    let directory = MemoryDirectory::new(&config.users, Arc::clone(&mapper));
    if directory.is_empty() {
        warn!("Directory has no users; only anonymous binds will succeed");
    }
    let metrics = Arc::new(Metrics::new());
    let context = Arc::new(SearchContext {
        directory: Arc::new(directory),
        mapper,
        metrics: Arc::clone(&metrics),
    });

    let server = Arc::new(GalServer::new(
        config.listen.url.clone(),
        config.host_name.clone(),
        config.search.max_size_limit,
        context,
    ));

    if let Some(addr) = config.metrics_listen.clone() {
        let searches = server.searches();
        let active_searches: Arc<dyn Fn() -> usize + Send + Sync> = Arc::new(move || searches.active_count());
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics, active_searches).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    server.start().await?;

    Ok(())
}
