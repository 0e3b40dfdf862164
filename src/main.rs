use clap::Parser;
use prometheus::Registry;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use certexporter::config::{Cli, Config, DEFAULT_CONFIG_FILE};
use certexporter::metrics::{CertificateCollector, MetricSchema};
use certexporter::scraper::Scraper;
use certexporter::server::{self, AppState};
use certexporter::source::{KubeSecretSource, SecretSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    if cli.print_example_config {
        println!("{}", Config::example_toml());
        return Ok(());
    }

    let file_config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Config::from_file(DEFAULT_CONFIG_FILE)?,
        None => Config::default(),
    };
    let settings = file_config
        .merge_with(Config::from_cli_args(&cli))
        .resolve()?;

    certexporter::log::init_tracing(settings.log_format)?;

    let source: Arc<dyn SecretSource> =
        Arc::new(KubeSecretSource::connect(settings.kubeconfig.as_deref()).await?);
    let schema = MetricSchema::new(&settings.metric_namespace)
        .map_err(|e| format!("invalid metric namespace: {}", e))?;
    let collector = CertificateCollector::new(schema, Scraper::new(settings.scrape.clone(), source));
    for desc in collector.describe() {
        info!(metric = %desc.fq_name, labels = ?desc.variable_labels, "Registered metric");
    }

    let registry = Registry::new();
    #[cfg(target_os = "linux")]
    registry
        .register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))
        .map_err(|e| format!("failed to register process collector: {}", e))?;

    let state = Arc::new(AppState {
        collector,
        registry,
        exit_on_scrape_error: settings.exit_on_scrape_error,
    });

    let listener = TcpListener::bind(settings.listen.as_str()).await?;
    let address = listener.local_addr()?;
    info!(
        %address,
        namespaces = ?settings.scrape.namespaces,
        label_selector = %settings.scrape.label_selector,
        "Listening on {}",
        address
    );

    tokio::select! {
        result = server::serve(listener, state) => result?,
        _ = shutdown_signal() => info!("Received SIGTERM, exiting..."),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
