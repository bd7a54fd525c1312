use anyhow::Context;
use certkeeper::acme::client::AcmeClientBuilder;
use certkeeper::acme::http::HttpClient;
use certkeeper::manager::Manager;
use certkeeper::{CRATE_NAME, cert, config};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTKEEPER_LOG";

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
struct CommandLineArguments {
    /// Path to the configuration file, created with defaults if missing
    #[arg(short, long, env = "CERTKEEPER_CONFIG", default_value = "certkeeper.toml")]
    config: PathBuf,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTKEEPER_LOG` environment variable)
    #[clap(long, short, action)]
    verbose: bool,
    /// Domains to keep certificates for, in addition to the configured ones
    domains: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "certkeeper=debug,info" } else { "info" }))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::load(&cli.config).context(format!("Loading configuration {}", cli.config.display()))?;
    let http_client = match &config.trusted_root {
        Some(root) => HttpClient::try_new_with_custom_root(cert::load_reqwest_certificate(root).await?)?,
        None => HttpClient::try_new()?,
    };
    let client = AcmeClientBuilder::new(config.acme_directory.clone())
        .with_http_client(http_client)
        .with_contact(config.contact.clone())
        .try_build()
        .await
        .context(format!("Connecting to ACME server {}", config.acme_directory))?;

    let manager = Manager::start(config.manager_settings(), client, |domains: Vec<String>| {
        info!("Certificates available for {}", domains.join(", "));
    })
    .await?;

    let mut domains = config.domains.clone();
    domains.extend(cli.domains);
    if domains.is_empty() {
        info!("No domains configured, add some to {}", cli.config.display());
    } else {
        manager.add(domains).await?;
    }

    info!("{CRATE_NAME} is running, press Ctrl-C to stop");
    let result = tokio::signal::ctrl_c().await.context("Waiting for shutdown signal");
    info!("Shutting down");
    manager.close().await;
    result
}
