use anyhow::{Context, Result};
use clap::Parser;
use ldap_ad_sim::{tls, AppConfig, LdapServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Parser)]
#[command(name = "ldap-ad-sim")]
#[command(about = "Simulated Active Directory LDAP server - Answers AD-style bind and search requests from a flat JSON user database")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_ad_sim={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Load configuration from {}", args.config.display()))?;

    info!("Configuration loaded:");
    info!("  Domain: {}", config.configuration.domain);
    info!("  Port: {}", config.configuration.effective_port());
    info!("  TLS: {}", config.configuration.use_tls);

    let tls_acceptor = if config.configuration.use_tls {
        tls::validate_tls_files(&config.configuration.crt_file, &config.configuration.key_file)?;
        let server_config = tls::load_server_config(
            &config.configuration.crt_file,
            &config.configuration.key_file,
        )?;
        Some(TlsAcceptor::from(server_config))
    } else {
        None
    };

    let server = LdapServer::new(Arc::new(config), tls_acceptor);
    server.start().await
}
