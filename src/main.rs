//! Tunnelgate CLI - a forward HTTP/HTTPS proxy with SSH, SOCKS and relay upstreams

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tunnelgate::{Config, GeneratedCa, ProxyServer};

#[derive(Parser)]
#[command(name = "tunnelgate")]
#[command(about = "A forward HTTP/HTTPS proxy with SSH, SOCKS and relay upstreams")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Upstream URL: ssh://, socks5:// or http(s):// relay (overrides config)
        #[arg(short, long)]
        remote: Option<String>,

        /// Path to CA certificate (overrides config)
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Path to CA private key (overrides config)
        #[arg(long)]
        ca_key: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace); defaults to the config's
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Generate a new CA certificate
    GenerateCa {
        /// Output directory for ca.crt and ca.key
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Certificate filename
        #[arg(long, default_value = "ca.crt")]
        cert_name: String,

        /// Key filename
        #[arg(long, default_value = "ca.key")]
        key_name: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bind,
            remote,
            ca_cert,
            ca_key,
            log_level,
        } => {
            // Load config before logging so its level can apply
            let mut cfg = match config {
                Some(ref config_path) => Config::from_file(config_path)?,
                None => Config::default(),
            };

            let level = log_level.unwrap_or_else(|| cfg.logging.level.clone());
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            match config {
                Some(ref path) => tracing::info!(path = %path.display(), "Loaded configuration"),
                None => tracing::info!("Using default configuration"),
            }

            // Apply CLI overrides
            if let Some(addr) = bind {
                cfg.proxy.bind_address = addr;
            }
            if let Some(remote) = remote {
                cfg.proxy.remote = Some(remote);
            }
            if let Some(cert) = ca_cert {
                cfg.tls.ca_cert = Some(cert.to_string_lossy().to_string());
            }
            if let Some(key) = ca_key {
                cfg.tls.ca_key = Some(key.to_string_lossy().to_string());
            }
            cfg.validate()?;

            let server = ProxyServer::new(cfg)?;

            tracing::info!("Starting proxy server...");
            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTP_PROXY=http://{}", server.bind_address());
            tracing::info!("  export HTTPS_PROXY=http://{}", server.bind_address());

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::GenerateCa {
            out,
            cert_name,
            key_name,
        } => {
            std::fs::create_dir_all(&out)?;

            let cert_path = out.join(&cert_name);
            let key_path = out.join(&key_name);

            println!("Generating CA certificate...");

            let ca = GeneratedCa::generate()?;
            ca.save(&cert_path, &key_path)?;

            println!("CA certificate generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!("  Private key: {}", key_path.display());
            println!();
            println!("To use with the proxy:");
            println!(
                "  tunnelgate run --ca-cert {} --ca-key {}",
                cert_path.display(),
                key_path.display()
            );
            println!();
            println!("Clients must trust the certificate for intercepted HTTPS.");
            println!("IMPORTANT: Keep the private key secure!");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind address: {}", cfg.proxy.bind_address);
            println!("  Mode: {:?}", cfg.proxy.mode);
            println!(
                "  Remote: {}",
                cfg.proxy.remote.as_deref().unwrap_or("(none)")
            );
            println!(
                "  CA cert: {}",
                cfg.tls.ca_cert.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  Certificate store: {}",
                cfg.tls.certs_dir.as_deref().unwrap_or("memory only")
            );
            println!("  Key policy: {:?}", cfg.tls.key_policy);
            println!("  Log level: {}", cfg.logging.level);
            println!(
                "  Audit log: {}",
                cfg.logging.audit_log.as_deref().unwrap_or("disabled")
            );
            println!("  Blocked hosts: {}", cfg.blocked.len());
            for host in &cfg.blocked {
                println!("    - {}", host);
            }
        }
    }

    Ok(())
}
