mod cli;

use vodrelay::{config, server};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    // Load config
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(token) = config::ensure_auth_token(&mut config) {
        tracing::warn!(
            token = %token,
            "No auth token configured, generated one for this run. Set server.auth.token to keep it stable"
        );
    }
    config::validate_config(&config)?;

    tracing::info!("Starting vodrelay");
    tracing::info!(
        "Server will listen on {}:{} (media mode: {})",
        config.server.host,
        config.server.port,
        config.media.mode
    );
    if !config.server.auth.enabled {
        tracing::warn!("Authentication is disabled by server.auth.enabled = false, anyone can use this proxy");
    }

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vodrelay=trace,vodrelay_common=debug,tower_http=debug".to_string()
        } else {
            "vodrelay=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            // Create tokio runtime
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("vodrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::GenerateToken => {
            println!("{}", server::auth::generate_token());
            Ok(())
        }
    }
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };
    config::validate_config(&config)?;

    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Auth enabled: {}", config.server.auth.enabled);
    if config.server.auth.enabled && config.server.auth.token.is_none() {
        println!("  Auth token: not set, one will be generated at startup");
    }
    println!("  Media mode: {}", config.media.mode);
    println!(
        "  Threads: default {}, max {}",
        config.media.default_threads, config.media.max_threads
    );
    if config.media.mode == config::MediaMode::Disk {
        println!("  Chunk dir: {:?}", config.media.range_cache.dir);
    }
    println!("  Sources: {}", config.sources.len());
    Ok(())
}
