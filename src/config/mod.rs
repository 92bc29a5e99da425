mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./vodrelay.toml",
        "./config.toml",
        "~/.config/vodrelay/config.toml",
        "/etc/vodrelay/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    // Return default config if no file found
    Ok(Config::default())
}

/// Give an auth-enabled config without a token a random one.
///
/// Returns the generated token so the caller can show it once.
pub fn ensure_auth_token(config: &mut Config) -> Option<String> {
    let auth = &mut config.server.auth;
    if !auth.enabled || auth.token.is_some() {
        return None;
    }
    let token = crate::server::auth::generate_token();
    auth.token = Some(token.clone());
    Some(token)
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    // Validate server config
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.server.auth.enabled && config.server.auth.token.is_none() {
        tracing::warn!("server.auth.token is not set, a random token will be generated at startup");
    }
    if config.server.auth.token.as_deref() == Some("") {
        anyhow::bail!("server.auth.token cannot be empty");
    }

    if let Some(base) = &config.server.public_base_url {
        let parsed = url::Url::parse(base)
            .with_context(|| format!("Invalid public_base_url: {}", base))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("public_base_url must be http or https: {}", base);
        }
    }

    // Validate caches
    for (name, settings) in [
        ("manifest", config.cache.manifest_settings()),
        ("requests", config.cache.request_settings()),
    ] {
        if settings.max_size == 0 {
            anyhow::bail!("cache.{}.max_size cannot be 0", name);
        }
        if settings.pressure_threshold < settings.max_size {
            tracing::warn!(
                "cache.{}.pressure_threshold ({}) is below max_size ({})",
                name,
                settings.pressure_threshold,
                settings.max_size
            );
        }
    }

    // Validate media settings
    let media = &config.media;
    if media.default_threads == 0 || media.max_threads == 0 {
        anyhow::bail!("media thread counts cannot be 0");
    }
    if media.default_threads > media.max_threads {
        tracing::warn!(
            "media.default_threads ({}) exceeds max_threads ({}), it will be clamped",
            media.default_threads,
            media.max_threads
        );
    }
    if media.default_chunk_size == 0 || media.segment_buffer == 0 {
        anyhow::bail!("media.default_chunk_size and media.segment_buffer cannot be 0");
    }

    let rc = &media.range_cache;
    if rc.chunk_size == 0 || rc.pool_size == 0 || rc.max_chunk_attempts == 0 {
        anyhow::bail!("media.range_cache chunk_size, pool_size and max_chunk_attempts must be positive");
    }
    if rc.max_disk_bytes < rc.chunk_size {
        anyhow::bail!(
            "media.range_cache.max_disk_bytes ({}) is smaller than one chunk ({})",
            rc.max_disk_bytes,
            rc.chunk_size
        );
    }
    if rc.dir.exists() && !rc.dir.is_dir() {
        anyhow::bail!("media.range_cache.dir is not a directory: {:?}", rc.dir);
    }

    // Validate sources
    let mut seen = HashSet::new();
    for source in &config.sources {
        if source.id.is_empty() {
            anyhow::bail!("Source with url '{}' has an empty id", source.url);
        }
        if !seen.insert(source.id.as_str()) {
            anyhow::bail!("Duplicate source id '{}'", source.id);
        }
        if url::Url::parse(&source.url).is_err() {
            tracing::warn!("Source '{}' has an invalid url: {}", source.id, source.url);
        }
    }

    Ok(())
}
