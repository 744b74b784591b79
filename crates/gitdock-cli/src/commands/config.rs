//! Config command implementation.
//!
//! Manages CLI configuration.

use anyhow::Result;
use gitdock_ops::Config;

/// Show current configuration.
pub fn show(config: &Config) -> Result<()> {
    println!("gitdock Configuration");
    println!("{:-<40}", "");

    println!(
        "GitHub Token:        {}",
        if config.has_github_token() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!(
        "GitHub API:          {}",
        config.github_api_url.as_deref().unwrap_or("(default)")
    );
    println!("Data Directory:      {}", config.data_dir.display());
    println!("Clone Root:          {}", config.clone_root.display());
    println!("Timeout:             {}s", config.operation_timeout_secs);
    println!(
        "Retries:             {} ({}ms..{}ms backoff)",
        config.max_retries, config.backoff_base_ms, config.backoff_max_ms
    );
    println!("Ancestry Depth:      {} commits", config.ancestry_depth);
    println!("Remote Info TTL:     {}s", config.remote_info_ttl_secs);

    if let Some(config_path) = Config::config_file_path() {
        println!("\nConfig file: {}", config_path.display());
    }

    Ok(())
}

/// Get a configuration value.
pub fn get(config: &Config, key: &str) -> Result<()> {
    if !Config::keys().iter().any(|known| *known == key) {
        anyhow::bail!(
            "Unknown config key: {}. Valid keys: {}",
            key,
            Config::keys().join(", ")
        );
    }

    println!(
        "{}",
        config.get(key).unwrap_or_else(|| "(not set)".to_string())
    );
    Ok(())
}

/// Set a configuration value.
pub fn set(config: &mut Config, key: &str, value: &str) -> Result<()> {
    config.set(key, value)?;
    config.save()?;
    println!("✅ Set {} to: {}", key, value);
    Ok(())
}

/// Show path to config file.
pub fn path() -> Result<()> {
    match Config::config_file_path() {
        Some(path) => println!("{}", path.display()),
        None => println!("(no config file path available)"),
    }
    Ok(())
}
