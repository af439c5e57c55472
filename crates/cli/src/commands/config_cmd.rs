//! `toolwright config`: Configuration management commands.

use std::path::{Path, PathBuf};

use toolwright_config::RuntimeConfig;
use toolwright_engine::ToolCallEngineKind;

use super::load_config;

fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| RuntimeConfig::config_dir().join("config.toml"))
}

/// Settings that load fine but will be replaced by a fallback at startup.
fn fallback_warnings(config: &RuntimeConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.engine.kind.parse::<ToolCallEngineKind>().is_err() {
        warnings.push(format!(
            "Unknown engine '{}', the native engine will be used",
            config.engine.kind
        ));
    }
    let strategy = config.planner.strategy.to_ascii_lowercase().replace(['-', '_', ' '], "");
    if config.planner.enabled && strategy != "default" && strategy != "sequentialthinking" {
        warnings.push(format!(
            "Planner strategy '{}' is not built in; it must be registered in code or the default strategy will be used",
            config.planner.strategy
        ));
    }
    warnings
}

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating {}...", config_path(path).display());

    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   Config parsed successfully");

    let warnings = fallback_warnings(&config);
    if warnings.is_empty() {
        println!("   All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   warning: {w}");
        }
    }

    println!();
    println!("   Model:       {}", config.model);
    println!("   Engine:      {}", config.engine.kind);
    println!(
        "   Planner:     {}",
        if config.planner.enabled { config.planner.strategy.as_str() } else { "disabled" }
    );
    println!("   Iterations:  {}", config.max_iterations);
    println!("   Dispatch:    {:?}", config.tools.dispatch);
    Ok(())
}

pub async fn show(path: Option<&Path>, default: bool) -> Result<(), Box<dyn std::error::Error>> {
    if default {
        println!("{}", RuntimeConfig::default_toml());
        return Ok(());
    }
    let config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path(path).display());
    Ok(())
}
