//! Server and configuration command handlers

use crate::cli::workflow_handlers::CliContext;
use anyhow::{Context, Result};
use flowgate_core::models::{Configuration, LogLevel};
use flowgate_core::server::FlowgateServer;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

fn read_user_input_sync() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_line(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

fn prompt(label: &str, current: &str) -> Result<String> {
    print!("{} [{}]: ", label, current);
    io::stdout().flush()?;
    Ok(read_user_input_sync()?.trim().to_string())
}

/// Resolve `~/` and the default marker to a concrete config path
pub fn resolve_config_path(config_file: &str) -> Result<PathBuf> {
    if config_file.is_empty() {
        return Configuration::default_config_path()
            .map_err(|e| anyhow::anyhow!("Failed to get default config path: {}", e));
    }
    if let Some(rest) = config_file.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(config_file))
}

/// Handle the 'serve' command
pub async fn handle_serve(
    ctx: &CliContext,
    host: Option<String>,
    port: Option<u16>,
    tick_seconds: u64,
) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let host = host.unwrap_or_else(|| ctx.config.server_host.clone());
    let port = port.unwrap_or(ctx.config.server_port);
    let tick_interval = (tick_seconds > 0).then(|| Duration::from_secs(tick_seconds));

    println!("🚦 flowgate decision API on http://{}:{}", host, port);
    println!("   Store: {}", ctx.store_path.display());
    match tick_interval {
        Some(period) => println!("   Scheduler tick every {}s", period.as_secs()),
        None => println!("   Scheduler tick disabled (POST /api/v1/tick)"),
    }

    FlowgateServer::new(host, port, orchestrator)
        .with_tick_interval(tick_interval)
        .start()
        .await
}

/// Handle the 'config' command
pub async fn handle_config_init(config_file: String) -> Result<()> {
    println!("⚙️  Initializing flowgate configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = resolve_config_path(&config_file)?;
    println!("📄 Config file: {}", config_path.display());

    let mut config = if config_path.exists() {
        println!("⚠️  Configuration file already exists. Loading existing values...");
        Configuration::load_from_file(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load existing config: {}", e))?
    } else {
        println!("✨ Creating new configuration with defaults...");
        Configuration::default()
    };

    println!("\n📝 Please answer the following questions (press Enter to use default):\n");

    let store = prompt("Run store file", &config.resolved_store_path().display().to_string())?;
    if !store.is_empty() {
        config.store_path = Some(PathBuf::from(store));
    }

    let log_level = prompt(
        "Log level (error/warn/info/debug/trace)",
        match config.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        },
    )?;
    if !log_level.is_empty() {
        config.log_level = match log_level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => {
                println!("⚠️  Invalid log level, using default");
                config.log_level
            }
        };
    }

    let host = prompt("Server bind address", &config.server_host)?;
    if !host.is_empty() {
        config.server_host = host;
    }

    let port = prompt("Server port", &config.server_port.to_string())?;
    if !port.is_empty() {
        match port.parse::<u16>() {
            Ok(port) => config.server_port = port,
            Err(_) => println!("⚠️  Invalid port number, using default"),
        }
    }

    let deadline = prompt(
        "Default SLA deadline in seconds",
        &config.sla.default_deadline_seconds.to_string(),
    )?;
    if !deadline.is_empty() {
        match deadline.parse::<u64>() {
            Ok(seconds) => config.sla.default_deadline_seconds = seconds,
            Err(_) => println!("⚠️  Invalid deadline, using default"),
        }
    }

    let role = prompt("SLA escalation role", &config.sla.escalation_role)?;
    if !role.is_empty() {
        config.sla.escalation_role = role;
    }

    println!("\n🔍 Validating configuration...");
    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration is valid");
        }
        Err(errors) => {
            println!("❌ Configuration validation failed:");
            for error in &errors {
                println!("   - {}", error);
            }
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    println!("\n💾 Saving configuration to {}...", config_path.display());
    config
        .save_to_file(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to save configuration: {}", e))?;

    println!("✅ Configuration saved successfully!");
    println!("\n📋 Configuration summary:");
    println!("   Store: {}", config.resolved_store_path().display());
    println!("   Log level: {:?}", config.log_level);
    println!("   Server: {}:{}", config.server_host, config.server_port);
    println!(
        "   SLA: {}s deadline, at risk {}s before, escalates to '{}'",
        config.sla.default_deadline_seconds,
        config.sla.at_risk_window_seconds,
        config.sla.escalation_role
    );

    Ok(())
}
