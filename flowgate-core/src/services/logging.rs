//! Logging service

use crate::models::LogLevel;

/// Env-filter directive for `level`, scoped to this crate family
pub fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "flowgate=error,flowgate_core=error",
        LogLevel::Warn => "flowgate=warn,flowgate_core=warn",
        LogLevel::Info => "flowgate=info,flowgate_core=info",
        LogLevel::Debug => "flowgate=debug,flowgate_core=debug",
        LogLevel::Trace => "flowgate=trace,flowgate_core=trace",
    }
}

/// Initialize logging with the specified level
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_directive(level))
        .with_writer(std::io::stderr)
        .try_init()?;

    Ok(())
}

/// Log an API request
pub fn log_request(method: &str, path: &str, status: u16) {
    tracing::info!(method = method, path = path, status = status, "API request");
}

/// Log a decision made by a human actor
pub fn log_decision(run_id: &str, state: &str, actor: &str, decision: &str) {
    tracing::info!(
        run_id = run_id,
        state = state,
        actor = actor,
        decision = decision,
        "Decision recorded"
    );
}

/// Log a system error
pub fn log_error(error: &str, context: Option<&str>) {
    tracing::error!(
        error = error,
        context = context.unwrap_or(""),
        "System error occurred"
    );
}
