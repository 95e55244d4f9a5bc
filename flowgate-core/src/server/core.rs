//! Server wiring: decision API plus the scheduler tick loop

use crate::workflow::orchestrator::WorkflowOrchestrator;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::time::{interval, Duration, MissedTickBehavior};
use warp::Filter;

/// Default period between scheduler ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// HTTP server hosting the decision API for one orchestrator
pub struct FlowgateServer {
    host: String,
    port: u16,
    orchestrator: WorkflowOrchestrator,
    tick_interval: Option<Duration>,
}

impl FlowgateServer {
    /// Create a new flowgate server
    pub fn new(host: String, port: u16, orchestrator: WorkflowOrchestrator) -> Self {
        Self {
            host,
            port,
            orchestrator,
            tick_interval: Some(DEFAULT_TICK_INTERVAL),
        }
    }

    /// Set the tick period; `None` leaves ticking to `POST /api/v1/tick`
    pub fn with_tick_interval(mut self, tick_interval: Option<Duration>) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn address(&self) -> Result<SocketAddr> {
        let address = format!("{}:{}", self.host, self.port);
        address
            .parse::<SocketAddr>()
            .context(format!("Invalid server address {}", address))
    }

    /// Start the server; runs until the process is stopped
    pub async fn start(self) -> Result<()> {
        let socket_addr = self.address()?;

        let tick_task = self.tick_interval.map(|period| {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match orchestrator.tick().await {
                        Ok(report) if report.runs_examined > 0 => {
                            tracing::debug!(?report, "scheduler tick")
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
                    }
                }
            })
        });

        let request_log = warp::log::custom(|info| {
            crate::services::logging::log_request(
                info.method().as_str(),
                info.path(),
                info.status().as_u16(),
            )
        });
        let routes = crate::server::api::create_api_routes(self.orchestrator.clone()).with(request_log);
        tracing::info!(address = %socket_addr, "decision API listening");
        warp::serve(routes).run(socket_addr).await;

        if let Some(task) = tick_task {
            task.abort();
        }
        Ok(())
    }
}
