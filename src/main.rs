/// Funnelway: queue-driven execution engine for marketing and sales funnels
///
/// Main entry point for the Funnelway server. Initializes configuration and
/// starts the HTTP server, the queue workers and the trigger scheduler.

use funnelway::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Funnel activation at /api/funnels
/// - Execution inspection and cancellation at /api/executions/*
/// - Trigger control and webhook intake at /api/triggers/* and /webhook/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 with in-memory execution storage
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
