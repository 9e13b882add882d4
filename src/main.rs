use anyhow::Result;

use reliable_queue::config::Settings;
use reliable_queue::telemetry::init_telemetry;
use reliable_queue::transport::create_transports;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(transports = settings.transports.len(), "Configuration loaded");

    let registry = create_transports(&settings)?;
    if registry.is_empty() {
        tracing::warn!("No transports configured");
        return Ok(());
    }

    let mut failed = 0;
    for name in registry.names() {
        let Some(transport) = registry.get(name) else {
            continue;
        };

        if let Err(e) = transport.setup().await {
            tracing::error!(transport = %name, error = %e, "Setup failed");
            failed += 1;
            continue;
        }

        match transport.count().await {
            Ok(count) => tracing::info!(transport = %name, messages = count, "Transport ready"),
            Err(e) => {
                tracing::error!(transport = %name, error = %e, "Count failed");
                failed += 1;
            }
        }

        if let Some(failover) = registry.failover(name) {
            for stats in failover.breaker_snapshot() {
                tracing::info!(
                    transport = %name,
                    backend = %stats.name,
                    state = %stats.state,
                    failures = stats.failure_count,
                    "Circuit state"
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} transports failed", registry.len());
    }

    tracing::info!(transports = registry.len(), "All transports ready");
    Ok(())
}
