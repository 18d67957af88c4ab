use std::path::PathBuf;

use console::style;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::print_json;
use crate::app::AgentLink;
use crate::config::AppConfig;
use crate::error::Result;
use crate::events::ConnectionEvent;
use crate::pool::{ConnectionMetrics, CredentialRef};
use crate::state::ConnectionState;

#[derive(Serialize)]
struct ConnectReport {
    instance: String,
    state: ConnectionState,
    healthy: bool,
    host_key: Option<String>,
    error: Option<String>,
    metrics: Option<ConnectionMetrics>,
    events: Vec<ConnectionEvent>,
}

pub async fn execute(
    config: &AppConfig,
    instance: &str,
    host: Option<String>,
    port: u16,
    key: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let link = AgentLink::new(config.clone())?;
    let token = CancellationToken::new();

    let connected = match host {
        Some(host) => {
            let credential = key.map(CredentialRef::KeyFile).unwrap_or_default();
            link.connect(&token, instance, &host, port, credential).await
        }
        None => link.ensure_connected(&token, instance).await,
    };

    let result = match connected {
        Ok(_) => link.pool().health_check(instance).await,
        Err(e) => Err(e),
    };

    let report = ConnectReport {
        instance: instance.to_string(),
        state: link.state(instance),
        healthy: result.is_ok(),
        host_key: link.pool().host_keys().known(instance),
        error: result.as_ref().err().map(|e| e.to_string()),
        metrics: link.metrics(instance),
        events: link.events(instance),
    };
    link.shutdown().await;

    if json {
        print_json(&report)?;
        return result;
    }

    print_report(&report);
    result
}

fn print_report(report: &ConnectReport) {
    let status = if report.healthy {
        style("healthy").green().bold()
    } else {
        style("unhealthy").red().bold()
    };

    println!(
        "  {} {} {}",
        style("→").bold(),
        style(&report.instance).white().bold(),
        status
    );
    println!("  State: {}", style(report.state).cyan());
    if let Some(host_key) = &report.host_key {
        println!("  Host key: {}", style(host_key).dim());
    }

    if let Some(error) = &report.error {
        println!("  Error: {}", style(error).red());
    }

    if let Some(metrics) = &report.metrics {
        println!(
            "  Connected at: {}",
            style(metrics.connected_at.format("%Y-%m-%d %H:%M:%S UTC")).dim()
        );
    }

    if !report.events.is_empty() {
        println!();
        println!("  {}", style("Events").dim().bold());
        for event in &report.events {
            println!(
                "    {} {:<20} {}",
                style(event.timestamp.format("%H:%M:%S")).dim(),
                event.event_type.to_string(),
                style(&event.details).dim()
            );
        }
    }
}
