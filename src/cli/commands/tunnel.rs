use console::style;
use tokio_util::sync::CancellationToken;

use super::print_json;
use crate::app::AgentLink;
use crate::config::AppConfig;
use crate::error::{LinkError, Result};

pub async fn execute(
    config: &AppConfig,
    instance: &str,
    label: &str,
    remote_port: u16,
    local_port: Option<u16>,
    json: bool,
) -> Result<()> {
    let link = AgentLink::new(config.clone())?;
    link.start();

    let token = CancellationToken::new();
    let bound = tokio::select! {
        _ = tokio::signal::ctrl_c() => Err(LinkError::Cancelled),
        bound = link.create_tunnel(&token, instance, label, remote_port, local_port) => bound,
    };
    let local_port = match bound {
        Ok(port) => port,
        Err(e) => {
            link.shutdown().await;
            return Err(e);
        }
    };

    if json {
        print_json(&link.list_tunnels(instance))?;
    } else {
        println!("  {}", style("╭──────────────────────────────────────────────────────────╮").dim());
        println!(
            "  {}  {:<56} {}",
            style("│").dim(),
            style(format!("Tunnel '{}' on {}", label, instance)).cyan(),
            style("│").dim()
        );
        let tunnel_str = format!("localhost:{} → {}:{}", local_port, instance, remote_port);
        println!("  {}  {:<56} {}", style("│").dim(), tunnel_str, style("│").dim());
        println!("  {}", style("╰──────────────────────────────────────────────────────────╯").dim());
        println!();
        println!("  {}", style("Press Ctrl+C to close").dim());
    }

    tokio::signal::ctrl_c().await?;

    if !json {
        if let Some(metrics) = link.tunnel_metrics(instance).get(label) {
            println!(
                "\n  {} relayed {} connections, {} reconnections",
                style("✓").green().bold(),
                metrics.relayed_connections,
                metrics.reconnections
            );
        }
    }

    link.shutdown().await;
    Ok(())
}
