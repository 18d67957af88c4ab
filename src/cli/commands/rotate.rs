use console::style;
use tokio_util::sync::CancellationToken;

use super::print_json;
use crate::app::AgentLink;
use crate::config::AppConfig;
use crate::error::Result;
use crate::rotation::RotationResult;

pub async fn execute(config: &AppConfig, instances: Vec<String>, json: bool) -> Result<()> {
    let link = AgentLink::new(config.clone())?;
    let token = CancellationToken::new();

    // connected instances join the rotation; the rest are still listed
    for instance in &instances {
        if let Err(e) = link.ensure_connected(&token, instance).await {
            tracing::warn!("Could not connect to {} before rotating: {}", instance, e);
        }
    }

    let result = link.rotate_keys(&instances).await;
    link.shutdown().await;
    let result = result?;

    if json {
        return print_json(&result);
    }

    print_result(&result);
    Ok(())
}

fn print_result(result: &RotationResult) {
    let headline = if result.full_success {
        style("Key rotation complete").green().bold()
    } else {
        style("Key rotation incomplete").yellow().bold()
    };
    println!("{}", headline);
    println!();
    println!("  Old key: {}", style(&result.old_fingerprint).dim());
    println!("  New key: {}", style(&result.new_fingerprint).white());
    println!();

    for status in &result.instances {
        let icon = if status.finalized {
            style("[x]").green()
        } else if status.verified {
            style("[~]").yellow()
        } else {
            style("[ ]").red()
        };
        print!("    {} {}", icon, status.instance_id);
        match &status.error {
            Some(error) => println!("  {}", style(error).dim()),
            None => println!(),
        }
    }

    if !result.full_success {
        println!();
        println!(
            "  {}",
            style("The previous key was kept as a backup; instances marked [~] accept both keys.").dim()
        );
    }
}
