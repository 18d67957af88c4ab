use console::style;

use super::print_json;
use crate::config::{format_duration, AppConfig};
use crate::error::Result;

pub fn show(json: bool) -> Result<()> {
    let config = AppConfig::load()?;

    if json {
        return print_json(&config);
    }

    let config_path = AppConfig::config_path()?;
    println!("{}", style("Current Configuration").bold().cyan());
    println!();
    println!("  Data dir:        {}", style(config.data_path().display()).dim());
    println!("  SSH user:        {}", style(&config.ssh.user).white());
    println!("  Host keys:       {}", style(format!("{:?}", config.ssh.host_key_policy)).white());
    println!(
        "  Keepalive:       {}",
        style(format_duration(config.pool.keepalive_interval)).yellow()
    );
    println!(
        "  Tunnel checks:   {}",
        style(format_duration(config.tunnel.health_interval)).yellow()
    );
    println!(
        "  Rate limit:      {} per {}",
        style(config.rate_limit.max_attempts).white(),
        style(format_duration(config.rate_limit.window)).white()
    );
    print!("  Key rotation:    ");
    match config.rotation.interval {
        Some(interval) => println!("{}", style(format!("every {}", format_duration(interval))).white()),
        None => println!("{}", style("(manual)").dim()),
    }
    println!(
        "  Orchestrator:    {}",
        style(format!("{:?}", config.orchestrator.kind).to_lowercase()).white()
    );
    println!();

    if config_path.exists() {
        println!("Config file: {}", style(config_path.display()).dim());
    } else {
        println!(
            "{} {}",
            style("No config file, using defaults. Expected at").dim(),
            style(config_path.display()).dim()
        );
    }

    Ok(())
}

pub fn path() -> Result<()> {
    println!("{}", AppConfig::config_path()?.display());
    Ok(())
}
