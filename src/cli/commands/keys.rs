use std::path::PathBuf;

use console::style;
use serde::Serialize;

use super::print_json;
use crate::config::AppConfig;
use crate::error::Result;
use crate::ssh::{key_fingerprint, KeyPair, KeyStore};

#[derive(Serialize)]
struct KeyInfo {
    path: String,
    fingerprint: String,
    public_key: String,
}

pub fn keygen(config: &AppConfig, force: bool, json: bool) -> Result<()> {
    let store = KeyStore::open(config.data_path())?;

    if force {
        let pair = KeyPair::generate()?;
        store.backup()?;
        store.install(&pair)?;
        if !json {
            println!(
                "{} Replaced managed key (previous key kept as {}.old)",
                style("✓").green().bold(),
                store.private_key_path().display()
            );
        }
    }

    let info = KeyInfo {
        path: store.private_key_path().display().to_string(),
        fingerprint: store.fingerprint(),
        public_key: store.public_key(),
    };

    if json {
        return print_json(&info);
    }

    println!("{}", style("Managed SSH key").bold().cyan());
    println!();
    println!("  Path:        {}", style(&info.path).dim());
    println!("  Fingerprint: {}", style(&info.fingerprint).white());
    println!("  Public key:  {}", style(&info.public_key).dim());
    Ok(())
}

pub fn fingerprint(config: &AppConfig, path: Option<PathBuf>, json: bool) -> Result<()> {
    let (path, fingerprint) = match path {
        Some(path) => {
            let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
            let fingerprint = key_fingerprint(&expanded)?;
            (expanded, fingerprint)
        }
        None => {
            let store = KeyStore::open(config.data_path())?;
            (store.private_key_path(), store.fingerprint())
        }
    };

    if json {
        return print_json(&serde_json::json!({
            "path": path.display().to_string(),
            "fingerprint": fingerprint,
        }));
    }

    println!("{}  {}", style(&fingerprint).white(), style(path.display()).dim());
    Ok(())
}
