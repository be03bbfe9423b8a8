//! CLI command implementations.

pub mod pushes;
pub mod replay;
pub mod watch;

use anyhow::{Context, Result};
use pushbuild_config::{WorkerConfig, load_worker_config, parse_worker_config};
use std::path::Path;

pub fn load(path: &Path) -> Result<WorkerConfig> {
    load_worker_config(path).with_context(|| format!("Failed to load {}", path.display()))
}

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match parse_worker_config(&content) {
        Ok(config) => {
            println!("Configuration is valid");
            print!("{}", summary(&config));
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn summary(config: &WorkerConfig) -> String {
    let mut out = format!(
        "  worker: {} ({})\n  feed: {}\n",
        config.worker.worker_type, config.worker.instance_id, config.feed.base_url
    );
    for branch in &config.branches {
        match &branch.after {
            Some(after) => out.push_str(&format!("  branch: {} after {}\n", branch.name, after)),
            None => out.push_str(&format!("  branch: {}\n", branch.name)),
        }
    }
    match &config.notifications {
        Some(n) => out.push_str(&format!("  notifications: {}\n", n.topic)),
        None => out.push_str("  notifications: none (catch-up only)\n"),
    }
    out.push_str(&format!("  store: {}\n", config.store.path.display()));
    out
}
