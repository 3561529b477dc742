use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::auth::TokenStore;
use crate::client::ApiClient;
use crate::config::ApiConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub timestamp: String,
    pub database_connected: bool,
    pub version: String,
}

impl HealthCheck {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy" && self.database_connected
    }
}

pub fn health(client: &ApiClient) -> Result<HealthCheck> {
    client.get("health", "health check")
}

#[derive(Args, Debug)]
#[command(about = "Check that the backend and its database are reachable")]
pub struct HealthArgs {
    #[arg(long)]
    json: bool,
}

pub fn execute(args: HealthArgs) -> Result<()> {
    let config = ApiConfig::from_env();
    let base_url = config.base_url.clone();
    let client = ApiClient::new(config, TokenStore::from_env()?)?;
    let check = health(&client)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&check)?);
    } else {
        let marker = if check.is_healthy() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("{} {} ({})", marker, check.status.bold(), base_url);
        println!(
            "  Database: {}",
            if check.database_connected {
                "connected".green()
            } else {
                "unreachable".red()
            }
        );
        println!("  Version:  {}", check.version);
    }

    if !check.is_healthy() {
        anyhow::bail!("Backend reported status {}", check.status);
    }
    Ok(())
}
