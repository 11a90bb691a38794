//! Grant command handler

use anyhow::Result;
use colored::*;
use shipway_client::OrchestratorClient;

pub async fn list_grants(client: &OrchestratorClient) -> Result<()> {
    let grants = client.list_grants().await?;

    if grants.is_empty() {
        println!("{}", "No grants established.".yellow());
        return Ok(());
    }

    println!("{}", format!("{} grant(s):", grants.len()).bold());
    for grant in grants {
        let permissions: Vec<String> = grant.permissions.iter().map(|p| p.to_string()).collect();
        println!(
            "  {} {} on {}: {}",
            "▸".cyan(),
            grant.principal.to_string().bold(),
            grant.resource,
            permissions.join(", ").green()
        );
    }

    Ok(())
}
