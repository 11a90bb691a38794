//! Target service command handler

use anyhow::Result;
use colored::*;
use shipway_client::OrchestratorClient;

pub async fn show_service(client: &OrchestratorClient) -> Result<()> {
    let service = client.get_service().await?;

    let healthy = format!("{}/{}", service.healthy_count, service.desired_count);
    let healthy = if service.healthy_count as u32 >= service.desired_count {
        healthy.green()
    } else {
        healthy.yellow()
    };

    println!("{}", "Service:".bold());
    println!("  Name:            {}", service.service.cyan());
    println!("  Cluster:         {}", service.cluster);
    println!("  Task definition: {}", service.task_definition);
    println!("  Image:           {}", service.image);
    println!("  Healthy:         {}", healthy);
    if let Some(endpoint) = &service.endpoint {
        println!("  Endpoint:        {}", endpoint);
    }

    if !service.tasks.is_empty() {
        println!("\n{}", "Tasks:".bold());
        for task in &service.tasks {
            let health = match task.health.as_str() {
                "Healthy" => task.health.green(),
                "Unhealthy" => task.health.red(),
                _ => task.health.yellow(),
            };
            println!(
                "  {} {} rev {} {}",
                "▸".cyan(),
                task.id.dimmed(),
                task.revision,
                health
            );
        }
    }

    Ok(())
}
