//! ID resolver
//!
//! Resolves run id prefixes to full UUIDs by listing runs from the API, so
//! users can type `shipway runs get 3f2a` instead of the full id.

use anyhow::{Context, Result, anyhow};
use shipway_client::OrchestratorClient;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a run ID or prefix to a full UUID
///
/// # Errors
/// Returns an error if no run matches, the prefix is ambiguous, or the
/// listing fails.
pub async fn resolve_run_id(client: &OrchestratorClient, id: &IdOrPrefix) -> Result<Uuid> {
    let prefix = match id {
        IdOrPrefix::Full(uuid) => return Ok(*uuid),
        IdOrPrefix::Prefix(prefix) => prefix,
    };

    let runs = client
        .list_runs(None)
        .await
        .context("Failed to fetch runs for ID resolution")?;

    match_prefix(prefix, runs.iter().map(|run| run.id))
}

/// Picks the single id starting with `prefix`
fn match_prefix(prefix: &str, ids: impl Iterator<Item = Uuid>) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids.filter(|id| id.to_string().starts_with(prefix)).collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No run found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple runs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[test]
    fn test_unique_prefix() {
        let a = uuid("3f2a0000-0000-4000-8000-000000000001");
        let b = uuid("9c110000-0000-4000-8000-000000000002");
        assert_eq!(match_prefix("3f", [a, b].into_iter()).unwrap(), a);
    }

    #[test]
    fn test_ambiguous_prefix() {
        let a = uuid("3f2a0000-0000-4000-8000-000000000001");
        let b = uuid("3f2b0000-0000-4000-8000-000000000002");
        let err = match_prefix("3f", [a, b].into_iter()).unwrap_err();
        assert!(err.to_string().contains("Ambiguous"));
    }

    #[test]
    fn test_no_match() {
        let a = uuid("3f2a0000-0000-4000-8000-000000000001");
        assert!(match_prefix("ff", [a].into_iter()).is_err());
    }
}
