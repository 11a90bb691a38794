//! Stage domain types
//!
//! A pipeline is a fixed, ordered list of stage definitions. The layout is
//! validated once when the pipeline is constructed and never changes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Executor a stage invokes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    Source,
    Build,
    Deploy,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Source => write!(f, "Source"),
            StageKind::Build => write!(f, "Build"),
            StageKind::Deploy => write!(f, "Deploy"),
        }
    }
}

/// Static definition of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub ordinal: usize,
    pub kind: StageKind,
    /// Logical names of artifacts consumed by this stage
    pub inputs: Vec<String>,
    /// Logical name of the artifact this stage produces, if any
    pub output: Option<String>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, ordinal: usize, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind,
            inputs: Vec::new(),
            output: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Concrete artifact name for a logical artifact and commit, e.g. `src:abc123`
pub fn artifact_name(logical: &str, commit_id: &str) -> String {
    format!("{}:{}", logical, commit_id)
}

/// Errors detected while validating a stage layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageLayoutError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("stage '{name}' has ordinal {found}, expected {expected}")]
    OrdinalGap {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("stage '{stage}' requires artifact '{input}' which no earlier stage produces")]
    UnresolvedInput { stage: String, input: String },

    #[error("artifact '{0}' is produced by more than one stage")]
    DuplicateOutput(String),
}

/// Validated, ordinal-sorted list of stage definitions
#[derive(Debug, Clone, Serialize)]
pub struct StageLayout {
    stages: Vec<StageDefinition>,
}

impl StageLayout {
    /// Validates and sorts the given stages
    ///
    /// Ordinals must form `0..n` with no gaps or duplicates, and every input
    /// must be the output of a strictly earlier stage.
    pub fn new(mut stages: Vec<StageDefinition>) -> Result<Self, StageLayoutError> {
        if stages.is_empty() {
            return Err(StageLayoutError::Empty);
        }

        stages.sort_by_key(|s| s.ordinal);

        let mut produced = HashSet::new();
        for (expected, stage) in stages.iter().enumerate() {
            if stage.ordinal != expected {
                return Err(StageLayoutError::OrdinalGap {
                    name: stage.name.clone(),
                    expected,
                    found: stage.ordinal,
                });
            }

            for input in &stage.inputs {
                if !produced.contains(input.as_str()) {
                    return Err(StageLayoutError::UnresolvedInput {
                        stage: stage.name.clone(),
                        input: input.clone(),
                    });
                }
            }

            if let Some(output) = &stage.output {
                if !produced.insert(output.as_str()) {
                    return Err(StageLayoutError::DuplicateOutput(output.clone()));
                }
            }
        }

        Ok(Self { stages })
    }

    /// The Source → Build → Deploy layout
    pub fn standard() -> Self {
        Self {
            stages: vec![
                StageDefinition::new("SourceStage", 0, StageKind::Source).with_output("src"),
                StageDefinition::new("BuildStage", 1, StageKind::Build)
                    .with_input("src")
                    .with_output("build"),
                StageDefinition::new("DeployStage", 2, StageKind::Deploy).with_input("build"),
            ],
        }
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_layout_is_valid() {
        let standard = StageLayout::standard();
        let validated = StageLayout::new(standard.stages().to_vec()).unwrap();
        assert_eq!(validated.len(), 3);
        assert_eq!(validated.stages()[1].kind, StageKind::Build);
    }

    #[test]
    fn test_layout_sorts_by_ordinal() {
        let layout = StageLayout::new(vec![
            StageDefinition::new("Deploy", 1, StageKind::Deploy).with_input("src"),
            StageDefinition::new("Source", 0, StageKind::Source).with_output("src"),
        ])
        .unwrap();
        assert_eq!(layout.stages()[0].name, "Source");
    }

    #[test]
    fn test_layout_rejects_gaps() {
        let result = StageLayout::new(vec![
            StageDefinition::new("Source", 0, StageKind::Source).with_output("src"),
            StageDefinition::new("Build", 2, StageKind::Build).with_input("src"),
        ]);
        assert!(matches!(
            result,
            Err(StageLayoutError::OrdinalGap { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn test_layout_rejects_input_from_later_stage() {
        let result = StageLayout::new(vec![
            StageDefinition::new("Build", 0, StageKind::Build)
                .with_input("src")
                .with_output("build"),
            StageDefinition::new("Source", 1, StageKind::Source).with_output("src"),
        ]);
        assert!(matches!(
            result,
            Err(StageLayoutError::UnresolvedInput { .. })
        ));
    }

    #[test]
    fn test_layout_rejects_self_input() {
        let result = StageLayout::new(vec![
            StageDefinition::new("Source", 0, StageKind::Source)
                .with_input("src")
                .with_output("src"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_layout_rejects_empty() {
        assert_eq!(StageLayout::new(vec![]).unwrap_err(), StageLayoutError::Empty);
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("src", "abc123"), "src:abc123");
    }
}
