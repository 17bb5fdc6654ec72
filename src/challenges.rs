//! Challenge definitions and the read-only catalog built from them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

const BUILTIN_CHALLENGES: &str = include_str!("../challenges/builtin.json");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing challenges: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate challenge id {0:?}")]
    Duplicate(String),

    #[error("challenge {0:?} has an empty flag")]
    EmptyFlag(String),
}

fn default_points() -> u32 {
    100
}

/// A learning exercise. The flag is only reachable through [`check_flag`].
///
/// [`check_flag`]: ChallengeDefinition::check_flag
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub category: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub expected_commands: Vec<String>,
    flag: String,
    #[serde(default = "default_points")]
    pub points: u32,
    #[serde(default)]
    pub setup_files: BTreeMap<String, String>,
}

impl ChallengeDefinition {
    pub fn check_flag(&self, submitted: &str) -> bool {
        submitted.trim() == self.flag
    }

    pub fn summary(&self) -> ChallengeSummary {
        ChallengeSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            difficulty: self.difficulty.clone(),
            category: self.category.clone(),
        }
    }

    pub fn view(&self) -> ChallengeView {
        ChallengeView {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            difficulty: self.difficulty.clone(),
            category: self.category.clone(),
            instructions: self.instructions.clone(),
            expected_commands: self.expected_commands.clone(),
            points: self.points,
            setup_files: self.setup_files.keys().cloned().collect(),
        }
    }
}

/// List entry.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub category: String,
}

/// Full challenge without the flag. Seed files are listed by name only
/// because their contents may contain the flag.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeView {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub category: String,
    pub instructions: String,
    pub expected_commands: Vec<String>,
    pub points: u32,
    pub setup_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChallengeCatalog {
    challenges: Vec<ChallengeDefinition>,
}

impl ChallengeCatalog {
    /// The challenges shipped with the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_CHALLENGES)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let challenges: Vec<ChallengeDefinition> = serde_json::from_str(json)?;
        Self::new(challenges)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn new(challenges: Vec<ChallengeDefinition>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for challenge in &challenges {
            if !seen.insert(challenge.id.as_str()) {
                return Err(CatalogError::Duplicate(challenge.id.clone()));
            }
            if challenge.flag.trim().is_empty() {
                return Err(CatalogError::EmptyFlag(challenge.id.clone()));
            }
        }
        Ok(Self { challenges })
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    pub fn list(&self) -> Vec<ChallengeSummary> {
        self.challenges.iter().map(ChallengeDefinition::summary).collect()
    }

    pub fn get(&self, id: &str) -> Option<ChallengeView> {
        self.definition(id).map(ChallengeDefinition::view)
    }

    pub fn definition(&self, id: &str) -> Option<&ChallengeDefinition> {
        self.challenges.iter().find(|c| c.id == id)
    }
}
