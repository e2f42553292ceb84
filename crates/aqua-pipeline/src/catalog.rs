use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeciesCategory {
    Fish,
    Mollusk,
    Crustacean,
    Other,
}

impl SpeciesCategory {
    pub const ALL: [SpeciesCategory; 4] = [
        SpeciesCategory::Fish,
        SpeciesCategory::Mollusk,
        SpeciesCategory::Crustacean,
        SpeciesCategory::Other,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SpeciesCategory::Fish => "Fish",
            SpeciesCategory::Mollusk => "Mollusks",
            SpeciesCategory::Crustacean => "Crustaceans",
            SpeciesCategory::Other => "Other",
        }
    }
}

impl fmt::Display for SpeciesCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesEntry {
    pub id: String,
    pub common_name: String,
    pub scientific_name: String,
    pub category: SpeciesCategory,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub habitat: String,
    #[serde(default)]
    pub distribution: String,
    #[serde(default)]
    pub conservation_status: String,
    #[serde(default)]
    pub wikipedia_url: Option<String>,
    /// Detector class labels this entry answers to.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl SpeciesEntry {
    fn matches(&self, needle: &str) -> bool {
        [&self.common_name, &self.scientific_name, &self.description]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }

    fn answers_to(&self, label: &str) -> bool {
        self.common_name.eq_ignore_ascii_case(label)
            || self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    species: Vec<SpeciesEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct SpeciesCatalog {
    species: Vec<SpeciesEntry>,
}

impl SpeciesCatalog {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml).context("parsing species catalog")?;
        Ok(Self {
            species: file.species,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn all(&self) -> &[SpeciesEntry] {
        &self.species
    }

    /// Case-insensitive substring search over names and description; a blank
    /// term returns everything.
    pub fn search(&self, term: &str) -> Vec<&SpeciesEntry> {
        let needle = term.trim().to_lowercase();
        self.species
            .iter()
            .filter(|s| needle.is_empty() || s.matches(&needle))
            .collect()
    }

    pub fn by_category<'a>(
        entries: &[&'a SpeciesEntry],
        category: SpeciesCategory,
    ) -> Vec<&'a SpeciesEntry> {
        entries
            .iter()
            .copied()
            .filter(|s| s.category == category)
            .collect()
    }

    /// Catalog entry for a detector class label such as `Whelk`.
    pub fn for_label(&self, label: &str) -> Option<&SpeciesEntry> {
        let label = label.trim();
        self.species.iter().find(|s| s.answers_to(label))
    }
}
