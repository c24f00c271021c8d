use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const ALIASES_FILE: &str = "name_aliases.yaml";

#[derive(Debug, Clone, Deserialize)]
struct AliasRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    aliases: Vec<AliasRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasRule {
    from: String,
    to: String,
}

/// Corrections for free-text names the source spells inconsistently.
#[derive(Debug, Clone, Default)]
pub struct NameAliases {
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
}

impl NameAliases {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut aliases = Self::default();
        for (from, to) in pairs {
            let from = from.into().trim().to_string();
            let to = to.into().trim().to_string();
            aliases.folded.insert(from.to_lowercase(), to.clone());
            aliases.exact.insert(from, to);
        }
        aliases
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: AliasRulesFile = serde_yaml::from_str(text).context("parsing name aliases")?;
        Ok(Self::new(file.aliases.into_iter().map(|r| (r.from, r.to))))
    }

    pub fn from_rules_dir(rules_dir: &Path) -> Result<Self> {
        let path = rules_dir.join(ALIASES_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Canonical spelling of `name`; unmapped names come back trimmed.
    pub fn calibrate(&self, name: &str) -> String {
        let trimmed = name.trim();
        self.exact
            .get(trimmed)
            .or_else(|| self.folded.get(&trimmed.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }
}
