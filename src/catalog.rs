//! Benchmark catalog loading and selection.
//!
//! A catalog root holds one directory per benchmark with `benchmark.json`,
//! `.env` (carrying `FLAG=`), and `docker-compose.yml`. Broken entries are
//! skipped with a warning; only an empty catalog is an error.
use crate::error::{CatalogError, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFINITION_FILE: &str = "benchmark.json";
pub const ENV_FILE: &str = ".env";
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// One benchmark as loaded from disk. Immutable once the catalog is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkDefinition {
    pub id: String,
    /// Numeric key embedded in the identifier (`XBEN-007-24` -> 7).
    pub key: u32,
    pub name: String,
    pub description: String,
    pub level: u8,
    pub tags: Vec<String>,
    /// Internal port the challenge listens on, if declared.
    pub port: Option<u16>,
    pub flag_format: Option<String>,
    pub expected_flag: String,
    pub root: PathBuf,
    pub compose_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_level")]
    level: u8,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    flag_format: Option<String>,
}

fn default_level() -> u8 {
    1
}

/// Which benchmarks to run, by numeric key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Ids(Vec<u32>),
    Range { start: u32, end: u32 },
}

impl Selection {
    fn includes(&self, key: u32) -> bool {
        match self {
            Selection::All => true,
            Selection::Ids(ids) => ids.contains(&key),
            Selection::Range { start, end } => (*start..=*end).contains(&key),
        }
    }

    fn explicit_keys(&self) -> Vec<u32> {
        match self {
            Selection::All => Vec::new(),
            Selection::Ids(ids) => ids.clone(),
            Selection::Range { start, end } => (*start..=*end).collect(),
        }
    }
}

/// Parse `1-10` or `1 10` into an inclusive range selection.
pub fn parse_range(text: &str) -> Result<Selection, ConfigError> {
    let invalid = || ConfigError::InvalidRange(text.to_string());
    let normalized = text.replace('-', " ");
    let parts: Vec<&str> = normalized.split_whitespace().collect();
    let [start, end] = parts.as_slice() else {
        return Err(invalid());
    };
    let start: u32 = start.parse().map_err(|_| invalid())?;
    let end: u32 = end.parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid());
    }
    Ok(Selection::Range { start, end })
}

/// Parse `1,5,10` into an id-list selection.
pub fn parse_ids(text: &str) -> Result<Selection, ConfigError> {
    let ids = text
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::InvalidIds(text.to_string()))?;
    if ids.is_empty() {
        return Err(ConfigError::InvalidIds(text.to_string()));
    }
    Ok(Selection::Ids(ids))
}

/// First run of ASCII digits in an identifier.
pub fn numeric_key(id: &str) -> Option<u32> {
    let start = id.find(|ch: char| ch.is_ascii_digit())?;
    let digits: String = id[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    entries: Vec<BenchmarkDefinition>,
}

impl Catalog {
    /// Load every valid definition under `root`, ordered by numeric key.
    pub fn load(root: &Path) -> Result<Self, CatalogError> {
        if !root.is_dir() {
            return Err(CatalogError::MissingRoot(root.to_path_buf()));
        }
        let read_err = |source| CatalogError::Read {
            path: root.to_path_buf(),
            source,
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(root).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if !path.is_dir() {
                continue;
            }
            match load_definition(&path) {
                Ok(definition) => entries.push(definition),
                Err(reason) => {
                    tracing::warn!(path = %path.display(), "skipping benchmark: {reason}");
                }
            }
        }
        if entries.is_empty() {
            return Err(CatalogError::Empty(root.to_path_buf()));
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id)));
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[BenchmarkDefinition] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&BenchmarkDefinition> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Resolve a selection in catalog order. Unknown keys are warned about.
    pub fn select(&self, selection: &Selection) -> Result<Vec<&BenchmarkDefinition>, CatalogError> {
        let selected: Vec<&BenchmarkDefinition> = self
            .entries
            .iter()
            .filter(|entry| selection.includes(entry.key))
            .collect();
        for key in selection.explicit_keys() {
            if !self.entries.iter().any(|entry| entry.key == key) {
                tracing::warn!(key, "benchmark not found in catalog");
            }
        }
        if selected.is_empty() {
            return Err(CatalogError::EmptySelection);
        }
        Ok(selected)
    }

    /// Entries whose identifiers appear in `ids`, in catalog order.
    pub fn select_ids<'a, S: AsRef<str>>(&'a self, ids: &[S]) -> Vec<&'a BenchmarkDefinition> {
        for id in ids {
            if self.get(id.as_ref()).is_none() {
                tracing::warn!(benchmark = id.as_ref(), "benchmark not found in catalog");
            }
        }
        self.entries
            .iter()
            .filter(|entry| ids.iter().any(|id| id.as_ref() == entry.id))
            .collect()
    }
}

fn load_definition(dir: &Path) -> Result<BenchmarkDefinition, String> {
    let id = dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| "directory name is not valid UTF-8".to_string())?
        .to_string();
    let key = numeric_key(&id).ok_or_else(|| format!("no numeric key in {id:?}"))?;

    let definition_path = dir.join(DEFINITION_FILE);
    let bytes = fs::read(&definition_path).map_err(|err| format!("read {DEFINITION_FILE}: {err}"))?;
    let file: DefinitionFile =
        serde_json::from_slice(&bytes).map_err(|err| format!("parse {DEFINITION_FILE}: {err}"))?;
    if !(1..=3).contains(&file.level) {
        return Err(format!("level {} outside 1-3", file.level));
    }

    let env_path = dir.join(ENV_FILE);
    let env_text =
        fs::read_to_string(&env_path).map_err(|err| format!("read {ENV_FILE}: {err}"))?;
    let expected_flag =
        parse_flag_from_env(&env_text).ok_or_else(|| format!("no FLAG in {ENV_FILE}"))?;

    let compose_file = dir.join(COMPOSE_FILE);
    if !compose_file.is_file() {
        return Err(format!("missing {COMPOSE_FILE}"));
    }

    Ok(BenchmarkDefinition {
        name: file.name.unwrap_or_else(|| id.clone()),
        id,
        key,
        description: file.description,
        level: file.level,
        tags: file.tags,
        port: file.port,
        flag_format: file.flag_format,
        expected_flag,
        root: dir.to_path_buf(),
        compose_file,
    })
}

/// Extract the `FLAG=` value from dotenv text, stripping quotes.
pub fn parse_flag_from_env(text: &str) -> Option<String> {
    text.lines().map(str::trim).find_map(|line| {
        let value = line.strip_prefix("FLAG=")?;
        let value = value.trim().trim_matches('"').trim_matches('\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;
