//! Rule store for path-mounted proxy rules
//! Rules live in a JSON document and are handed out as owned snapshots

use crate::router::normalize_prefix;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A single mount rule: requests under `path` are forwarded to `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub id: String,
    pub name: String,
    /// Local mount prefix, e.g. `/docs`
    pub path: String,
    /// Origin base URL, e.g. `https://docs.example.com`
    pub target: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyRule {
    pub fn new(name: &str, path: &str, target: &str, enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            path: path.to_string(),
            target: target.to_string(),
            enabled,
            created_at: now,
            updated_at: now,
        }
    }

    /// The prefix actually used for matching (always starts with `/`)
    pub fn mount_prefix(&self) -> String {
        normalize_prefix(&self.path)
    }
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub path: Option<String>,
    pub target: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<ProxyRule>,
}

struct StoreState {
    rules: Vec<ProxyRule>,
    modified: Option<SystemTime>,
}

/// JSON-backed rule store
///
/// Constructed once at startup and shared behind an `Arc`. Reads return
/// copies, so callers never observe a rule changing mid-request.
pub struct RuleStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl RuleStore {
    /// Open the store at `path`, creating an empty rule file if none exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let store = Self {
            path,
            state: RwLock::new(StoreState {
                rules: Vec::new(),
                modified: None,
            }),
        };

        if store.path.exists() {
            let rules = read_rule_file(&store.path)?;
            let mut state = store.state.write();
            state.rules = rules;
            state.modified = modified_time(&store.path);
        } else {
            let mut state = store.state.write();
            store.persist(&mut state)?;
        }

        Ok(store)
    }

    /// All rules in stored order
    pub fn list_rules(&self) -> Vec<ProxyRule> {
        self.refresh_if_changed();
        self.state.read().rules.clone()
    }

    /// Enabled rules in stored order; this is the per-request routing snapshot
    pub fn list_enabled(&self) -> Vec<ProxyRule> {
        self.refresh_if_changed();
        self.state
            .read()
            .rules
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    pub fn get_rule(&self, id: &str) -> Option<ProxyRule> {
        self.refresh_if_changed();
        self.state.read().rules.iter().find(|r| r.id == id).cloned()
    }

    /// Add a rule to the end of the list
    pub fn add_rule(&self, name: &str, path: &str, target: &str, enabled: bool) -> Result<ProxyRule> {
        if name.is_empty() || path.is_empty() || target.is_empty() {
            bail!("Name, path and target must not be empty");
        }

        self.refresh_if_changed();
        let mut state = self.state.write();

        let prefix = normalize_prefix(path);
        if state.rules.iter().any(|r| r.mount_prefix() == prefix) {
            bail!("A rule for path {} already exists", prefix);
        }

        let rule = ProxyRule::new(name, path, target, enabled);
        state.rules.push(rule.clone());
        self.persist(&mut state)?;

        info!("Added rule {} ({} -> {})", rule.name, prefix, rule.target);
        Ok(rule)
    }

    /// Apply a partial update; returns `None` when no rule has this id
    pub fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<Option<ProxyRule>> {
        self.refresh_if_changed();
        let mut state = self.state.write();

        let Some(index) = state.rules.iter().position(|r| r.id == id) else {
            return Ok(None);
        };

        if let Some(path) = update.path.as_deref() {
            if path.is_empty() {
                bail!("Path must not be empty");
            }
            let prefix = normalize_prefix(path);
            if state
                .rules
                .iter()
                .any(|r| r.id != id && r.mount_prefix() == prefix)
            {
                bail!("A rule for path {} already exists", prefix);
            }
        }

        let rule = &mut state.rules[index];
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(path) = update.path {
            rule.path = path;
        }
        if let Some(target) = update.target {
            rule.target = target;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = Utc::now();

        let updated = rule.clone();
        self.persist(&mut state)?;
        Ok(Some(updated))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<ProxyRule>> {
        self.update_rule(
            id,
            RuleUpdate {
                enabled: Some(enabled),
                ..RuleUpdate::default()
            },
        )
    }

    /// Returns whether a rule was removed
    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        self.refresh_if_changed();
        let mut state = self.state.write();

        let before = state.rules.len();
        state.rules.retain(|r| r.id != id);
        if state.rules.len() == before {
            return Ok(false);
        }

        self.persist(&mut state)?;
        Ok(true)
    }

    /// Pick up edits made by another process (e.g. the rules CLI)
    fn refresh_if_changed(&self) {
        let Some(modified) = modified_time(&self.path) else {
            return;
        };

        if self.state.read().modified == Some(modified) {
            return;
        }

        match read_rule_file(&self.path) {
            Ok(rules) => {
                let mut state = self.state.write();
                debug!("Reloaded {} rule(s) from {}", rules.len(), self.path.display());
                state.rules = rules;
                state.modified = Some(modified);
            }
            Err(e) => warn!("Failed to reload rules from {}: {:#}", self.path.display(), e),
        }
    }

    fn persist(&self, state: &mut StoreState) -> Result<()> {
        let file = RuleFile {
            rules: state.rules.clone(),
        };
        let data = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, data)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        state.modified = modified_time(&self.path);
        Ok(())
    }
}

fn read_rule_file(path: &Path) -> Result<Vec<ProxyRule>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: RuleFile = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(file.rules)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
