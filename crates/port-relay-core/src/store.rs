//! Persistent rule and template definitions.
//!
//! Rules describe forwards (listen and target strings as the user typed them);
//! templates are named groups of rule ids. Both live in one pretty-printed JSON
//! document. Whether a rule's relay is running is never persisted.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Timestamp format used for `Template::created_at`.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A forwarding rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    /// Creation order, starting at 1. Not renumbered on delete.
    pub seq: u64,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub listen_port: String,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub target_port: String,
}

/// Editable fields of a rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    pub id: String,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub listen_port: String,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub target_port: String,
}

/// A named group of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub rules: Vec<String>,
    #[serde(default)]
    pub created_at: String,
}

impl Template {
    fn created_at_time(&self) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&self.created_at, CREATED_AT_FORMAT)
            .unwrap_or(NaiveDateTime::MIN)
    }
}

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppData {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub rules: Vec<Rule>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub templates: Vec<Template>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// File-backed store of rules and templates.
#[derive(Debug)]
pub struct RuleStore {
    path: PathBuf,
    data: RwLock<AppData>,
}

impl RuleStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppData::default(),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(
            "Loaded {} rules and {} templates from {}",
            data.rules.len(),
            data.templates.len(),
            path.display()
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Apply `change` to a copy of the data, write it, then make it current.
    ///
    /// A failed write leaves the in-memory state untouched.
    async fn commit<T>(&self, change: impl FnOnce(&mut AppData) -> Result<T>) -> Result<T> {
        let mut data = self.data.write().await;
        let mut staged = data.clone();
        let out = change(&mut staged)?;
        self.persist(&staged).await?;
        *data = staged;
        Ok(out)
    }

    async fn persist(&self, data: &AppData) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            "Saved {} rules, {} templates",
            data.rules.len(),
            data.templates.len()
        );
        Ok(())
    }

    /// All rules, newest first.
    pub async fn rules(&self) -> Vec<Rule> {
        let mut rules = self.data.read().await.rules.clone();
        rules.sort_by(|a, b| b.seq.cmp(&a.seq));
        rules
    }

    /// Append an empty rule with the next sequence number.
    pub async fn add_rule(&self) -> Result<Rule> {
        self.commit(|data| {
            let seq = data.rules.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
            let rule = Rule {
                id: Uuid::new_v4().to_string(),
                seq,
                listen_addr: String::new(),
                listen_port: String::new(),
                target_addr: String::new(),
                target_port: String::new(),
            };
            data.rules.push(rule.clone());
            Ok(rule)
        })
        .await
    }

    /// Replace a rule's endpoints.
    pub async fn update_rule(&self, update: RuleUpdate) -> Result<Rule> {
        self.commit(|data| {
            let rule = data
                .rules
                .iter_mut()
                .find(|r| r.id == update.id)
                .ok_or_else(|| Error::NotFound(format!("rule {}", update.id)))?;
            rule.listen_addr = update.listen_addr;
            rule.listen_port = update.listen_port;
            rule.target_addr = update.target_addr;
            rule.target_port = update.target_port;
            Ok(rule.clone())
        })
        .await
    }

    /// Delete rules and drop them from every template. Returns how many rules went.
    pub async fn delete_rules(&self, ids: &[String]) -> Result<usize> {
        self.commit(|data| {
            let before = data.rules.len();
            data.rules.retain(|r| !ids.contains(&r.id));
            for template in &mut data.templates {
                template.rules.retain(|id| !ids.contains(id));
            }
            Ok(before - data.rules.len())
        })
        .await
    }

    /// All templates, newest first. Unparseable timestamps sort last.
    pub async fn templates(&self) -> Vec<Template> {
        let mut templates = self.data.read().await.templates.clone();
        templates.sort_by_key(|t| std::cmp::Reverse(t.created_at_time()));
        templates
    }

    /// Add rule ids to the named template, creating it if absent.
    pub async fn save_as_template(&self, name: &str, ids: &[String]) -> Result<Template> {
        if name.trim().is_empty() {
            return Err(Error::InvalidRequest("template name is required".into()));
        }

        self.commit(|data| {
            let index = match data.templates.iter().position(|t| t.name == name) {
                Some(index) => index,
                None => {
                    data.templates.push(Template {
                        name: name.to_string(),
                        rules: Vec::with_capacity(ids.len()),
                        created_at: Local::now().format(CREATED_AT_FORMAT).to_string(),
                    });
                    data.templates.len() - 1
                }
            };

            let template = &mut data.templates[index];
            for id in ids {
                if !template.rules.contains(id) {
                    template.rules.push(id.clone());
                }
            }
            Ok(template.clone())
        })
        .await
    }

    /// The rules a template refers to, in template order. Dangling ids are skipped.
    pub async fn template_rules(&self, name: &str) -> Result<Vec<Rule>> {
        let data = self.data.read().await;

        let template = data
            .templates
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::NotFound(format!("template {}", name)))?;

        Ok(template
            .rules
            .iter()
            .filter_map(|id| data.rules.iter().find(|r| &r.id == id).cloned())
            .collect())
    }

    /// Rename a template.
    pub async fn rename_template(&self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name.is_empty() || new_name.is_empty() {
            return Err(Error::InvalidRequest(
                "both old and new template names are required".into(),
            ));
        }

        self.commit(|data| {
            let template = data
                .templates
                .iter_mut()
                .find(|t| t.name == old_name)
                .ok_or_else(|| Error::NotFound(format!("template {}", old_name)))?;
            template.name = new_name.to_string();
            Ok(())
        })
        .await
    }

    /// Delete a template. Returns whether it existed.
    pub async fn delete_template(&self, name: &str) -> Result<bool> {
        if name.is_empty() {
            return Err(Error::InvalidRequest("template name is required".into()));
        }

        self.commit(|data| {
            let before = data.templates.len();
            data.templates.retain(|t| t.name != name);
            Ok(before != data.templates.len())
        })
        .await
    }
}
