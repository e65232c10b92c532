//! Listener module shape: declarative YAML rule files (spec.md §9 "Dynamic
//! module loading", redesign option (a))
//!
//! A source-language dynamic `import()` of a `{config, handler}` pair has no
//! static-Rust equivalent; each listener is instead a YAML file whose
//! `when`/`then` clauses are the handler, matching spec.md §4.4's module
//! contract (`config` + callable) without embedding a scripting VM.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::ModelAlias;
use crate::errors::{AppError, AppResult};
use crate::notification::Priority;

/// Event kinds a listener can subscribe to (spec.md §4.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EmailReceived,
    EmailSent,
    EmailStarred,
    EmailArchived,
    EmailLabeled,
    ScheduledTime,
}

/// The `config` half of a listener module (spec.md §4.4)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub event: EventKind,
}

fn default_enabled() -> bool {
    true
}

/// `when` clause: every specified field must match (logical AND)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub from_contains: Option<String>,
    #[serde(default)]
    pub to_contains: Option<String>,
    #[serde(default)]
    pub subject_contains: Option<String>,
    #[serde(default)]
    pub is_unread: Option<bool>,
    #[serde(default)]
    pub has_attachments: Option<bool>,
    #[serde(default)]
    pub folder_equals: Option<String>,
    #[serde(default)]
    pub label_equals: Option<String>,
}

/// One step of the `then` clause; the handler half of the module contract
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Notify {
        /// May reference `{field}` placeholders from the most recent
        /// `call_agent` result
        message_template: String,
        #[serde(default)]
        priority: Priority,
    },
    Archive,
    Star,
    Unstar,
    MarkAsRead,
    MarkAsUnread,
    AddLabel {
        label: String,
    },
    RemoveLabel {
        label: String,
    },
    CallAgent {
        prompt: String,
        schema: Value,
        #[serde(default = "default_model")]
        model: String,
    },
    /// Branches on a field of the most recent `call_agent` result
    IfAgent {
        field: String,
        equals: Value,
        then: Vec<Action>,
    },
}

fn default_model() -> String {
    "haiku".to_owned()
}

impl Action {
    pub fn model_alias(model: &str) -> ModelAlias {
        ModelAlias::parse(model)
    }
}

/// A single rule file, fully parsed and validated (spec.md §4.4 "Listener
/// module contract")
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerModule {
    #[serde(flatten)]
    pub config: ListenerConfig,
    #[serde(default)]
    pub when: Condition,
    #[serde(default)]
    pub then: Vec<Action>,
    #[serde(skip)]
    pub source_path: PathBuf,
}

/// Parse and validate one rule file
///
/// # Errors
///
/// `InvalidInput` if the YAML is malformed or missing required fields
/// (spec.md §7 "Configuration errors": invalid listener file).
pub fn load_module(path: &Path) -> AppResult<ListenerModule> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::InvalidInput(format!("cannot read listener file {path:?}: {e}")))?;
    let mut module: ListenerModule = serde_yaml::from_str(&raw)
        .map_err(|e| AppError::InvalidInput(format!("invalid listener file {path:?}: {e}")))?;
    module.source_path = path.to_path_buf();
    Ok(module)
}

/// Whether a filename is a candidate listener file (spec.md §4.4 "Load
/// rules": dotfiles/underscore-prefixed files and non-module extensions are
/// ignored)
pub fn is_candidate_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with('_') {
        return false;
    }
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_archive_newsletter_rule() {
        let yaml = r#"
id: auto-archive-newsletters
name: Auto-archive newsletters
enabled: true
event: email_received
when:
  from_contains: "noreply"
then:
  - archive
  - mark_as_read
  - notify:
      message_template: "Auto-archived newsletter: {subject}"
      priority: low
"#;
        let module: ListenerModule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(module.config.id, "auto-archive-newsletters");
        assert!(module.config.enabled);
        assert_eq!(module.config.event, EventKind::EmailReceived);
        assert_eq!(module.when.from_contains.as_deref(), Some("noreply"));
        assert_eq!(module.then.len(), 3);
    }

    #[test]
    fn parses_call_agent_and_if_agent_rule() {
        let yaml = r#"
id: boss-urgent-watcher
name: Boss urgent watcher
event: email_received
when:
  from_contains: "boss@company.com"
then:
  - call_agent:
      prompt: "Classify urgency"
      schema:
        type: object
        properties:
          is_urgent: { type: boolean }
      model: haiku
  - if_agent:
      field: is_urgent
      equals: true
      then:
        - star
        - notify:
            message_template: "Urgent: {reason}"
            priority: high
"#;
        let module: ListenerModule = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(module.then[0], Action::CallAgent { .. }));
        match &module.then[1] {
            Action::IfAgent { field, equals, then } => {
                assert_eq!(field, "is_urgent");
                assert_eq!(equals, &Value::Bool(true));
                assert_eq!(then.len(), 2);
            }
            other => panic!("expected if_agent, got {other:?}"),
        }
    }

    #[test]
    fn non_yaml_files_are_not_candidates() {
        assert!(!is_candidate_file(Path::new("readme.md")));
        assert!(!is_candidate_file(Path::new(".hidden.yaml")));
        assert!(!is_candidate_file(Path::new("_disabled.yaml")));
        assert!(is_candidate_file(Path::new("urgent.yaml")));
    }
}
