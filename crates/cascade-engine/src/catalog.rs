//! Action Catalog — the registry of externally implemented action types.
//!
//! Collaborating modules register `{action_type, config_schema,
//! required_capabilities, handler}` at startup. The engine never embeds
//! business logic for actions: it validates configs against the schema
//! here and invokes the bound handler through [`ActionHandler`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cascade_core::{CascadeError, Result};
use serde::Serialize;
use serde_json::Value;

/// How an action invocation ended, as classified by the handler.
#[derive(Debug, Clone)]
pub enum ActionFailure {
    /// Transient: goes through backoff/retry up to the job's budget.
    Retryable(String),
    /// Permanent: dead-letters immediately, no retry.
    Permanent(String),
}

impl ActionFailure {
    pub fn message(&self) -> &str {
        match self {
            ActionFailure::Retryable(m) | ActionFailure::Permanent(m) => m,
        }
    }
}

/// Contract supplied by the module owning an action type
/// (send-message, create-task, …).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute with fully resolved params. The dispatcher enforces a
    /// timeout around this call; a timeout counts as retryable.
    async fn execute(&self, params: &Value) -> std::result::Result<Value, ActionFailure>;
}

/// One registered action type.
#[derive(Debug, Clone, Serialize)]
pub struct ActionCatalogEntry {
    pub action_type: String,
    pub description: String,
    /// Schema-lite: `{"required": [...], "properties": {name: {"type": ...}}}`.
    pub config_schema: Value,
    pub required_capabilities: Vec<String>,
    pub is_active: bool,
}

struct Registration {
    entry: ActionCatalogEntry,
    handler: Arc<dyn ActionHandler>,
}

/// Static registry of action types; read-mostly reference data.
#[derive(Default)]
pub struct ActionCatalog {
    entries: RwLock<HashMap<String, Registration>>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action type with its handler. Re-registering an
    /// existing type replaces the previous handler.
    pub fn register(
        &self,
        action_type: &str,
        description: &str,
        config_schema: Value,
        required_capabilities: &[&str],
        handler: Arc<dyn ActionHandler>,
    ) {
        let entry = ActionCatalogEntry {
            action_type: action_type.to_string(),
            description: description.to_string(),
            config_schema,
            required_capabilities: required_capabilities
                .iter()
                .map(|s| s.to_string())
                .collect(),
            is_active: true,
        };
        tracing::info!("🧩 Registered action type: {action_type}");
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(action_type.to_string(), Registration { entry, handler });
        }
    }

    /// Deactivate an action type; existing rules keep referencing it but
    /// validation now rejects it at enqueue and dispatch time.
    pub fn deactivate(&self, action_type: &str) -> bool {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(reg) = entries.get_mut(action_type) {
                reg.entry.is_active = false;
                tracing::info!("🚫 Deactivated action type: {action_type}");
                return true;
            }
        }
        false
    }

    pub fn entry(&self, action_type: &str) -> Option<ActionCatalogEntry> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(action_type).map(|r| r.entry.clone()))
    }

    pub fn handler(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(action_type).map(|r| r.handler.clone()))
    }

    /// All entries, sorted by type (operator listing).
    pub fn list(&self) -> Vec<ActionCatalogEntry> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .map(|e| e.values().map(|r| r.entry.clone()).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.action_type.cmp(&b.action_type));
        entries
    }

    /// Reject unregistered or inactive types. Used both at rule-save and
    /// at enqueue/dispatch time, since entries can be deactivated after
    /// rules referencing them exist.
    pub fn ensure_active(&self, action_type: &str) -> Result<ActionCatalogEntry> {
        let entry = self.entry(action_type).ok_or_else(|| {
            CascadeError::validation(format!("unknown action type '{action_type}'"))
        })?;
        if !entry.is_active {
            return Err(CascadeError::validation(format!(
                "action type '{action_type}' is inactive"
            )));
        }
        Ok(entry)
    }

    /// Validate resolved params against the entry's config schema.
    pub fn validate_config(&self, action_type: &str, params: &Value) -> Result<()> {
        let entry = self.ensure_active(action_type)?;
        validate_against_schema(&entry.config_schema, params).map_err(|e| {
            CascadeError::validation(format!("action '{action_type}' config: {e}"))
        })
    }
}

/// Check required keys and declared property types.
fn validate_against_schema(schema: &Value, params: &Value) -> std::result::Result<(), String> {
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for req in required {
            if let Some(key) = req.as_str() {
                if params.get(key).is_none() {
                    return Err(format!("missing required field '{key}'"));
                }
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, prop) in properties {
            let Some(value) = params.get(key) else { continue };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(format!("field '{key}' must be a {expected}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted handler for tests: fails the first `fail_times` calls.
    pub struct ScriptedHandler {
        pub calls: AtomicU32,
        pub fail_times: u32,
        pub permanent: bool,
    }

    impl ScriptedHandler {
        pub fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_times: 0,
                permanent: false,
            })
        }

        pub fn failing(times: u32, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_times: times,
                permanent,
            })
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionHandler for ScriptedHandler {
        async fn execute(&self, params: &Value) -> std::result::Result<Value, ActionFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(if self.permanent {
                    ActionFailure::Permanent("scripted permanent failure".into())
                } else {
                    ActionFailure::Retryable("scripted transient failure".into())
                });
            }
            Ok(serde_json::json!({"echo": params}))
        }
    }
}
