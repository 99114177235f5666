// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Run context: workflow variables and artifact locations, plus template
//! interpolation of step parameters before handler dispatch.

use handlebars::Handlebars;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Execution context for a workflow run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Free-form workflow variables.
    variables: Arc<RwLock<BTreeMap<String, Value>>>,

    /// Complete artifact name -> absolute path.
    artifacts: Arc<RwLock<BTreeMap<String, String>>>,

    /// Template renderer.
    renderer: Arc<Handlebars<'static>>,
}

impl RunContext {
    /// Create a new run context.
    pub fn new(variables: BTreeMap<String, Value>) -> Self {
        let mut renderer = Handlebars::new();
        // Parameter values are not HTML.
        renderer.register_escape_fn(handlebars::no_escape);

        Self {
            variables: Arc::new(RwLock::new(variables)),
            artifacts: Arc::new(RwLock::new(BTreeMap::new())),
            renderer: Arc::new(renderer),
        }
    }

    /// Set a variable.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.write().insert(key.into(), value);
    }

    /// Get a variable.
    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.read().get(key).cloned()
    }

    /// All variables.
    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.variables.read().clone()
    }

    /// Record the absolute location of a complete artifact.
    pub fn register_artifact(&self, name: impl Into<String>, path: impl Into<String>) {
        self.artifacts.write().insert(name.into(), path.into());
    }

    /// Render a template string against `variables.*` and `artifacts.*`.
    pub fn render_template(&self, template: &str) -> Result<String> {
        let data = serde_json::json!({
            "variables": self.variables.read().clone(),
            "artifacts": self.artifacts.read().clone(),
        });
        self.renderer
            .render_template(template, &data)
            .map_err(|e| EngineError::template(e.to_string()))
    }

    /// Interpolate every string leaf of a parameter map.
    ///
    /// Non-string values pass through untouched; strings without placeholders
    /// are returned as-is.
    pub fn render_parameters(
        &self,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        parameters
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.render_value(value)?)))
            .collect()
    }

    fn render_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(text) if text.contains("{{") => {
                Ok(Value::String(self.render_template(text)?))
            }
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item))
                    .collect::<Result<_>>()?,
            )),
            Value::Object(map) => Ok(Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.render_value(v)?)))
                    .collect::<Result<_>>()?,
            )),
            other => Ok(other.clone()),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}
