//! Model schemas: field shapes plus per-field validation rules, applied to documents before
//! they reach a driver.

use crate::case::to_snake_case;
use crate::error::SchemaError;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Compiled `pattern` rules, shared by every schema in the process.
static PATTERNS: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(re) = PATTERNS.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    PATTERNS.insert(pattern.to_string(), re.clone());
    Ok(re)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    /// RFC 3339 timestamp string.
    Date,
    Uuid,
    Array,
    Object,
    Any,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(flatten)]
    pub rules: ValidationRule,
}

impl FieldDef {
    pub fn new(kind: FieldKind) -> Self {
        FieldDef {
            kind,
            required: false,
            default: None,
            index: false,
            unique: false,
            rules: ValidationRule::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_rules(mut self, rules: ValidationRule) -> Self {
        self.rules = rules;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Shape of one model. Treated as immutable once handed to the model registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    /// Storage collection/table name. Derived from the model name when absent.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    /// Unknown fields are dropped when strict.
    #[serde(default = "default_true")]
    pub strict: bool,
}

impl Default for ModelSchema {
    fn default() -> Self {
        ModelSchema {
            collection: None,
            fields: BTreeMap::new(),
            strict: true,
        }
    }
}

impl ModelSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    /// "NewsItem" -> "news_items", "News" -> "news".
    pub fn collection_name(&self, model_name: &str) -> String {
        if let Some(c) = &self.collection {
            return c.clone();
        }
        let snake = to_snake_case(model_name);
        if snake.ends_with('s') {
            snake
        } else {
            format!("{}s", snake)
        }
    }

    /// Document ready for insert: unknown fields stripped (strict), defaults applied, every field checked.
    pub fn prepare_insert(&self, doc: Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
        let mut doc = self.strip_unknown(doc);
        for (name, def) in &self.fields {
            if !doc.contains_key(name) || doc.get(name) == Some(&Value::Null) {
                if let Some(default) = &def.default {
                    doc.insert(name.clone(), default.clone());
                }
            }
            let value = doc.get(name);
            if def.required && (value.is_none() || value == Some(&Value::Null)) {
                return Err(SchemaError::new(name, "is required"));
            }
            if let Some(v) = value {
                validate_field(name, v, def)?;
            }
        }
        Ok(doc)
    }

    /// Patch ready for update: only fields present are checked; required is not enforced for
    /// missing fields but a required field cannot be set to null.
    pub fn prepare_update(&self, patch: Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
        let patch = self.strip_unknown(patch);
        for (name, v) in &patch {
            if let Some(def) = self.fields.get(name) {
                if def.required && v.is_null() {
                    return Err(SchemaError::new(name, "is required"));
                }
                validate_field(name, v, def)?;
            }
        }
        Ok(patch)
    }

    /// Compile every `pattern` rule up front so a bad one is a load error, not a rejected document.
    pub fn check_patterns(&self) -> Result<(), SchemaError> {
        for (name, def) in &self.fields {
            if let Some(pattern) = &def.rules.pattern {
                compiled_pattern(pattern)
                    .map_err(|e| SchemaError::new(name, format!("has an invalid pattern rule: {}", e)))?;
            }
        }
        Ok(())
    }

    /// Top-level field names usable in exact-match filters.
    pub fn is_filterable(&self, field: &str) -> bool {
        !self.strict || self.fields.contains_key(field)
    }

    fn strip_unknown(&self, mut doc: Map<String, Value>) -> Map<String, Value> {
        if self.strict {
            doc.retain(|k, _| self.fields.contains_key(k));
        }
        doc
    }
}

fn validate_field(name: &str, v: &Value, def: &FieldDef) -> Result<(), SchemaError> {
    if v.is_null() {
        return Ok(());
    }
    check_kind(name, v, def.kind)?;
    let rule = &def.rules;
    if let Some(format) = &rule.format {
        validate_format(name, v, format)?;
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = rule.max_length {
            if len > max as usize {
                return Err(SchemaError::new(name, format!("must be at most {} characters", max)));
            }
        }
        if let Some(min) = rule.min_length {
            if len < min as usize {
                return Err(SchemaError::new(name, format!("must be at least {} characters", min)));
            }
        }
        if let Some(pattern) = &rule.pattern {
            let re = compiled_pattern(pattern).map_err(|_| SchemaError::new(name, "has an invalid pattern rule"))?;
            if !re.is_match(s) {
                return Err(SchemaError::new(name, "does not match required pattern"));
            }
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(SchemaError::new(
                name,
                format!("must be one of: {:?}", allowed.iter().take(5).collect::<Vec<_>>()),
            ));
        }
    }
    if let Some(n) = v.as_f64() {
        if let Some(min) = rule.minimum {
            if n < min {
                return Err(SchemaError::new(name, format!("must be at least {}", min)));
            }
        }
        if let Some(max) = rule.maximum {
            if n > max {
                return Err(SchemaError::new(name, format!("must be at most {}", max)));
            }
        }
    }
    Ok(())
}

fn check_kind(name: &str, v: &Value, kind: FieldKind) -> Result<(), SchemaError> {
    let ok = match kind {
        FieldKind::String => v.is_string(),
        FieldKind::Number => v.is_number(),
        FieldKind::Integer => v.is_i64() || v.is_u64(),
        FieldKind::Boolean => v.is_boolean(),
        FieldKind::Date => v
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        FieldKind::Uuid => v.as_str().map(|s| uuid::Uuid::parse_str(s).is_ok()).unwrap_or(false),
        FieldKind::Array => v.is_array(),
        FieldKind::Object => v.is_object(),
        FieldKind::Any => true,
    };
    if ok {
        Ok(())
    } else {
        Err(SchemaError::new(name, format!("must be of type {:?}", kind).to_lowercase()))
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn validate_format(name: &str, v: &Value, format: &str) -> Result<(), SchemaError> {
    let Some(s) = v.as_str() else {
        return Ok(());
    };
    match format.to_lowercase().as_str() {
        "email" => {
            if !s.contains('@') || s.len() < 3 {
                return Err(SchemaError::new(name, "must be a valid email"));
            }
        }
        "url" => {
            if !(s.starts_with("http://") || s.starts_with("https://")) {
                return Err(SchemaError::new(name, "must be an http(s) url"));
            }
        }
        "slug" => {
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
                return Err(SchemaError::new(name, "must be a lowercase slug"));
            }
        }
        _ => {}
    }
    Ok(())
}
