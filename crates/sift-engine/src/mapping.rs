//! # Field Mapping Service
//!
//! Declared field types, consulted when a date histogram has to choose how
//! to read a timestamp. Lookups try `index/type` first and then `index`.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::TimestampSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Date,
    Long,
    Double,
    Text,
    Boolean,
    Object,
    Nested,
}

impl FieldType {
    pub fn parse(name: &str) -> Option<Self> {
        let t = match name {
            "date" => Self::Date,
            "long" | "integer" | "short" | "byte" => Self::Long,
            "double" | "float" | "half_float" | "scaled_float" => Self::Double,
            "text" | "keyword" | "string" => Self::Text,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "nested" => Self::Nested,
            _ => return None,
        };
        Some(t)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Long => "long",
            Self::Double => "double",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Nested => "nested",
        }
    }

    /// How a field of this type encodes an instant, if it can be bucketed by time.
    pub fn timestamp_source(self) -> Option<TimestampSource> {
        match self {
            Self::Date => Some(TimestampSource::Formatted),
            Self::Long | Self::Double => Some(TimestampSource::EpochMillis),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait FieldMappingService: Send + Sync {
    fn field_type(&self, indices: &[String], types: &[String], field: &str) -> Option<FieldType>;
}

/// Field types keyed by `index` or `index/type`, then by dotted field path.
#[derive(Debug, Default)]
pub struct InMemoryMappings {
    scopes: RwLock<HashMap<String, HashMap<String, FieldType>>>,
}

impl InMemoryMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from `index -> field -> type`, as read from config.
    pub fn from_config(config: &HashMap<String, HashMap<String, FieldType>>) -> Self {
        let mappings = Self::new();
        for (index, fields) in config {
            for (field, field_type) in fields {
                mappings.put(index, None, field, *field_type);
            }
        }
        mappings
    }

    pub fn put(&self, index: &str, doc_type: Option<&str>, field: &str, field_type: FieldType) {
        let mut scopes = match self.scopes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        scopes
            .entry(scope_key(index, doc_type))
            .or_default()
            .insert(field.to_string(), field_type);
    }

    /// Merge a `{"properties": {...}}` mapping body. Nested `properties`
    /// objects flatten into dotted paths. Returns the number of fields stored.
    pub fn put_properties(
        &self,
        index: &str,
        doc_type: Option<&str>,
        body: &Value,
    ) -> Result<usize, String> {
        let properties = body
            .get("properties")
            .ok_or_else(|| "mapping body requires [properties]".to_string())?;
        let mut fields = Vec::new();
        collect_properties(properties, "", &mut fields)?;
        for (field, field_type) in &fields {
            self.put(index, doc_type, field, *field_type);
        }
        Ok(fields.len())
    }

    /// Everything declared for `index`, across all of its types.
    pub fn snapshot(&self, index: &str) -> HashMap<String, FieldType> {
        let scopes = match self.scopes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let typed_prefix = format!("{index}/");
        let mut out = HashMap::new();
        for (scope, fields) in scopes.iter() {
            if scope == index || scope.starts_with(&typed_prefix) {
                out.extend(fields.iter().map(|(k, v)| (k.clone(), *v)));
            }
        }
        out
    }
}

impl FieldMappingService for InMemoryMappings {
    fn field_type(&self, indices: &[String], types: &[String], field: &str) -> Option<FieldType> {
        let scopes = match self.scopes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lookup = |key: &str| scopes.get(key).and_then(|fields| fields.get(field)).copied();
        indices.iter().find_map(|index| {
            types
                .iter()
                .find_map(|t| lookup(&scope_key(index, Some(t))))
                .or_else(|| lookup(index))
        })
    }
}

fn scope_key(index: &str, doc_type: Option<&str>) -> String {
    match doc_type {
        Some(t) => format!("{index}/{t}"),
        None => index.to_string(),
    }
}

fn collect_properties(
    properties: &Value,
    prefix: &str,
    out: &mut Vec<(String, FieldType)>,
) -> Result<(), String> {
    let map = properties
        .as_object()
        .ok_or_else(|| format!("[properties] under [{prefix}] must be an object"))?;
    for (name, spec) in map {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        if let Some(nested) = spec.get("properties") {
            let declared = spec.get("type").and_then(Value::as_str).unwrap_or("object");
            let field_type = FieldType::parse(declared)
                .ok_or_else(|| format!("unknown field type [{declared}] for [{path}]"))?;
            out.push((path.clone(), field_type));
            collect_properties(nested, &path, out)?;
            continue;
        }
        let declared = spec
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("field [{path}] requires a [type]"))?;
        let field_type = FieldType::parse(declared)
            .ok_or_else(|| format!("unknown field type [{declared}] for [{path}]"))?;
        out.push((path, field_type));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_typed_scope_wins_over_index_scope() {
        let m = InMemoryMappings::new();
        m.put("logs", None, "ts", FieldType::Date);
        m.put("logs", Some("legacy"), "ts", FieldType::Long);

        let idx = strings(&["logs"]);
        assert_eq!(m.field_type(&idx, &[], "ts"), Some(FieldType::Date));
        assert_eq!(
            m.field_type(&idx, &strings(&["legacy"]), "ts"),
            Some(FieldType::Long)
        );
        assert_eq!(m.field_type(&idx, &[], "missing"), None);
        assert_eq!(m.field_type(&strings(&["other"]), &[], "ts"), None);
    }

    #[test]
    fn test_put_properties_flattens_objects() {
        let m = InMemoryMappings::new();
        let n = m
            .put_properties(
                "shop",
                None,
                &json!({ "properties": {
                    "price": { "type": "double" },
                    "order": { "properties": { "placed": { "type": "date" } } }
                }}),
            )
            .unwrap();
        assert_eq!(n, 3);
        let idx = strings(&["shop"]);
        assert_eq!(m.field_type(&idx, &[], "order.placed"), Some(FieldType::Date));
        assert_eq!(m.field_type(&idx, &[], "order"), Some(FieldType::Object));
    }

    #[test]
    fn test_put_properties_rejects_unknown_types() {
        let m = InMemoryMappings::new();
        let err = m.put_properties("x", None, &json!({ "properties": { "a": { "type": "geo_point" } } }));
        assert!(err.is_err());
    }

    #[test]
    fn test_timestamp_sources() {
        assert_eq!(FieldType::Date.timestamp_source(), Some(TimestampSource::Formatted));
        assert_eq!(FieldType::Double.timestamp_source(), Some(TimestampSource::EpochMillis));
        assert_eq!(FieldType::Text.timestamp_source(), None);
    }

    #[test]
    fn test_config_names_deserialize() {
        let parsed: HashMap<String, FieldType> =
            serde_json::from_value(json!({ "ts": "date", "n": "long" })).unwrap();
        assert_eq!(parsed["ts"], FieldType::Date);
    }
}
