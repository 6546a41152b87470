//! Canonical schema representation and the two ways of defining one

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{OdmError, OdmResult};
use crate::id::IdGenerator;

/// Name of the identifier field injected into declarative schemas
pub const IDENTIFIER_FIELD: &str = "id";

/// Reserved field-map key holding virtual relations; `$`-prefixed names are
/// never valid field names in a document store
pub const VIRTUALS_KEY: &str = "$virtuals";

/// JSON object holding a document's fields
pub type Fields = Map<String, Value>;

/// Value type of a schema field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Any,
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parse a type name as written in declarative schema files
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "string" => Some(FieldType::String),
            "number" => Some(FieldType::Number),
            "boolean" | "bool" => Some(FieldType::Boolean),
            "object" | "map" => Some(FieldType::Object),
            "any" | "mixed" => Some(FieldType::Any),
            "array" => Some(FieldType::Array(Box::new(FieldType::Any))),
            _ => None,
        }
    }

    /// Check whether a JSON value has this type
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array(inner), Value::Array(items)) => items.iter().all(|v| inner.matches(v)),
            _ => false,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array(_))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Number => write!(f, "number"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Object => write!(f, "object"),
            FieldType::Any => write!(f, "any"),
            FieldType::Array(inner) => write!(f, "[{}]", inner),
        }
    }
}

/// Default-value hook of a field
#[derive(Debug, Clone)]
pub enum DefaultValue {
    Value(Value),
    GeneratedId(IdGenerator),
}

impl DefaultValue {
    fn produce(&self) -> Value {
        match self {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::GeneratedId(ids) => Value::String(ids.generate()),
        }
    }
}

/// Definition of one schema field
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub kind: FieldType,
    pub required: bool,
    pub unique: bool,
    pub default: Option<DefaultValue>,
}

impl FieldDef {
    pub fn new(kind: FieldType) -> Self {
        Self {
            kind,
            required: false,
            unique: false,
            default: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn array_of(inner: FieldType) -> Self {
        Self::new(FieldType::Array(Box::new(inner)))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(DefaultValue::Value(value));
        self
    }

    pub fn generated_id(mut self, ids: IdGenerator) -> Self {
        self.default = Some(DefaultValue::GeneratedId(ids));
        self
    }
}

/// Relation resolved at query time by matching `local_field` values against
/// `foreign_field` of the referenced model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Virtual {
    pub name: String,
    pub ref_model: String,
    pub local_field: String,
    pub foreign_field: String,
    pub just_one: bool,
}

impl Virtual {
    pub fn new(
        name: impl Into<String>,
        ref_model: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ref_model: ref_model.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            just_one: false,
        }
    }

    pub fn just_one(mut self) -> Self {
        self.just_one = true;
        self
    }
}

/// Normalized schema bound to a connection when a model materializes
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, FieldDef>,
    virtuals: BTreeMap<String, Virtual>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field
    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    /// Add a virtual relation
    pub fn virtual_field(mut self, relation: Virtual) -> Self {
        self.virtuals.insert(relation.name.clone(), relation);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.fields.iter().map(|(name, def)| (name.as_str(), def))
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get_virtual(&self, name: &str) -> Option<&Virtual> {
        self.virtuals.get(name)
    }

    pub fn virtuals(&self) -> impl Iterator<Item = &Virtual> {
        self.virtuals.values()
    }

    /// Definition of the identifier field, when the schema has one
    pub fn identifier(&self) -> Option<&FieldDef> {
        self.fields.get(IDENTIFIER_FIELD)
    }

    /// Names of fields carrying a uniqueness constraint
    pub fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, def)| def.unique)
            .map(|(name, _)| name.as_str())
    }

    /// Fill absent fields from their default-value hooks
    pub fn apply_defaults(&self, doc: &mut Fields) {
        for (name, def) in &self.fields {
            let absent = doc.get(name).map_or(true, Value::is_null);
            if absent {
                if let Some(default) = &def.default {
                    doc.insert(name.clone(), default.produce());
                }
            }
        }
    }

    /// Check required fields and value types
    pub fn validate(&self, doc: &Fields) -> OdmResult<()> {
        for (name, def) in &self.fields {
            match doc.get(name) {
                None | Some(Value::Null) => {
                    if def.required {
                        return Err(OdmError::Validation(format!(
                            "Path `{}` is required",
                            name
                        )));
                    }
                }
                Some(value) => {
                    if !def.kind.matches(value) {
                        return Err(OdmError::Validation(format!(
                            "Path `{}` expects {}, got {}",
                            name, def.kind, value
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Anything that can produce a normalized [`Schema`]
pub trait SchemaDefinition: Send + Sync + fmt::Debug {
    fn to_schema(&self, ids: &IdGenerator) -> Schema;
}

/// Declarative field map, as read from a schema file.
///
/// Normalization adds a generated, unique identifier field unless one is
/// declared explicitly. Virtual relations go under the [`VIRTUALS_KEY`] entry:
///
/// ```yaml
/// username: string
/// groupNames: [string]
/// $virtuals:
///   groups:
///     ref: Group
///     local_field: groupNames
///     foreign_field: groupname
/// ```
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    fields: BTreeMap<String, FieldDef>,
    virtuals: Vec<Virtual>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VirtualSpec {
    #[serde(rename = "ref")]
    ref_model: String,
    local_field: String,
    foreign_field: String,
    #[serde(default)]
    just_one: bool,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn virtual_field(mut self, relation: Virtual) -> Self {
        self.virtuals.push(relation);
        self
    }

    /// Parse a declarative field map; the error is a human-readable reason
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("expected a field map object, found {}", json_kind(value)))?;

        let mut map = Self::default();
        for (name, spec) in object {
            if name == VIRTUALS_KEY {
                map.virtuals = parse_virtuals(spec)?;
                continue;
            }
            let def = parse_field(spec).map_err(|reason| format!("field '{}': {}", name, reason))?;
            map.fields.insert(name.clone(), def);
        }
        Ok(map)
    }
}

impl SchemaDefinition for FieldMap {
    fn to_schema(&self, ids: &IdGenerator) -> Schema {
        let mut schema = Schema::new();
        for (name, def) in &self.fields {
            schema = schema.field(name.clone(), def.clone());
        }
        if !schema.has_field(IDENTIFIER_FIELD) {
            schema = schema.field(
                IDENTIFIER_FIELD,
                FieldDef::string().unique().generated_id(ids.clone()),
            );
        }
        for relation in &self.virtuals {
            schema = schema.virtual_field(relation.clone());
        }
        schema
    }
}

/// Builder-style definition; the produced schema is used as-is
#[derive(Clone)]
pub struct SchemaFn {
    build: Arc<dyn Fn() -> Schema + Send + Sync>,
}

impl SchemaFn {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn() -> Schema + Send + Sync + 'static,
    {
        Self {
            build: Arc::new(build),
        }
    }
}

impl SchemaDefinition for SchemaFn {
    fn to_schema(&self, _ids: &IdGenerator) -> Schema {
        (self.build)()
    }
}

impl fmt::Debug for SchemaFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SchemaFn")
    }
}

fn parse_field(spec: &Value) -> Result<FieldDef, String> {
    match spec {
        Value::String(_) | Value::Array(_) => Ok(FieldDef::new(parse_type(spec)?)),
        Value::Object(options) => {
            let kind = options
                .get("type")
                .ok_or_else(|| "missing 'type'".to_string())
                .and_then(parse_type)?;
            let mut def = FieldDef::new(kind);
            for (key, option) in options {
                match key.as_str() {
                    "type" => {}
                    "required" => def.required = expect_bool(key, option)?,
                    "unique" => def.unique = expect_bool(key, option)?,
                    "default" => def.default = Some(DefaultValue::Value(option.clone())),
                    other => return Err(format!("unknown option '{}'", other)),
                }
            }
            Ok(def)
        }
        other => Err(format!("expected a type, found {}", json_kind(other))),
    }
}

fn parse_virtuals(spec: &Value) -> Result<Vec<Virtual>, String> {
    let entries = spec
        .as_object()
        .ok_or_else(|| format!("'{}' must be an object, found {}", VIRTUALS_KEY, json_kind(spec)))?;

    entries
        .iter()
        .map(|(name, relation)| {
            let spec: VirtualSpec = serde_json::from_value(relation.clone())
                .map_err(|e| format!("virtual '{}': {}", name, e))?;
            Ok(Virtual {
                name: name.clone(),
                ref_model: spec.ref_model,
                local_field: spec.local_field,
                foreign_field: spec.foreign_field,
                just_one: spec.just_one,
            })
        })
        .collect()
}

fn parse_type(spec: &Value) -> Result<FieldType, String> {
    match spec {
        Value::String(name) => {
            FieldType::parse(name).ok_or_else(|| format!("unknown type '{}'", name))
        }
        Value::Array(items) => match items.as_slice() {
            [] => Ok(FieldType::Array(Box::new(FieldType::Any))),
            [inner] => Ok(FieldType::Array(Box::new(parse_type(inner)?))),
            _ => Err("array types take exactly one element type".to_string()),
        },
        other => Err(format!("expected a type, found {}", json_kind(other))),
    }
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, String> {
    value
        .as_bool()
        .ok_or_else(|| format!("'{}' must be a boolean", key))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declarative_map_gets_identifier() {
        let map = FieldMap::from_value(&json!({
            "groupname": { "type": "string", "required": true, "unique": true }
        }))
        .unwrap();

        let schema = map.to_schema(&IdGenerator::default());
        let id = schema.identifier().expect("identifier injected");
        assert!(id.unique);
        assert!(matches!(id.default, Some(DefaultValue::GeneratedId(_))));

        let mut doc = Fields::new();
        schema.apply_defaults(&mut doc);
        assert!(doc[IDENTIFIER_FIELD].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[test]
    fn test_explicit_identifier_is_kept() {
        let map = FieldMap::from_value(&json!({
            "id": { "type": "number", "default": 1 }
        }))
        .unwrap();

        let schema = map.to_schema(&IdGenerator::default());
        let id = schema.identifier().unwrap();
        assert_eq!(id.kind, FieldType::Number);
        assert!(!id.unique);
    }

    #[test]
    fn test_builder_schema_is_used_as_is() {
        let builder = SchemaFn::new(|| Schema::new().field("name", FieldDef::string()));
        let schema = builder.to_schema(&IdGenerator::default());

        assert!(schema.identifier().is_none());
        assert!(schema.has_field("name"));
    }

    #[test]
    fn test_field_spec_shorthands() {
        let map = FieldMap::from_value(&json!({
            "username": "string",
            "groupNames": ["string"],
            "tags": []
        }))
        .unwrap();
        let schema = map.to_schema(&IdGenerator::default());

        assert_eq!(schema.get_field("username").unwrap().kind, FieldType::String);
        assert_eq!(
            schema.get_field("groupNames").unwrap().kind,
            FieldType::Array(Box::new(FieldType::String))
        );
        assert_eq!(
            schema.get_field("tags").unwrap().kind,
            FieldType::Array(Box::new(FieldType::Any))
        );
    }

    #[test]
    fn test_virtuals_key_declares_relations() {
        let map = FieldMap::from_value(&json!({
            "groupNames": ["string"],
            "$virtuals": {
                "groups": { "ref": "Group", "local_field": "groupNames", "foreign_field": "groupname" },
                "primary": { "ref": "Group", "local_field": "groupNames", "foreign_field": "groupname", "just_one": true }
            }
        }))
        .unwrap();
        let schema = map.to_schema(&IdGenerator::default());

        assert!(!schema.has_field(VIRTUALS_KEY));
        assert_eq!(
            schema.get_virtual("groups"),
            Some(&Virtual::new("groups", "Group", "groupNames", "groupname"))
        );
        assert!(schema.get_virtual("primary").unwrap().just_one);
    }

    #[test]
    fn test_malformed_virtuals_are_rejected() {
        assert!(FieldMap::from_value(&json!({ "$virtuals": ["groups"] })).is_err());
        assert!(FieldMap::from_value(&json!({
            "$virtuals": { "groups": { "ref": "Group", "local_field": "groupNames" } }
        }))
        .is_err());
        assert!(FieldMap::from_value(&json!({
            "$virtuals": { "groups": { "ref": "Group", "local_field": "a", "foreign_field": "b", "justOne": true } }
        }))
        .is_err());
    }

    #[test]
    fn test_invalid_field_maps_are_rejected() {
        assert!(FieldMap::from_value(&json!(["string"])).is_err());
        assert!(FieldMap::from_value(&json!({ "a": 3 })).is_err());
        assert!(FieldMap::from_value(&json!({ "a": "uuid" })).is_err());
        assert!(FieldMap::from_value(&json!({ "a": { "required": true } })).is_err());
        assert!(FieldMap::from_value(&json!({ "a": { "type": "string", "requird": true } })).is_err());
        assert!(FieldMap::from_value(&json!({ "a": ["string", "number"] })).is_err());
    }

    #[test]
    fn test_validate_required_and_types() {
        let schema = Schema::new()
            .field("username", FieldDef::string().required())
            .field("groupNames", FieldDef::array_of(FieldType::String));

        let ok = json!({ "username": "u", "groupNames": ["g"] });
        assert!(schema.validate(ok.as_object().unwrap()).is_ok());

        let missing = json!({ "groupNames": [] });
        assert!(matches!(
            schema.validate(missing.as_object().unwrap()),
            Err(OdmError::Validation(_))
        ));

        let wrong = json!({ "username": "u", "groupNames": [1] });
        assert!(matches!(
            schema.validate(wrong.as_object().unwrap()),
            Err(OdmError::Validation(_))
        ));
    }
}
