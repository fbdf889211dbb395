//! Graph object model.
//!
//! Entities are graph nodes; relationships are edges that additionally name
//! the entities they connect. Both carry the three reserved properties every
//! consumer of the graph relies on:
//!
//! - `_key`: unique across the whole run
//! - `_type`: the discriminator used for indexing and filtering
//! - `_class`: one or more classifications
//!
//! Everything else lives in a free-form property map. The serde field names
//! match the persisted JSON layout, so objects round-trip through graph files
//! unchanged. Properties are flattened next to the reserved fields, so a
//! property may never reuse a reserved name; stores refuse such objects.
//!
//! Objects are immutable once handed to a store; stores share them as
//! `Arc<Entity>` / `Arc<Relationship>`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// One or many `_class` values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphObjectClass {
    One(String),
    Many(Vec<String>),
}

impl GraphObjectClass {
    /// Returns the classes as a slice-like iterator regardless of arity.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            GraphObjectClass::One(class) => std::slice::from_ref(class),
            GraphObjectClass::Many(classes) => classes,
        };
        values.iter().map(String::as_str)
    }
}

impl From<&str> for GraphObjectClass {
    fn from(class: &str) -> Self {
        GraphObjectClass::One(class.to_string())
    }
}

impl From<String> for GraphObjectClass {
    fn from(class: String) -> Self {
        GraphObjectClass::One(class)
    }
}

impl From<Vec<String>> for GraphObjectClass {
    fn from(classes: Vec<String>) -> Self {
        GraphObjectClass::Many(classes)
    }
}

/// Field names an [`Entity`] serializes itself.
pub const ENTITY_RESERVED_PROPERTIES: &[&str] = &["_key", "_type", "_class"];

/// Field names a [`Relationship`] serializes itself.
pub const RELATIONSHIP_RESERVED_PROPERTIES: &[&str] = &[
    "_key",
    "_type",
    "_class",
    "_fromEntityKey",
    "_toEntityKey",
    "_mapping",
];

/// Shared read access to the reserved properties of entities and relationships.
pub trait GraphObject: Serialize + Send + Sync + 'static {
    /// The run-unique `_key`.
    fn key(&self) -> &str;

    /// The `_type` discriminator.
    fn object_type(&self) -> &str;

    /// The first free-form property that shadows a reserved field, if any.
    ///
    /// Such an object serializes with a duplicate field and cannot be read
    /// back from a graph file.
    fn reserved_property(&self) -> Option<&str>;
}

fn first_reserved<'a>(properties: &'a Map<String, Value>, reserved: &[&str]) -> Option<&'a str> {
    properties
        .keys()
        .map(String::as_str)
        .find(|name| reserved.contains(name))
}

/// A graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_type")]
    pub object_type: String,
    #[serde(rename = "_class")]
    pub class: GraphObjectClass,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Entity {
    /// Creates an entity with no extra properties.
    pub fn new(
        key: impl Into<String>,
        object_type: impl Into<String>,
        class: impl Into<GraphObjectClass>,
    ) -> Self {
        Self {
            key: key.into(),
            object_type: object_type.into(),
            class: class.into(),
            properties: Map::new(),
        }
    }

    /// Adds a property, replacing any previous value under the same name.
    ///
    /// Reserved names (`_key`, `_type`, `_class`) are ignored; set the
    /// fields instead.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !ENTITY_RESERVED_PROPERTIES.contains(&name.as_str()) {
            self.properties.insert(name, value.into());
        }
        self
    }

    /// Returns a property value by name.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

impl GraphObject for Entity {
    fn key(&self) -> &str {
        &self.key
    }

    fn object_type(&self) -> &str {
        &self.object_type
    }

    fn reserved_property(&self) -> Option<&str> {
        first_reserved(&self.properties, ENTITY_RESERVED_PROPERTIES)
    }
}

/// A graph edge.
///
/// Direct relationships carry both endpoint keys. Mapped relationships leave
/// them empty and describe the target through `_mapping` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_type")]
    pub object_type: String,
    #[serde(rename = "_class")]
    pub class: GraphObjectClass,
    #[serde(
        rename = "_fromEntityKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub from_entity_key: Option<String>,
    #[serde(
        rename = "_toEntityKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub to_entity_key: Option<String>,
    #[serde(rename = "_mapping", default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Relationship {
    /// Creates a direct relationship between two entity keys.
    pub fn direct(
        key: impl Into<String>,
        object_type: impl Into<String>,
        class: impl Into<GraphObjectClass>,
        from_entity_key: impl Into<String>,
        to_entity_key: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            object_type: object_type.into(),
            class: class.into(),
            from_entity_key: Some(from_entity_key.into()),
            to_entity_key: Some(to_entity_key.into()),
            mapping: None,
            properties: Map::new(),
        }
    }

    /// Creates a mapped relationship described by a `_mapping` document.
    pub fn mapped(
        key: impl Into<String>,
        object_type: impl Into<String>,
        class: impl Into<GraphObjectClass>,
        mapping: Value,
    ) -> Self {
        Self {
            key: key.into(),
            object_type: object_type.into(),
            class: class.into(),
            from_entity_key: None,
            to_entity_key: None,
            mapping: Some(mapping),
            properties: Map::new(),
        }
    }

    /// Adds a property, replacing any previous value under the same name.
    /// Reserved names are ignored.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !RELATIONSHIP_RESERVED_PROPERTIES.contains(&name.as_str()) {
            self.properties.insert(name, value.into());
        }
        self
    }

    /// Returns true for relationships described by `_mapping`.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

impl GraphObject for Relationship {
    fn key(&self) -> &str {
        &self.key
    }

    fn object_type(&self) -> &str {
        &self.object_type
    }

    fn reserved_property(&self) -> Option<&str> {
        first_reserved(&self.properties, RELATIONSHIP_RESERVED_PROPERTIES)
    }
}

/// Selects graph objects by `_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphObjectFilter {
    pub object_type: String,
}

impl GraphObjectFilter {
    pub fn of_type(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
        }
    }
}

/// One unit of flushed data handed to an uploader.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushedGraphObjectData {
    pub entities: Vec<Arc<Entity>>,
    pub relationships: Vec<Arc<Relationship>>,
}

impl FlushedGraphObjectData {
    pub fn entities(entities: Vec<Arc<Entity>>) -> Self {
        Self {
            entities,
            relationships: Vec::new(),
        }
    }

    pub fn relationships(relationships: Vec<Arc<Relationship>>) -> Self {
        Self {
            entities: Vec::new(),
            relationships,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }

    /// Returns the distinct `_type`s in this batch, sorted.
    pub fn object_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entities
            .iter()
            .map(|e| e.object_type.clone())
            .chain(self.relationships.iter().map(|r| r.object_type.clone()))
            .collect();
        types.sort();
        types.dedup();
        types
    }
}
