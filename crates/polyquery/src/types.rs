use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A column of a query result or a table
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Declared type as reported by the backend
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// One result row, positionally aligned with the stream's columns
pub type Row = Vec<serde_json::Value>;

/// Addresses a single table when asking for its columns or helper queries
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TableOptions {
    pub schema: String,
    pub table: String,
}

impl TableOptions {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Kind of a node in the structure tree
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureType {
    /// Namespace node or an object whose backend kind is not recognised
    #[default]
    None,
    Table,
    View,
    MaterializedView,
    StreamingTable,
    Managed,
}

impl fmt::Display for StructureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructureType::None => write!(f, "none"),
            StructureType::Table => write!(f, "table"),
            StructureType::View => write!(f, "view"),
            StructureType::MaterializedView => write!(f, "materialized_view"),
            StructureType::StreamingTable => write!(f, "streaming_table"),
            StructureType::Managed => write!(f, "managed"),
        }
    }
}

/// Normalized node of the schema introspection tree
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Display name of the node
    pub name: String,
    /// Schema the node belongs to (the node's own name for schema nodes)
    pub schema: String,
    #[serde(rename = "type")]
    pub structure_type: StructureType,
    /// Nested nodes, `None` for leaves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Structure>>,
}

impl Structure {
    /// Create a leaf node for an object inside `schema`
    pub fn leaf(
        schema: impl Into<String>,
        name: impl Into<String>,
        structure_type: StructureType,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            structure_type,
            children: None,
        }
    }

    /// Create a namespace node holding `children`
    pub fn namespace(name: impl Into<String>, children: Vec<Structure>) -> Self {
        let name = name.into();
        Self {
            schema: name.clone(),
            name,
            structure_type: StructureType::None,
            children: Some(children),
        }
    }
}

/// Current catalog plus everything the connection could switch to
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DatabaseList {
    pub current: String,
    pub available: Vec<String>,
}

/// Flattened structure: schema name to the ordered object names inside it
pub type SchemaMap = HashMap<String, Vec<String>>;
