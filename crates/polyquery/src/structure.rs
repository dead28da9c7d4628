//! Generic schema introspection
//!
//! Drivers run their backend's "list tables" query and hand the rows here;
//! the backend vocabulary for object kinds stays in the driver's classifier.

use crate::error::{DataError, Result};
use crate::stream::ResultStream;
use crate::types::{Row, SchemaMap, Structure, StructureType};
use std::collections::HashMap;

/// Fold `(schema, name, kind)` rows into one namespace node per schema
///
/// Schemas keep their first-seen order, as do objects within a schema, even
/// when rows for different schemas are interleaved. Kinds the classifier does
/// not know should come back as [`StructureType::None`]; such objects are kept.
/// Either the whole tree is built or an error is returned.
pub async fn extract_structure<F>(mut rows: ResultStream, classify: F) -> Result<Vec<Structure>>
where
    F: Fn(&str) -> StructureType,
{
    let mut schemas: Vec<(String, Vec<Structure>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    while rows.has_next().await {
        let row = rows.next_row().await?;
        let (schema, name, kind) = structure_row(&row)?;

        let slot = match index.get(schema) {
            Some(&slot) => slot,
            None => {
                schemas.push((schema.to_string(), Vec::new()));
                index.insert(schema.to_string(), schemas.len() - 1);
                schemas.len() - 1
            }
        };

        schemas[slot]
            .1
            .push(Structure::leaf(schema, name, classify(kind)));
    }

    Ok(schemas
        .into_iter()
        .map(|(schema, children)| Structure::namespace(schema, children))
        .collect())
}

fn structure_row(row: &Row) -> Result<(&str, &str, &str)> {
    match row.as_slice() {
        [schema, name, kind, ..] => match (schema.as_str(), name.as_str(), kind.as_str()) {
            (Some(schema), Some(name), Some(kind)) => Ok((schema, name, kind)),
            _ => Err(DataError::backend_msg(format!(
                "structure row must hold (schema, name, type) strings, got {:?}",
                row
            ))),
        },
        _ => Err(DataError::backend_msg(format!(
            "structure row must have at least 3 columns, got {}",
            row.len()
        ))),
    }
}

/// Project the tree onto schema name -> ordered leaf names
pub fn flatten_structure(structure: &[Structure]) -> SchemaMap {
    let mut map = SchemaMap::new();

    for node in structure {
        let leaves = map.entry(node.name.clone()).or_default();
        if let Some(children) = &node.children {
            collect_leaves(children, leaves);
        }
    }

    map
}

fn collect_leaves(nodes: &[Structure], out: &mut Vec<String>) {
    for node in nodes {
        match &node.children {
            Some(children) => collect_leaves(children, out),
            None => out.push(node.name.clone()),
        }
    }
}
