//! Depth-first walk of the file-structure template
//!
//! The walk materialises every static node (groups, datasets, attributes),
//! collects a placeholder for every `stream` node and defers `link` nodes to
//! the finalize pass, because a link may target a node that does not exist
//! yet at the time the walk reaches it. Unknown node types are ignored.
//! Errors creating a node are logged and the node is skipped; the walk
//! always continues so the file is never left half-torn.

use crate::nexus_writer::hdf::{flatten_values, DType, HdfFile};
use log::{debug, warn};
use serde_json::Value;

/// A `stream` node found in the template: the group that the writer module
/// will own, the topic + source it is fed from, and the raw configuration
/// passed verbatim to the module.
#[derive(Debug, Clone)]
pub struct StreamPlaceholder {
    /// Absolute path of the group the stream node sits in.
    pub path: String,
    pub topic: String,
    pub source_name: String,
    /// The writer-module id; by convention the 4-byte payload schema tag.
    pub writer_module: String,
    /// Raw stream configuration sub-object, opaque to the engine.
    pub config: Value,
    /// Attributes the writer module must write into its group.
    pub attributes: Option<Value>,
}

/// A `link` node held back until finalize.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredLink {
    pub parent: String,
    pub name: String,
    pub target: String,
}

/// Walks the template and creates the static tree. Deterministic: the same
/// template yields the same set of created paths and the same placeholders.
pub fn walk_template(
    file: &mut HdfFile,
    template: &Value,
) -> (Vec<StreamPlaceholder>, Vec<DeferredLink>) {
    let mut placeholders = Vec::new();
    let mut links = Vec::new();
    walk_children(file, "", template, &mut placeholders, &mut links);
    (placeholders, links)
}

fn walk_children(
    file: &mut HdfFile,
    parent: &str,
    node: &Value,
    placeholders: &mut Vec<StreamPlaceholder>,
    links: &mut Vec<DeferredLink>,
) {
    let children = match node.get("children").and_then(Value::as_array) {
        Some(children) => children,
        None => return,
    };
    for child in children {
        walk_node(file, parent, child, placeholders, links);
    }
}

fn walk_node(
    file: &mut HdfFile,
    parent: &str,
    node: &Value,
    placeholders: &mut Vec<StreamPlaceholder>,
    links: &mut Vec<DeferredLink>,
) {
    let node_type = node.get("type").and_then(Value::as_str).unwrap_or("");
    match node_type {
        "group" => walk_group(file, parent, node, placeholders, links),
        "dataset" => create_dataset(file, parent, node),
        "stream" => collect_stream(parent, node, placeholders),
        "link" => collect_link(parent, node, links),
        other => {
            debug!("Ignoring template node of unknown type \"{}\" under {}", other, parent);
        }
    }
}

fn walk_group(
    file: &mut HdfFile,
    parent: &str,
    node: &Value,
    placeholders: &mut Vec<StreamPlaceholder>,
    links: &mut Vec<DeferredLink>,
) {
    let name = match node.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name,
        _ => {
            warn!("Skipping group without a name under {}", parent);
            return;
        }
    };
    let path = format!("{}/{}", parent, name);
    if let Err(e) = file.create_group(&path) {
        warn!("Failed to create group {}: {}", path, e);
        return;
    }
    write_attributes(file, &path, node.get("attributes"));
    walk_children(file, &path, node, placeholders, links);
}

fn create_dataset(file: &mut HdfFile, parent: &str, node: &Value) {
    let name = match node.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name,
        _ => {
            warn!("Skipping dataset without a name under {}", parent);
            return;
        }
    };
    let path = format!("{}/{}", parent, name);
    let descriptor = node.get("dataset").cloned().unwrap_or(Value::Null);

    let dtype_name = descriptor
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("double");
    let dtype = match DType::parse(dtype_name) {
        Some(dtype) => dtype,
        None => {
            warn!("Skipping dataset {} with unknown dtype \"{}\"", path, dtype_name);
            return;
        }
    };
    let string_size = descriptor
        .get("string_size")
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    // A first dimension of "unlimited" makes the dataset appendable and
    // chunked; everything else is a fixed dimension.
    let mut unlimited = false;
    let mut fixed_dims: Vec<usize> = Vec::new();
    if let Some(size) = descriptor.get("size").and_then(Value::as_array) {
        for (i, dim) in size.iter().enumerate() {
            if i == 0 && dim.as_str() == Some("unlimited") {
                unlimited = true;
                fixed_dims.push(0);
            } else if let Some(n) = dim.as_u64() {
                fixed_dims.push(n as usize);
            } else {
                warn!("Skipping dataset {} with bad size entry {}", path, dim);
                return;
            }
        }
    }

    if let Err(e) = file.create_dataset(&path, dtype, fixed_dims, unlimited, string_size) {
        warn!("Failed to create dataset {}: {}", path, e);
        return;
    }

    if let Some(values) = node.get("values") {
        match flatten_values(values, dtype, string_size) {
            Ok((block, shape)) => {
                if let Err(e) = file.set_values(&path, block, shape) {
                    warn!("Failed to populate dataset {}: {}", path, e);
                }
            }
            Err(e) => warn!("Failed to populate dataset {}: {}", path, e),
        }
    }
    write_attributes(file, &path, node.get("attributes"));
}

fn collect_stream(parent: &str, node: &Value, placeholders: &mut Vec<StreamPlaceholder>) {
    // Stream configuration either sits in a "stream" sub-object or directly
    // on the node.
    let config = node.get("stream").unwrap_or(node).clone();
    let topic = config.get("topic").and_then(Value::as_str);
    let source = config.get("source").and_then(Value::as_str);
    let writer_module = config.get("writer_module").and_then(Value::as_str);
    match (topic, source, writer_module) {
        (Some(topic), Some(source), Some(writer_module)) => {
            placeholders.push(StreamPlaceholder {
                path: parent.to_string(),
                topic: topic.to_string(),
                source_name: source.to_string(),
                writer_module: writer_module.to_string(),
                config,
                attributes: node.get("attributes").cloned(),
            });
        }
        _ => {
            warn!(
                "Skipping stream node under {}: topic, source and writer_module are required",
                parent
            );
        }
    }
}

fn collect_link(parent: &str, node: &Value, links: &mut Vec<DeferredLink>) {
    let name = node.get("name").and_then(Value::as_str);
    let target = node.get("target").and_then(Value::as_str);
    match (name, target) {
        (Some(name), Some(target)) => links.push(DeferredLink {
            parent: parent.to_string(),
            name: name.to_string(),
            target: target.to_string(),
        }),
        _ => warn!("Skipping link node under {}: name and target are required", parent),
    }
}

/// Attributes come either as a plain `{name: value}` object or as an array
/// of `{name, values}` entries; the array form allows attributes that are
/// themselves arrays.
fn write_attributes(file: &mut HdfFile, path: &str, attributes: Option<&Value>) {
    let attributes = match attributes {
        Some(a) => a,
        None => return,
    };
    if let Some(object) = attributes.as_object() {
        for (name, value) in object {
            if let Err(e) = file.write_attribute(path, name, value.clone()) {
                warn!("Failed to write attribute {} on {}: {}", name, path, e);
            }
        }
    } else if let Some(entries) = attributes.as_array() {
        for entry in entries {
            let name = entry.get("name").and_then(Value::as_str);
            let value = entry.get("values").or_else(|| entry.get("value"));
            match (name, value) {
                (Some(name), Some(value)) => {
                    if let Err(e) = file.write_attribute(path, name, value.clone()) {
                        warn!("Failed to write attribute {} on {}: {}", name, path, e);
                    }
                }
                _ => warn!("Skipping malformed attribute entry on {}", path),
            }
        }
    }
}
