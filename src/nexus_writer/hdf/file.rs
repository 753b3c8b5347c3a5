//! The hierarchical file: a node tree persisted as a JSON document

use super::types::{DType, DataBlock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

const FORMAT_NAME: &str = "nexus-writer-hdf";
const FORMAT_VERSION: u32 = 1;

/// Reported in the `HDF5_Version` root attribute for compatibility with
/// consumers that check it.
const LIBRARY_VERSION: &str = "1.10.5";

#[derive(Debug)]
pub enum HdfError {
    AlreadyExists(PathBuf),
    Io(std::io::Error),
    Json(serde_json::Error),
    NotFound(String),
    NotAGroup(String),
    NotADataset(String),
    NameTaken(String),
    NotAppendable(String),
    Value(String),
}

impl fmt::Display for HdfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HdfError::AlreadyExists(path) => {
                write!(f, "file already exists: {}", path.display())
            }
            HdfError::Io(err) => write!(f, "file i/o error: {}", err),
            HdfError::Json(err) => write!(f, "file document error: {}", err),
            HdfError::NotFound(path) => write!(f, "no such node: {}", path),
            HdfError::NotAGroup(path) => write!(f, "not a group: {}", path),
            HdfError::NotADataset(path) => write!(f, "not a dataset: {}", path),
            HdfError::NameTaken(path) => write!(f, "node already exists: {}", path),
            HdfError::NotAppendable(path) => {
                write!(f, "dataset has no unlimited dimension: {}", path)
            }
            HdfError::Value(msg) => write!(f, "bad value: {}", msg),
        }
    }
}

impl Error for HdfError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HdfError::Io(err) => Some(err),
            HdfError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HdfError {
    fn from(err: std::io::Error) -> Self {
        HdfError::Io(err)
    }
}

impl From<serde_json::Error> for HdfError {
    fn from(err: serde_json::Error) -> Self {
        HdfError::Json(err)
    }
}

/// Attributes attached to a group or dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, serde_json::Value>);

impl Attributes {
    pub fn insert(&mut self, name: &str, value: serde_json::Value) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dtype: DType,
    /// First dimension is the row count for unlimited datasets.
    pub shape: Vec<usize>,
    pub unlimited: bool,
    /// Unlimited datasets are stored chunked.
    pub chunked: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub string_size: Option<usize>,
    pub data: DataBlock,
    #[serde(skip_serializing_if = "Attributes::is_empty", default)]
    pub attributes: Attributes,
}

impl Dataset {
    /// Elements per appended row: the product of the fixed dimensions.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>().max(1)
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub children: BTreeMap<String, Node>,
    #[serde(skip_serializing_if = "Attributes::is_empty", default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node")]
pub enum Node {
    #[serde(rename = "group")]
    Group(Group),
    #[serde(rename = "dataset")]
    Dataset(Dataset),
    #[serde(rename = "link")]
    Link { target: String },
}

#[derive(Serialize, Deserialize)]
struct Document {
    format: String,
    version: u32,
    root: Group,
}

/// One hierarchical data file. Not thread-safe: ownership is handed to the
/// file sink's writer thread right after creation.
#[derive(Debug)]
pub struct HdfFile {
    path: PathBuf,
    root: Group,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Joins a `../`-style relative target onto its parent group path,
/// producing an absolute path.
pub fn absolute_target(parent: &str, target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    let mut parts: Vec<&str> = split_path(parent);
    for component in target.split('/').filter(|s| !s.is_empty()) {
        if component == ".." {
            parts.pop();
        } else if component != "." {
            parts.push(component);
        }
    }
    format!("/{}", parts.join("/"))
}

impl HdfFile {
    /// Creates a new file on disk. Fails if the path already exists; a file
    /// is never overwritten.
    pub fn create(path: &Path) -> Result<HdfFile, HdfError> {
        if path.exists() {
            return Err(HdfError::AlreadyExists(path.to_path_buf()));
        }
        let mut root = Group::default();
        root.attributes
            .insert("HDF5_Version", serde_json::Value::String(LIBRARY_VERSION.to_string()));
        let file_time = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string();
        root.attributes
            .insert("file_time", serde_json::Value::String(file_time));
        let file = HdfFile {
            path: path.to_path_buf(),
            root,
        };
        // Claim the path immediately so a concurrent job cannot take it.
        let handle = OpenOptions::new().write(true).create_new(true).open(path)?;
        drop(handle);
        file.save()?;
        Ok(file)
    }

    /// Reopens an existing file read-write, for the deferred-link pass.
    pub fn open(path: &Path) -> Result<HdfFile, HdfError> {
        let reader = BufReader::new(File::open(path)?);
        let document: Document = serde_json::from_reader(reader)?;
        Ok(HdfFile {
            path: path.to_path_buf(),
            root: document.root,
        })
    }

    /// Writes the current tree out to disk.
    pub fn save(&self) -> Result<(), HdfError> {
        let writer = BufWriter::new(File::create(&self.path)?);
        let document = Document {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
            root: self.root.clone(),
        };
        serde_json::to_writer_pretty(writer, &document)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Looks a node up by absolute path, following links (bounded, so a
    /// link cycle cannot spin forever).
    pub fn resolve(&self, path: &str) -> Option<&Node> {
        let mut current = path.to_string();
        for _ in 0..16 {
            match self.resolve_no_follow(&current)? {
                Node::Link { target } => {
                    let parent = parent_path(&current);
                    current = absolute_target(&parent, target);
                }
                node => return Some(node),
            }
        }
        None
    }

    /// Looks a node up by absolute path without following links.
    pub fn resolve_no_follow(&self, path: &str) -> Option<&Node> {
        let parts = split_path(path);
        if parts.is_empty() {
            return None;
        }
        let mut group = &self.root;
        for (i, part) in parts.iter().enumerate() {
            let node = group.children.get(*part)?;
            if i == parts.len() - 1 {
                return Some(node);
            }
            match node {
                Node::Group(g) => group = g,
                _ => return None,
            }
        }
        None
    }

    fn group_mut(&mut self, path: &str) -> Result<&mut Group, HdfError> {
        let parts = split_path(path);
        let mut group = &mut self.root;
        for part in parts {
            let node = group
                .children
                .get_mut(part)
                .ok_or_else(|| HdfError::NotFound(path.to_string()))?;
            match node {
                Node::Group(g) => group = g,
                _ => return Err(HdfError::NotAGroup(path.to_string())),
            }
        }
        Ok(group)
    }

    /// Creates a group, creating missing parents on the way.
    pub fn create_group(&mut self, path: &str) -> Result<(), HdfError> {
        let parts = split_path(path);
        let mut group = &mut self.root;
        for part in parts {
            let entry = group
                .children
                .entry(part.to_string())
                .or_insert_with(|| Node::Group(Group::default()));
            match entry {
                Node::Group(g) => group = g,
                _ => return Err(HdfError::NameTaken(path.to_string())),
            }
        }
        Ok(())
    }

    /// Creates a dataset under an existing group. `shape` carries the fixed
    /// dimensions; for unlimited datasets the first dimension starts at 0.
    pub fn create_dataset(
        &mut self,
        path: &str,
        dtype: DType,
        shape: Vec<usize>,
        unlimited: bool,
        string_size: Option<usize>,
    ) -> Result<(), HdfError> {
        let parent = parent_path(path);
        let name = leaf_name(path).ok_or_else(|| HdfError::NotFound(path.to_string()))?;
        let group = self.group_mut(&parent)?;
        if group.children.contains_key(name) {
            return Err(HdfError::NameTaken(path.to_string()));
        }
        let dataset = Dataset {
            dtype,
            shape,
            unlimited,
            chunked: unlimited,
            string_size,
            data: DataBlock::empty_for(dtype),
            attributes: Attributes::default(),
        };
        group
            .children
            .insert(name.to_string(), Node::Dataset(dataset));
        Ok(())
    }

    pub fn dataset(&self, path: &str) -> Result<&Dataset, HdfError> {
        match self.resolve(path) {
            Some(Node::Dataset(d)) => Ok(d),
            Some(_) => Err(HdfError::NotADataset(path.to_string())),
            None => Err(HdfError::NotFound(path.to_string())),
        }
    }

    pub fn dataset_mut(&mut self, path: &str) -> Result<&mut Dataset, HdfError> {
        let parent = parent_path(path);
        let name = leaf_name(path).ok_or_else(|| HdfError::NotFound(path.to_string()))?;
        let group = self.group_mut(&parent)?;
        match group.children.get_mut(name) {
            Some(Node::Dataset(d)) => Ok(d),
            Some(_) => Err(HdfError::NotADataset(path.to_string())),
            None => Err(HdfError::NotFound(path.to_string())),
        }
    }

    /// Replaces the contents of a dataset with a fully populated blob, as
    /// the template walk does for static values.
    pub fn set_values(
        &mut self,
        path: &str,
        data: DataBlock,
        shape: Vec<usize>,
    ) -> Result<(), HdfError> {
        let dataset = self.dataset_mut(path)?;
        dataset.data = data;
        dataset.shape = shape;
        Ok(())
    }

    /// Appends one row to an unlimited dataset and returns its row index.
    pub fn append_row(&mut self, path: &str, row: &DataBlock) -> Result<usize, HdfError> {
        let dataset = self.dataset_mut(path)?;
        if !dataset.unlimited {
            return Err(HdfError::NotAppendable(path.to_string()));
        }
        let row_len = dataset.row_len();
        if row.len() != row_len {
            return Err(HdfError::Value(format!(
                "append of {} elements into rows of {} at {}",
                row.len(),
                row_len,
                path
            )));
        }
        dataset.data.extend(row).map_err(HdfError::Value)?;
        let index = dataset.rows();
        if dataset.shape.is_empty() {
            dataset.shape.push(0);
        }
        dataset.shape[0] = index + 1;
        Ok(index)
    }

    /// Writes one attribute on an existing group or dataset.
    pub fn write_attribute(
        &mut self,
        path: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), HdfError> {
        if split_path(path).is_empty() {
            self.root.attributes.insert(name, value);
            return Ok(());
        }
        let parent = parent_path(path);
        let leaf = leaf_name(path).ok_or_else(|| HdfError::NotFound(path.to_string()))?;
        let group = self.group_mut(&parent)?;
        match group.children.get_mut(leaf) {
            Some(Node::Group(g)) => g.attributes.insert(name, value),
            Some(Node::Dataset(d)) => d.attributes.insert(name, value),
            Some(Node::Link { .. }) => return Err(HdfError::NotAGroup(path.to_string())),
            None => return Err(HdfError::NotFound(path.to_string())),
        }
        Ok(())
    }

    /// Materialises a link node. The target must already exist; callers
    /// resolve `../` prefixes with [`absolute_target`] first.
    pub fn add_link(&mut self, parent: &str, name: &str, target_abs: &str) -> Result<(), HdfError> {
        if self.resolve_no_follow(target_abs).is_none() {
            return Err(HdfError::NotFound(target_abs.to_string()));
        }
        let group = self.group_mut(parent)?;
        if group.children.contains_key(name) {
            return Err(HdfError::NameTaken(format!("{}/{}", parent, name)));
        }
        group.children.insert(
            name.to_string(),
            Node::Link {
                target: target_abs.to_string(),
            },
        );
        Ok(())
    }

    /// All absolute paths in the tree, depth-first. Initialization is
    /// deterministic, so two walks of the same template produce the same
    /// list.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.root, "", &mut out);
        out
    }
}

fn collect_paths(group: &Group, prefix: &str, out: &mut Vec<String>) {
    for (name, node) in &group.children {
        let path = format!("{}/{}", prefix, name);
        out.push(path.clone());
        if let Node::Group(g) = node {
            collect_paths(g, &path, out);
        }
    }
}

fn parent_path(path: &str) -> String {
    let parts = split_path(path);
    if parts.len() <= 1 {
        "/".to_string()
    } else {
        format!("/{}", parts[..parts.len() - 1].join("/"))
    }
}

fn leaf_name(path: &str) -> Option<&str> {
    split_path(path).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_path(stem: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "nexus-writer-hdf-{}-{}-{}.json",
            stem,
            std::process::id(),
            n
        ))
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let path = scratch_path("overwrite");
        let _file = HdfFile::create(&path).unwrap();
        match HdfFile::create(&path) {
            Err(HdfError::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn root_attributes_are_written_at_creation() {
        let path = scratch_path("rootattrs");
        let file = HdfFile::create(&path).unwrap();
        assert!(file.root().attributes.contains("HDF5_Version"));
        assert!(file.root().attributes.contains("file_time"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn append_returns_row_indices() {
        let path = scratch_path("append");
        let mut file = HdfFile::create(&path).unwrap();
        file.create_group("/entry").unwrap();
        file.create_dataset("/entry/time", DType::UInt64, vec![0], true, None)
            .unwrap();
        assert_eq!(
            file.append_row("/entry/time", &DataBlock::UInt(vec![10])).unwrap(),
            0
        );
        assert_eq!(
            file.append_row("/entry/time", &DataBlock::UInt(vec![20])).unwrap(),
            1
        );
        assert_eq!(file.dataset("/entry/time").unwrap().rows(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn two_dimensional_append_checks_row_width() {
        let path = scratch_path("append2d");
        let mut file = HdfFile::create(&path).unwrap();
        file.create_group("/entry").unwrap();
        file.create_dataset("/entry/value", DType::Double, vec![0, 3], true, None)
            .unwrap();
        file.append_row("/entry/value", &DataBlock::Float(vec![1.0, 2.0, 3.0]))
            .unwrap();
        assert!(file
            .append_row("/entry/value", &DataBlock::Float(vec![1.0]))
            .is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn save_and_open_round_trip() {
        let path = scratch_path("roundtrip");
        let mut file = HdfFile::create(&path).unwrap();
        file.create_group("/entry/instrument").unwrap();
        file.create_dataset("/entry/n", DType::Int32, Vec::new(), false, None)
            .unwrap();
        file.set_values("/entry/n", DataBlock::Int(vec![42]), Vec::new())
            .unwrap();
        file.save().unwrap();

        let reopened = HdfFile::open(&path).unwrap();
        let dataset = reopened.dataset("/entry/n").unwrap();
        assert_eq!(dataset.data, DataBlock::Int(vec![42]));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn links_resolve_relative_targets() {
        let path = scratch_path("links");
        let mut file = HdfFile::create(&path).unwrap();
        file.create_group("/entry/instrument/detector").unwrap();
        let target = absolute_target("/entry/links", "../instrument/detector");
        assert_eq!(target, "/entry/instrument/detector");
        file.create_group("/entry/links").unwrap();
        file.add_link("/entry/links", "det", &target).unwrap();
        assert!(matches!(
            file.resolve("/entry/links/det"),
            Some(Node::Group(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn link_to_missing_target_is_rejected() {
        let path = scratch_path("badlink");
        let mut file = HdfFile::create(&path).unwrap();
        file.create_group("/entry").unwrap();
        assert!(file.add_link("/entry", "nowhere", "/does/not/exist").is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
