use crate::Result;
use chrono::Datelike;
use mnemon_types::Node;
use std::path::{Path, PathBuf};

/// Write-one-read-many JSON document tree, one file per node version:
/// `nodes/YYYY/MM/<nodeId>-v<version>.json`.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

/// Components extracted from a document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRef {
    pub node_id: String,
    pub version: i64,
    pub year: i32,
    pub month: u32,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, node: &Node) -> PathBuf {
        let at = node.metadata.analyzed_at;
        self.root
            .join("nodes")
            .join(format!("{:04}", at.year()))
            .join(format!("{:02}", at.month()))
            .join(format!("{}-v{}.json", node.node_id, node.version))
    }

    /// Persist one node version. The write goes to a temp file first and is
    /// renamed into place so readers never observe a torn document.
    pub fn write(&self, node: &Node) -> Result<PathBuf> {
        let path = self.path_for(node);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(node)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        Ok(path)
    }

    pub fn read(&self, path: &Path) -> Result<Node> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Find the document for `(node_id, version)` anywhere in the tree.
    pub fn find(&self, node_id: &str, version: i64) -> Result<Option<Node>> {
        let needle = format!("{}-v{}.json", node_id, version);
        for entry in walkdir::WalkDir::new(self.root.join("nodes"))
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy() == needle.as_str()
            {
                return self.read(entry.path()).map(Some);
            }
        }
        Ok(None)
    }

    /// All document paths in the tree, unordered.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let nodes_root = self.root.join("nodes");
        if !nodes_root.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in walkdir::WalkDir::new(&nodes_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().map(|e| e == "json").unwrap_or(false)
                && parse_doc_path(path).is_some()
            {
                paths.push(path.to_path_buf());
            }
        }
        Ok(paths)
    }

    /// Latest version per node id, from filenames alone.
    pub fn latest_versions(&self) -> Result<Vec<(String, i64, PathBuf)>> {
        let mut latest: std::collections::HashMap<String, (i64, PathBuf)> =
            std::collections::HashMap::new();

        for path in self.list()? {
            if let Some(doc) = parse_doc_path(&path) {
                let entry = latest.entry(doc.node_id.clone()).or_insert((doc.version, path.clone()));
                if doc.version > entry.0 {
                    *entry = (doc.version, path.clone());
                }
            }
        }

        Ok(latest
            .into_iter()
            .map(|(id, (version, path))| (id, version, path))
            .collect())
    }
}

/// Parse `.../nodes/YYYY/MM/<nodeId>-v<version>.json` into its components.
pub fn parse_doc_path(path: &Path) -> Option<DocRef> {
    let file_name = path.file_stem()?.to_str()?;
    let (node_id, version_part) = file_name.rsplit_once("-v")?;
    let version: i64 = version_part.parse().ok()?;
    if node_id.len() != 16 || !node_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let month_dir = path.parent()?.file_name()?.to_str()?;
    let year_dir = path.parent()?.parent()?.file_name()?.to_str()?;
    let month: u32 = month_dir.parse().ok()?;
    let year: i32 = year_dir.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }

    Some(DocRef {
        node_id: node_id.to_string(),
        version,
        year,
        month,
    })
}
