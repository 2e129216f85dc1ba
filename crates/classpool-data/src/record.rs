//! Raw record reader.
//!
//! Two JSON files describe a split:
//!
//! - the node file, an array of `{"nodeId": 7, "features": [..], "label": 3}`
//! - the edge file, an array indexed by class whose entries map the legacy key
//!   `"<class + 1>"` to the node IDs of that class
//!
//! ```text
//! [ {"1": [4, 9, 12]}, {"2": [1, 3]}, ... ]
//! ```
//!
//! The string keys are resolved here, so the rest of the crate only sees a
//! plain class index to neighbour list mapping.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// One labeled node as stored in the node file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "nodeId")]
    pub node_id: i64,
    pub features: Vec<f32>,
    /// 1-based class label.
    pub label: i64,
}

impl NodeRecord {
    pub fn new(node_id: i64, features: Vec<f32>, label: i64) -> Self {
        Self {
            node_id,
            features,
            label,
        }
    }
}

/// Per-class neighbour lists, indexed by 0-based class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassEdgeList {
    classes: Vec<Vec<i64>>,
}

impl ClassEdgeList {
    pub fn new(classes: Vec<Vec<i64>>) -> Self {
        Self { classes }
    }

    /// Number of classes listed.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Node IDs connected to every node of `class`; empty for unknown classes.
    pub fn neighbours(&self, class: usize) -> &[i64] {
        self.classes.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of listed neighbour IDs over all classes.
    pub fn total_neighbours(&self) -> usize {
        self.classes.iter().map(Vec::len).sum()
    }

    /// Resolve the on-disk layout, where class `c` keeps its list under `"c+1"`.
    fn from_legacy(raw: Vec<HashMap<String, Vec<i64>>>) -> Self {
        let classes = raw
            .into_iter()
            .enumerate()
            .map(|(class, mut entry)| {
                let key = (class + 1).to_string();
                entry.remove(&key).unwrap_or_else(|| {
                    debug!(class, key = %key, "edge file entry has no neighbour list");
                    Vec::new()
                })
            })
            .collect();
        Self { classes }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse the node file.
pub fn read_node_records(path: impl AsRef<Path>) -> Result<Vec<NodeRecord>> {
    read_json(path.as_ref())
}

/// Parse the edge file, requiring exactly `num_classes` class entries.
pub fn read_class_edges(path: impl AsRef<Path>, num_classes: usize) -> Result<ClassEdgeList> {
    let raw: Vec<HashMap<String, Vec<i64>>> = read_json(path.as_ref())?;
    if raw.len() != num_classes {
        return Err(Error::FormatMismatch {
            expected: num_classes,
            found: raw.len(),
        });
    }
    Ok(ClassEdgeList::from_legacy(raw))
}

/// Read both raw files of a split. The node file is read first.
pub fn read_raw(
    node_path: impl AsRef<Path>,
    edge_path: impl AsRef<Path>,
    num_classes: usize,
) -> Result<(Vec<NodeRecord>, ClassEdgeList)> {
    let records = read_node_records(node_path)?;
    let edges = read_class_edges(edge_path, num_classes)?;
    Ok((records, edges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_node_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.txt");
        fs::write(
            &path,
            r#"[{"nodeId": 1, "features": [1.0, 0.0], "label": 1},
                {"nodeId": 3, "features": [0.0, 1.5], "label": 2}]"#,
        )
        .unwrap();

        let records = read_node_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], NodeRecord::new(3, vec![0.0, 1.5], 2));
    }

    #[test]
    fn resolves_legacy_class_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.txt");
        fs::write(&path, r#"[{"1": [1, 2]}, {"2": [3]}, {"7": [9]}]"#).unwrap();

        let edges = read_class_edges(&path, 3).unwrap();
        assert_eq!(edges.num_classes(), 3);
        assert_eq!(edges.neighbours(0), &[1, 2]);
        assert_eq!(edges.neighbours(1), &[3]);
        // Wrong key: treated as no neighbours.
        assert!(edges.neighbours(2).is_empty());
        assert!(edges.neighbours(42).is_empty());
        assert_eq!(edges.total_neighbours(), 3);
    }

    #[test]
    fn class_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.txt");
        let entries: Vec<String> = (1..=10).map(|c| format!("{{\"{c}\": []}}")).collect();
        fs::write(&path, format!("[{}]", entries.join(","))).unwrap();

        let err = read_class_edges(&path, 15).unwrap_err();
        assert!(matches!(
            err,
            Error::FormatMismatch {
                expected: 15,
                found: 10
            }
        ));
    }

    #[test]
    fn malformed_fields_are_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.txt");
        fs::write(&path, r#"[{"nodeId": "one", "features": [], "label": 1}]"#).unwrap();

        assert!(matches!(
            read_node_records(&path),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_node_records(dir.path().join("absent.txt")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
