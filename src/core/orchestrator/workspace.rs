use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;

use crate::core::tools::files::{FileEntry, scan_workspace};

/// File inventory at one point in the run.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub entries: Vec<FileEntry>,
}

impl Inventory {
    pub async fn scan(root: &Path) -> Result<Self> {
        Ok(Self {
            entries: scan_workspace(root).await?,
        })
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Section body for the decision prompt.
    pub fn describe(&self) -> String {
        if self.entries.is_empty() {
            return "(No files in workspace yet)".to_string();
        }
        self.entries
            .iter()
            .map(|f| {
                format!(
                    "- {} ({} bytes, modified: {})",
                    f.name, f.size_bytes, f.modified_time
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Names present in `after` but not here, sorted.
    pub fn created_since(&self, after: &Inventory) -> Vec<String> {
        let before = self.names();
        after
            .names()
            .into_iter()
            .filter(|n| !before.contains(n))
            .collect()
    }
}

/// Appends the existing-file note that biases delegated agents toward reuse.
pub fn with_existing_files(task: &str, existing: &BTreeSet<String>) -> String {
    if existing.is_empty() {
        return task.to_string();
    }
    let list = existing
        .iter()
        .map(|n| format!("- {}", n))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}\n\nNOTE: The following files already exist in the workspace:\n{}\nReuse existing artifacts when possible and avoid duplicate downloads or creations.",
        task, list
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn diff_and_description() {
        let dir = tempfile::tempdir().unwrap();
        let empty = Inventory::scan(dir.path()).await.unwrap();
        assert_eq!(empty.describe(), "(No files in workspace yet)");

        std::fs::write(dir.path().join("a.csv"), "1,2").unwrap();
        std::fs::create_dir(dir.path().join("charts")).unwrap();
        std::fs::write(dir.path().join("charts/p.png"), "x").unwrap();
        let after = Inventory::scan(dir.path()).await.unwrap();

        assert_eq!(empty.created_since(&after), vec!["a.csv", "charts/p.png"]);
        assert!(after.describe().contains("- a.csv (3 bytes, modified: "));
        assert!(after.contains("charts/p.png"));
    }

    #[test]
    fn reuse_note_lists_files() {
        let files: BTreeSet<String> = ["b.md", "a.csv"].iter().map(|s| s.to_string()).collect();
        let task = with_existing_files("Do it", &files);
        assert!(task.starts_with("Do it\n\nNOTE: The following files already exist"));
        assert!(task.contains("- a.csv\n- b.md"));
        assert_eq!(with_existing_files("Do it", &BTreeSet::new()), "Do it");
    }
}
