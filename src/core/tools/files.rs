use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::AsyncWriteExt;

use super::{Tool, ToolOutput, str_arg};
use crate::core::protocol::{ToolDefinition, ToolParameter};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified_time: f64,
}

/// Resolves `filename` beneath `root`, refusing absolute paths and `..`.
/// A leading `workspaces/` segment is dropped so agents that echo the
/// workspace prefix do not create nested workspaces.
pub fn confined_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let trimmed = filename.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        bail!("Empty filename");
    }
    let mut relative = PathBuf::new();
    for (i, component) in Path::new(trimmed).components().enumerate() {
        match component {
            Component::Normal(part) => {
                if i == 0 && part == "workspaces" {
                    continue;
                }
                relative.push(part);
            }
            Component::CurDir => {}
            _ => bail!("Invalid file path '{}': outside the workspace", filename),
        }
    }
    if relative.as_os_str().is_empty() {
        bail!("Invalid file path '{}'", filename);
    }
    Ok(root.join(relative))
}

/// Every file under `root`, newest first, names relative with `/` separators.
pub async fn scan_workspace(root: &Path) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let path = entry.path();
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let modified_time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            files.push(FileEntry {
                name,
                size_bytes: meta.len(),
                modified_time,
            });
        }
    }
    files.sort_by(|a, b| {
        b.modified_time
            .total_cmp(&a.modified_time)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(files)
}

pub struct FileSaverTool {
    root: PathBuf,
}

impl FileSaverTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for FileSaverTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "file_saver".to_string(),
            description: "Writes content to a workspace file. Creates parent directories if needed. \
                Optionally appends when the target file already exists. When saving iterative \
                artifacts within the same session, prefer versioned filenames (e.g., v1, v2) \
                so previous outputs remain accessible."
                .to_string(),
            parameters: vec![
                ToolParameter::required(
                    "filename",
                    "string",
                    "The name of the file (can include subdirectories)",
                ),
                ToolParameter::required("content", "string", "The content to write to the file"),
                ToolParameter::optional(
                    "append",
                    "boolean",
                    "Set to true to append to the file when it already exists",
                )
                .with_default(json!(false)),
            ],
        }
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let filename = str_arg(&args, "filename")?;
        let content = str_arg(&args, "content")?;
        let append = args.get("append").and_then(Value::as_bool).unwrap_or(false);

        let path = confined_path(&self.root, filename)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(|e| anyhow!("Failed to save file: {}", e))?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        let rel = path
            .strip_prefix(&self.root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        Ok(ToolOutput::new(json!({
            "file_path": rel,
            "size_bytes": content.len(),
            "append": append,
        }))
        .with_artifacts(vec![rel]))
    }
}

pub struct FileSystemScannerTool {
    root: PathBuf,
}

impl FileSystemScannerTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for FileSystemScannerTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "file_system_scanner".to_string(),
            description: "Scans the workspace and returns every file with its metadata \
                (name, size, modification time), newest first."
                .to_string(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput> {
        let files = scan_workspace(&self.root).await?;
        Ok(ToolOutput::new(serde_json::to_value(files)?))
    }
}

pub struct FindInFileTool {
    root: PathBuf,
}

impl FindInFileTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for FindInFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "find_in_file".to_string(),
            description: "Search for specific content within a workspace file. \
                Returns matching lines with context."
                .to_string(),
            parameters: vec![
                ToolParameter::required("filename", "string", "The name of the file to search in"),
                ToolParameter::required("query", "string", "Case-insensitive text to look for"),
                ToolParameter::optional(
                    "context_lines",
                    "integer",
                    "Number of context lines to include before/after match (default: 2)",
                )
                .with_default(json!(2)),
            ],
        }
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let filename = str_arg(&args, "filename")?;
        let query = str_arg(&args, "query")?;
        let context_lines = args
            .get("context_lines")
            .and_then(Value::as_u64)
            .unwrap_or(2) as usize;

        let path = confined_path(&self.root, filename)?;
        if !path.exists() {
            bail!("File not found: {}", filename);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<&str> = content.split('\n').collect();
        let needle = query.to_lowercase();

        let matches: Vec<Value> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.to_lowercase().contains(&needle))
            .map(|(i, line)| {
                let start = i.saturating_sub(context_lines);
                let end = (i + context_lines + 1).min(lines.len());
                json!({
                    "line_number": i + 1,
                    "matched_line": line,
                    "context": &lines[start..end],
                })
            })
            .collect();

        Ok(ToolOutput::new(json!({
            "filename": filename,
            "query": query,
            "total_matches": matches.len(),
            "matches": matches,
        })))
    }
}
