//! Built-in local implementations: plain filesystem access standing in for
//! filesystem-style providers.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    serde::Deserialize,
    serde_json::{Value, json},
};

use super::{FallbackError, FallbackTool};

/// Files above this size are truncated when read and skipped when searched.
const MAX_FILE_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_RESULTS: usize = 100;
const MAX_SEARCH_DEPTH: usize = 8;

/// Resolve a built-in implementation by its configuration key.
pub fn lookup(implementation: &str) -> Option<Arc<dyn FallbackTool>> {
    match implementation {
        "local_read_file" => Some(Arc::new(LocalReadFile::new())),
        "local_list_directory" => Some(Arc::new(LocalListDirectory::new())),
        "local_search_text" => Some(Arc::new(LocalSearchText::new())),
        _ => None,
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, FallbackError> {
    Ok(serde_json::from_value(params)?)
}

fn limitations(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

// ── local_read_file ─────────────────────────────────────────────────

pub struct LocalReadFile {
    limitations: Vec<String>,
}

impl LocalReadFile {
    pub fn new() -> Self {
        Self {
            limitations: limitations(&[
                "reads the local filesystem only",
                "text only; binary content is decoded lossily",
                "content is truncated at 1 MiB",
            ]),
        }
    }
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: PathBuf,
}

#[async_trait]
impl FallbackTool for LocalReadFile {
    fn implementation(&self) -> &str {
        "local_read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the local filesystem"
    }

    fn limitations(&self) -> &[String] {
        &self.limitations
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value, FallbackError> {
        let args: ReadFileArgs = parse_args(params)?;
        let bytes = tokio::fs::read(&args.path).await?;
        let truncated = bytes.len() > MAX_FILE_BYTES;
        let content = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_FILE_BYTES)]);
        Ok(json!({
            "path": args.path,
            "content": content,
            "truncated": truncated,
        }))
    }
}

// ── local_list_directory ────────────────────────────────────────────

pub struct LocalListDirectory {
    limitations: Vec<String>,
}

impl LocalListDirectory {
    pub fn new() -> Self {
        Self {
            limitations: limitations(&[
                "lists the local filesystem only",
                "not recursive",
            ]),
        }
    }
}

#[derive(Deserialize)]
struct ListDirectoryArgs {
    path: PathBuf,
}

#[async_trait]
impl FallbackTool for LocalListDirectory {
    fn implementation(&self) -> &str {
        "local_list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a local directory"
    }

    fn limitations(&self) -> &[String] {
        &self.limitations
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value, FallbackError> {
        let args: ListDirectoryArgs = parse_args(params)?;
        let mut dir = tokio::fs::read_dir(&args.path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                "directory"
            } else if file_type.is_file() {
                "file"
            } else {
                "other"
            };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        entries.sort();

        let entries: Vec<Value> = entries
            .into_iter()
            .map(|(name, kind)| json!({"name": name, "kind": kind}))
            .collect();
        Ok(json!({"path": args.path, "entries": entries}))
    }
}

// ── local_search_text ───────────────────────────────────────────────

pub struct LocalSearchText {
    limitations: Vec<String>,
}

impl LocalSearchText {
    pub fn new() -> Self {
        Self {
            limitations: limitations(&[
                "literal substring match only, no regular expressions",
                "skips hidden entries and files over 1 MiB",
                "stops at a fixed directory depth and result count",
            ]),
        }
    }
}

#[derive(Deserialize)]
struct SearchTextArgs {
    path: PathBuf,
    pattern: String,
    #[serde(default)]
    max_results: Option<usize>,
}

#[async_trait]
impl FallbackTool for LocalSearchText {
    fn implementation(&self) -> &str {
        "local_search_text"
    }

    fn description(&self) -> &str {
        "Search local files for a literal string"
    }

    fn limitations(&self) -> &[String] {
        &self.limitations
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "pattern": {"type": "string"},
                "max_results": {"type": "integer"}
            },
            "required": ["path", "pattern"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value, FallbackError> {
        let args: SearchTextArgs = parse_args(params)?;
        if args.pattern.is_empty() {
            return Err(FallbackError::InvalidArguments("pattern must not be empty".into()));
        }
        let limit = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

        let mut matches = Vec::new();
        let mut stack = vec![(args.path.clone(), 0usize)];
        while let Some((path, depth)) = stack.pop() {
            if matches.len() >= limit {
                break;
            }
            let meta = tokio::fs::metadata(&path).await?;
            if meta.is_dir() {
                if depth >= MAX_SEARCH_DEPTH {
                    continue;
                }
                let mut children = Vec::new();
                let mut dir = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    if !is_hidden(&entry.path()) {
                        children.push(entry.path());
                    }
                }
                // Reverse-sorted so the stack pops in name order.
                children.sort_by(|a, b| b.cmp(a));
                stack.extend(children.into_iter().map(|c| (c, depth + 1)));
            } else if meta.is_file() && meta.len() as usize <= MAX_FILE_BYTES {
                search_file(&path, &args.pattern, limit, &mut matches).await;
            }
        }

        let truncated = matches.len() >= limit;
        Ok(json!({"matches": matches, "truncated": truncated}))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

async fn search_file(path: &Path, pattern: &str, limit: usize, matches: &mut Vec<Value>) {
    // Unreadable files are skipped rather than failing the whole search.
    let Ok(bytes) = tokio::fs::read(path).await else {
        return;
    };
    let text = String::from_utf8_lossy(&bytes);
    for (index, line) in text.lines().enumerate() {
        if matches.len() >= limit {
            return;
        }
        if line.contains(pattern) {
            matches.push(json!({
                "file": path,
                "line": index + 1,
                "text": line.trim_end(),
            }));
        }
    }
}
