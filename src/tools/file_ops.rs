//! File operation tools: read, write, list, delete.
//!
//! Paths are always relative to the caller's workspace and go through the
//! resolver first; payloads report workspace-relative paths only.

use std::io;
use std::path::Path;

use serde_json::json;
use walkdir::WalkDir;

use super::{
    DeleteFileParams, ExecutionContext, ListFilesParams, Payload, ReadFileParams, ToolError,
    ToolKind, ToolOutcome, WriteFileParams,
};
use crate::workspace::{relative_display, WorkspaceResolver};

pub(super) async fn read_file(
    workspaces: &WorkspaceResolver,
    ctx: &ExecutionContext,
    params: ReadFileParams,
) -> ToolOutcome {
    let target = workspaces.resolve_in(&ctx.user_id, &params.relative_path).await?;
    let shown = target.display();

    let bytes = tokio::fs::read(&target.path)
        .await
        .map_err(|e| ToolError::io("read", &shown, e))?;
    let content = String::from_utf8(bytes)
        .map_err(|_| ToolError::Io(format!("Failed to read {}: not a UTF-8 text file", shown)))?;

    let mut payload = Payload::new();
    payload.insert("path".into(), json!(shown));

    if params.start_line.is_none() && params.end_line.is_none() {
        payload.insert("content".into(), json!(content));
        return Ok(payload);
    }

    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    let start = params.start_line.unwrap_or(1).max(1);
    let end = params.end_line.unwrap_or(total_lines).min(total_lines);
    if start > end {
        return Err(ToolError::invalid(
            ToolKind::ReadFile,
            format!(
                "line range {}-{} is empty; {} has {} lines",
                start, end, shown, total_lines
            ),
        ));
    }

    payload.insert("content".into(), json!(lines[start - 1..end].join("\n")));
    payload.insert("startLine".into(), json!(start));
    payload.insert("endLine".into(), json!(end));
    payload.insert("totalLines".into(), json!(total_lines));
    Ok(payload)
}

pub(super) async fn write_file(
    workspaces: &WorkspaceResolver,
    ctx: &ExecutionContext,
    params: WriteFileParams,
) -> ToolOutcome {
    let target = workspaces.resolve_in(&ctx.user_id, &params.relative_path).await?;
    let shown = target.display();
    if target.is_root() {
        return Err(ToolError::Io("Cannot write to the workspace root".to_string()));
    }

    if let Some(parent) = target.path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::io("create parent directories for", &shown, e))?;
    }
    tokio::fs::write(&target.path, params.content.as_bytes())
        .await
        .map_err(|e| ToolError::io("write", &shown, e))?;

    tracing::debug!(user_id = %ctx.user_id, path = %shown, bytes = params.content.len(), "Wrote file");

    let mut payload = Payload::new();
    payload.insert("path".into(), json!(shown));
    payload.insert("bytesWritten".into(), json!(params.content.len()));
    Ok(payload)
}

pub(super) async fn list_files(
    workspaces: &WorkspaceResolver,
    ctx: &ExecutionContext,
    params: ListFilesParams,
) -> ToolOutcome {
    let target = workspaces.resolve_in(&ctx.user_id, &params.relative_path).await?;
    let shown = target.display();

    let meta = tokio::fs::metadata(&target.path)
        .await
        .map_err(|e| ToolError::io("list", &shown, e))?;
    if !meta.is_dir() {
        return Err(ToolError::Io(format!("Failed to list {}: not a directory", shown)));
    }

    let mut entries = if params.recursive {
        let root = target.root.clone();
        let dir = target.path.clone();
        tokio::task::spawn_blocking(move || walk_entries(&root, &dir))
            .await
            .map_err(|e| ToolError::Io(format!("Listing task failed: {}", e)))?
            .map_err(|e| ToolError::io("list", &shown, e))?
    } else {
        read_entries(&target.root, &target.path)
            .await
            .map_err(|e| ToolError::io("list", &shown, e))?
    };
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut payload = Payload::new();
    payload.insert("path".into(), json!(shown));
    payload.insert("count".into(), json!(entries.len()));
    payload.insert(
        "files".into(),
        json!(entries
            .iter()
            .map(|e| json!({ "name": e.name, "type": e.kind, "path": e.path }))
            .collect::<Vec<_>>()),
    );
    Ok(payload)
}

pub(super) async fn delete_file(
    workspaces: &WorkspaceResolver,
    ctx: &ExecutionContext,
    params: DeleteFileParams,
) -> ToolOutcome {
    let target = workspaces.resolve_in(&ctx.user_id, &params.relative_path).await?;
    let shown = target.display();

    // symlink_metadata so deleting a link removes the link itself.
    let meta = tokio::fs::symlink_metadata(&target.path)
        .await
        .map_err(|e| ToolError::io("delete", &shown, e))?;
    if meta.is_dir() {
        return Err(ToolError::Io(format!(
            "Failed to delete {}: is a directory (delete_file removes files only)",
            shown
        )));
    }

    tokio::fs::remove_file(&target.path)
        .await
        .map_err(|e| ToolError::io("delete", &shown, e))?;

    tracing::debug!(user_id = %ctx.user_id, path = %shown, "Deleted file");

    let mut payload = Payload::new();
    payload.insert("deletedPath".into(), json!(shown));
    Ok(payload)
}

struct Entry {
    name: String,
    kind: &'static str,
    path: String,
}

impl Entry {
    fn new(root: &Path, path: &Path, is_dir: bool) -> Self {
        Entry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind: if is_dir { "directory" } else { "file" },
            path: relative_display(root, path),
        }
    }
}

async fn read_entries(root: &Path, dir: &Path) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let file_type = entry.file_type().await?;
        entries.push(Entry::new(root, &entry.path(), file_type.is_dir()));
    }
    Ok(entries)
}

fn walk_entries(root: &Path, dir: &Path) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        entries.push(Entry::new(root, entry.path(), entry.file_type().is_dir()));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::ToolErrorKind;
    use serde_json::{json, Value};

    fn names(result: &super::super::ToolResult) -> Vec<String> {
        result
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .map(|f| f["path"].as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips_exact_content() {
        let (registry, _dir) = registry().await;
        let content = "line one\n  indented\ttab\n\nünïcødé\n";

        let written = call(
            &registry,
            "alice",
            "write_file",
            json!({ "relativePath": "notes/today.txt", "content": content }),
        )
        .await;
        assert!(written.success, "{:?}", written.error);
        assert_eq!(written.get("bytesWritten"), Some(&json!(content.len())));
        assert_eq!(written.get("path"), Some(&json!("notes/today.txt")));

        let read = call(&registry, "alice", "read_file", json!({ "relativePath": "notes/today.txt" })).await;
        assert!(read.success);
        assert_eq!(read.get("content"), Some(&json!(content)));
    }

    #[tokio::test]
    async fn test_read_line_range() {
        let (registry, _dir) = registry().await;
        call(
            &registry,
            "alice",
            "write_file",
            json!({ "relativePath": "a.txt", "content": "one\ntwo\nthree\nfour\n" }),
        )
        .await;

        let read = call(
            &registry,
            "alice",
            "read_file",
            json!({ "relativePath": "a.txt", "startLine": 2, "endLine": 3 }),
        )
        .await;
        assert_eq!(read.get("content"), Some(&json!("two\nthree")));
        assert_eq!(read.get("totalLines"), Some(&json!(4)));

        let past_end = call(
            &registry,
            "alice",
            "read_file",
            json!({ "relativePath": "a.txt", "startLine": 9 }),
        )
        .await;
        assert!(!past_end.success);
        assert_eq!(past_end.error_kind, Some(ToolErrorKind::InvalidParameters));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let (registry, _dir) = registry().await;
        let read = call(&registry, "alice", "read_file", json!({ "relativePath": "nope.txt" })).await;
        assert!(!read.success);
        assert_eq!(read.error_kind, Some(ToolErrorKind::Io));
        let error = read.error.unwrap_or_default();
        assert!(error.contains("nope.txt"));
        assert!(!error.contains("workspaces"), "host path leaked: {}", error);
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let (registry, _dir) = registry().await;
        call(
            &registry,
            "alice",
            "write_file",
            json!({ "relativePath": "a.txt", "content": "secret" }),
        )
        .await;

        let bob = call(&registry, "bob", "list_files", json!({})).await;
        assert!(bob.success);
        assert!(names(&bob).is_empty());

        let sneaky = call(&registry, "bob", "read_file", json!({ "relativePath": "../alice/a.txt" })).await;
        assert_eq!(sneaky.error_kind, Some(ToolErrorKind::Security));
    }

    #[tokio::test]
    async fn test_list_files_flat_and_recursive() {
        let (registry, _dir) = registry().await;
        for path in ["b.txt", "a.txt", "src/main.js", "src/lib/util.js"] {
            call(
                &registry,
                "alice",
                "write_file",
                json!({ "relativePath": path, "content": "x" }),
            )
            .await;
        }

        let flat = call(&registry, "alice", "list_files", json!({ "relativePath": "." })).await;
        assert_eq!(names(&flat), vec!["a.txt", "b.txt", "src"]);
        let files = flat.get("files").cloned().unwrap_or_default();
        assert_eq!(files[2]["type"], "directory");
        assert_eq!(files[0]["type"], "file");

        let nested = call(
            &registry,
            "alice",
            "list_files",
            json!({ "relativePath": "src", "recursive": true }),
        )
        .await;
        assert_eq!(names(&nested), vec!["src/lib", "src/lib/util.js", "src/main.js"]);
    }

    #[tokio::test]
    async fn test_list_files_on_a_file_fails() {
        let (registry, _dir) = registry().await;
        call(
            &registry,
            "alice",
            "write_file",
            json!({ "relativePath": "a.txt", "content": "x" }),
        )
        .await;
        let result = call(&registry, "alice", "list_files", json!({ "relativePath": "a.txt" })).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ToolErrorKind::Io));
    }

    #[tokio::test]
    async fn test_delete_file() {
        let (registry, _dir) = registry().await;
        call(
            &registry,
            "alice",
            "write_file",
            json!({ "relativePath": "dir/a.txt", "content": "x" }),
        )
        .await;

        let deleted = call(&registry, "alice", "delete_file", json!({ "relativePath": "dir/a.txt" })).await;
        assert!(deleted.success);
        assert_eq!(deleted.get("deletedPath"), Some(&json!("dir/a.txt")));

        let again = call(&registry, "alice", "delete_file", json!({ "relativePath": "dir/a.txt" })).await;
        assert_eq!(again.error_kind, Some(ToolErrorKind::Io));

        let dir = call(&registry, "alice", "delete_file", json!({ "relativePath": "dir" })).await;
        assert_eq!(dir.error_kind, Some(ToolErrorKind::Io));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_workspace_is_rejected() {
        let (registry, dir) = registry().await;
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, "host secret").unwrap();

        let root = registry.workspaces.root_for("alice").await.unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link.txt")).unwrap();

        let read = call(&registry, "alice", "read_file", json!({ "relativePath": "link.txt" })).await;
        assert_eq!(read.error_kind, Some(ToolErrorKind::Security));
    }
}
