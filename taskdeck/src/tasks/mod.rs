//! Task lookup.
//!
//! Tasks live as markdown files in one directory: `<dir>/<id>.md`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::models::Task;

/// Where the session manager finds tasks.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Look up one task. `Ok(None)` when it does not exist.
    async fn find(&self, id: &str) -> Result<Option<Task>>;

    /// All tasks, sorted by id.
    async fn list(&self) -> Result<Vec<Task>>;
}

/// Markdown files in a directory, one task per file.
#[derive(Debug, Clone)]
pub struct MarkdownTaskStore {
    dir: PathBuf,
}

impl MarkdownTaskStore {
    /// Create a store over `dir`. The directory need not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory the store reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        if !is_valid_id(id) {
            return None;
        }
        Some(self.dir.join(format!("{id}.md")))
    }
}

#[async_trait]
impl TaskSource for MarkdownTaskStore {
    async fn find(&self, id: &str) -> Result<Option<Task>> {
        let Some(path) = self.path_for(id) else {
            debug!(id, "rejected task id");
            return Ok(None);
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(parse_task(id, content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read task file {}", path.display())),
        }
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read tasks dir {}", self.dir.display()))
            }
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_id(id) {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read task file {}", path.display()))?;
            tasks.push(parse_task(id, content));
        }

        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.contains("..")
}

/// Build a task from its file contents.
///
/// The title comes from a `title:` front-matter key, else the first `# `
/// heading, else the id.
fn parse_task(id: &str, content: String) -> Task {
    let title = front_matter_title(&content)
        .or_else(|| heading_title(&content))
        .unwrap_or_else(|| id.to_string());

    Task {
        id: id.to_string(),
        title,
        raw_content: content,
    }
}

fn front_matter_title(content: &str) -> Option<String> {
    let mut lines = content.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    for line in lines {
        let line = line.trim();
        if line == "---" {
            break;
        }
        if let Some(value) = line.strip_prefix("title:") {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn heading_title(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(files: &[(&str, &str)]) -> (TempDir, MarkdownTaskStore) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let store = MarkdownTaskStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_find_reads_front_matter_title() {
        let (_dir, store) = store_with(&[(
            "fix-login.md",
            "---\ntitle: \"Fix the login page\"\nstatus: todo\n---\n# Ignored\n",
        )]);

        let task = store.find("fix-login").await.unwrap().unwrap();
        assert_eq!(task.id, "fix-login");
        assert_eq!(task.title, "Fix the login page");
        assert!(task.raw_content.starts_with("---"));
    }

    #[tokio::test]
    async fn test_title_falls_back_to_heading_then_id() {
        let (_dir, store) = store_with(&[
            ("a.md", "intro\n# Heading title\nbody"),
            ("b.md", "no title here"),
        ]);

        assert_eq!(store.find("a").await.unwrap().unwrap().title, "Heading title");
        assert_eq!(store.find("b").await.unwrap().unwrap().title, "b");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_ids() {
        let (_dir, store) = store_with(&[("a.md", "# A")]);

        assert!(store.find("missing").await.unwrap().is_none());
        assert!(store.find("../a").await.unwrap().is_none());
        assert!(store.find("sub/a").await.unwrap().is_none());
        assert!(store.find("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorted_and_filtered() {
        let (_dir, store) = store_with(&[
            ("zeta.md", "# Z"),
            ("alpha.md", "# A"),
            ("notes.txt", "not a task"),
        ]);

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_missing_dir_lists_empty() {
        let store = MarkdownTaskStore::new("/nonexistent/taskdeck/tasks");
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.find("x").await.unwrap().is_none());
    }
}
