use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::Document;

/// Load every `.md` / `.txt` file in a directory as a document.
///
/// A file may start with a frontmatter block naming its source:
/// ```markdown
/// ---
/// source: Product FAQ
/// ---
/// Body text...
/// ```
/// Without one, the file stem is used.
pub async fn load_documents_from_dir(dir: &Path) -> Result<Vec<Document>> {
    let mut documents = Vec::new();

    if !dir.exists() {
        info!("Documents directory not found: {}, skipping", dir.display());
        return Ok(documents);
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read documents directory: {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_text = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("md") | Some("txt")
        );
        if path.is_file() && is_text {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        match load_document_file(&path).await {
            Ok(Some(doc)) => documents.push(doc),
            Ok(None) => warn!("Skipping empty document: {}", path.display()),
            Err(e) => warn!("Failed to load document from {}: {}", path.display(), e),
        }
    }

    info!("Loaded {} documents from {}", documents.len(), dir.display());
    Ok(documents)
}

async fn load_document_file(path: &Path) -> Result<Option<Document>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read document: {}", path.display()))?;

    let (source, body) = split_frontmatter(&content);
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }

    let source = source.unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed")
            .to_string()
    });

    Ok(Some(Document::new(body, source)))
}

/// Returns the `source:` field (if any) and the body after the frontmatter
fn split_frontmatter(content: &str) -> (Option<String>, &str) {
    if let Some(stripped) = content.strip_prefix("---") {
        if let Some(end) = stripped.find("---") {
            let frontmatter = &stripped[..end];
            let source = frontmatter.lines().find_map(|line| {
                let value = line.trim().strip_prefix("source:")?;
                let value = value.trim().trim_matches('"').trim_matches('\'');
                (!value.is_empty()).then(|| value.to_string())
            });
            return (source, &stripped[end + 3..]);
        }
    }
    (None, content)
}
