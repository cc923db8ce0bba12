//! Item loader: README files on disk → unique, embeddable items.
//!
//! The full corpus is hundreds of GB, so the orchestrator streams
//! filenames in chunks and calls [`load_items`] per chunk; the result is
//! dropped after that chunk embeds. Reads are bounded at
//! `file_readers` concurrent files.
//!
//! Per file: read, trim, reject under [`MIN_CONTENT_LEN`] chars, SHA-1
//! the trimmed content, derive the deterministic UUID, parse `owner/repo`
//! from the filename, and truncate content for embedding. Items already
//! in the vector store (`existing`) or seen earlier in the chunk are
//! dropped. Output preserves input order among survivors.

use anyhow::Result;
use futures_util::{stream, StreamExt};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

use crate::models::{item_id_from_hash, parse_readme_file_name, sha1_hex, truncate_chars, Item};

/// Content shorter than this after trimming is noise, not a README.
pub const MIN_CONTENT_LEN: usize = 10;

/// Load one chunk of README files into unique items.
///
/// `existing` holds IDs already present in the vector store; matching
/// items are dropped here so they never reach an embed driver.
pub async fn load_items(
    dir: &Path,
    filenames: &[String],
    existing: &HashSet<Uuid>,
    max_content_len: usize,
    file_readers: usize,
) -> Result<Vec<Item>> {
    // Bounded concurrent reads; `buffered` (not unordered) keeps output
    // aligned with input order.
    let contents: Vec<Option<(String, String)>> = stream::iter(filenames.iter().cloned())
        .map(|name| {
            let path = dir.join(&name);
            async move {
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => Some((name, content)),
                    Err(e) => {
                        eprintln!("Warning: failed to read {}: {}", path.display(), e);
                        None
                    }
                }
            }
        })
        .buffered(file_readers.max(1))
        .collect()
        .await;

    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut items = Vec::new();

    for entry in contents.into_iter().flatten() {
        let (name, raw) = entry;
        let trimmed = raw.trim();
        if trimmed.len() < MIN_CONTENT_LEN {
            continue;
        }

        let (owner, repo) = match parse_readme_file_name(&name) {
            Some(parts) => parts,
            None => {
                eprintln!("Warning: unparseable README filename: {}", name);
                continue;
            }
        };

        // Hash the full trimmed content so identical READMEs collapse
        // regardless of the embedding truncation below.
        let content_hash = sha1_hex(trimmed);
        let id = item_id_from_hash(&content_hash)?;

        if existing.contains(&id) || !seen.insert(id) {
            continue;
        }

        items.push(Item {
            id,
            repo: format!("{}/{}", owner, repo),
            content: truncate_chars(trimmed, max_content_len).to_string(),
            content_hash,
        });
    }

    Ok(items)
}
