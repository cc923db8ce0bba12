//! Core data types shared across the ingestion pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Origin → fetch → README file on disk (or error marker)
//! README file → ItemLoader → Item { id, repo, content, content_hash }
//! Item → embed → Point { id, vector, payload } → vector store
//! ```
//!
//! # Identity
//!
//! An [`Item`]'s UUID is a pure function of its content: the first 32 hex
//! characters of the SHA-1 content hash laid into canonical UUID grouping.
//! Two READMEs with identical bytes therefore collapse to a single vector,
//! and "already embedded" can be answered by an ID lookup alone.
//!
//! # README filenames
//!
//! A fetched README is stored as `<owner>_<repo>_<branch>_<filename>`. The
//! filename is the sole authority for `(owner, repo, branch, filename)`:
//! parsing scans the underscore-split parts for the first known branch
//! token at index ≥ 2, so `owner = parts[0]` and `repo` is the join of
//! everything up to the token. GitHub owner names cannot contain
//! underscores, which keeps the owner field exact even for repos whose
//! names do.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Branch tokens recognized when parsing README filenames.
/// `default` is written by fetches that never learn the real branch.
pub const BRANCH_TOKENS: &[&str] = &["main", "master", "default"];

/// Hard cap on README artifact filenames; longer repos are skipped so we
/// never trip filesystem name limits.
pub const MAX_FILE_NAME_BYTES: usize = 200;

/// An origin URL plus its dense row number in the work table.
#[derive(Debug, Clone)]
pub struct Origin {
    pub id: i64,
    pub url: String,
}

/// A unique, embeddable README ready for the embed drivers.
#[derive(Debug, Clone)]
pub struct Item {
    /// Deterministic UUID derived from `content_hash`.
    pub id: Uuid,
    /// `owner/repo`, recovered from the artifact filename.
    pub repo: String,
    /// Trimmed README text, truncated for embedding.
    pub content: String,
    /// SHA-1 hex digest of the full trimmed content.
    pub content_hash: String,
}

/// Minimal item metadata persisted alongside an in-flight batch ID so a
/// restart can re-associate downloaded embeddings without the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    pub id: Uuid,
    pub repo: String,
    #[serde(rename = "contentHash")]
    pub content_hash: String,
}

impl ItemMeta {
    pub fn of(item: &Item) -> Self {
        Self {
            id: item.id,
            repo: item.repo.clone(),
            content_hash: item.content_hash.clone(),
        }
    }
}

/// Signals that the embedding provider returned HTTP 402: the prepaid
/// budget is spent. Treated as a graceful stop, not a failure — durable
/// state is preserved and the process exits 0.
#[derive(Debug, Clone, Copy)]
pub struct BudgetExhausted;

impl std::fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "embedding provider budget exhausted (HTTP 402)")
    }
}

impl std::error::Error for BudgetExhausted {}

/// True when `err` carries a [`BudgetExhausted`] anywhere in its chain.
pub fn is_budget_exhausted(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<BudgetExhausted>())
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// SHA-1 hex digest of a string.
pub fn sha1_hex(content: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derive an item UUID from a SHA-1 hex digest: the first 32 hex chars in
/// canonical 8-4-4-4-12 grouping.
pub fn item_id_from_hash(hash_hex: &str) -> Result<Uuid> {
    if hash_hex.len() < 32 || !hash_hex.is_char_boundary(32) {
        bail!("content hash too short for UUID derivation: {:?}", hash_hex);
    }
    let h = &hash_hex[..32];
    let canonical = format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    );
    Ok(Uuid::parse_str(&canonical)?)
}

/// Extract `owner/repo` from a GitHub origin URL, stripping a trailing `.git`.
pub fn repo_from_origin(url: &str) -> Option<String> {
    let rest = url.split_once("github.com/")?.1;
    let mut segments = rest.split('/');
    let owner = segments.next()?;
    let repo = segments.next()?;
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return None;
    }
    Some(format!("{}/{}", owner, repo))
}

/// `owner/repo` → the flat `owner_repo` stem used in artifact and marker names.
pub fn repo_stem(repo: &str) -> String {
    repo.replace('/', "_")
}

/// Build the on-disk artifact name for a fetched README.
pub fn readme_file_name(repo: &str, branch: &str, filename: &str) -> String {
    format!("{}_{}_{}", repo_stem(repo), branch, filename)
}

/// Recover `(owner, repo)` from an artifact filename.
///
/// Returns `None` when no branch token is present at index ≥ 2 (the name
/// is not a README artifact).
pub fn parse_readme_file_name(name: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = name.split('_').collect();
    for i in 2..parts.len() {
        if BRANCH_TOKENS.contains(&parts[i]) {
            let owner = parts[0].to_string();
            let repo = parts[1..i].join("_");
            return Some((owner, repo));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_hash_is_canonical_and_deterministic() {
        for content in ["# hello", "", "x", "a very long readme body"] {
            let hash = sha1_hex(content);
            let a = item_id_from_hash(&hash).unwrap();
            let b = item_id_from_hash(&hash).unwrap();
            assert_eq!(a, b);
            // 8-4-4-4-12 hex
            let s = a.to_string();
            let groups: Vec<usize> = s.split('-').map(|g| g.len()).collect();
            assert_eq!(groups, vec![8, 4, 4, 4, 12]);
            assert_eq!(s.replace('-', ""), hash[..32]);
        }
    }

    #[test]
    fn uuid_rejects_short_hash() {
        assert!(item_id_from_hash("abc123").is_err());
    }

    #[test]
    fn origin_parsing() {
        assert_eq!(
            repo_from_origin("https://github.com/foo/bar"),
            Some("foo/bar".to_string())
        );
        assert_eq!(
            repo_from_origin("https://github.com/foo/bar.git"),
            Some("foo/bar".to_string())
        );
        assert_eq!(
            repo_from_origin("git://github.com/foo/bar.git"),
            Some("foo/bar".to_string())
        );
        assert_eq!(repo_from_origin("https://gitlab.com/foo/bar"), None);
        assert_eq!(repo_from_origin("https://github.com/foo"), None);
        assert_eq!(repo_from_origin("https://github.com//bar"), None);
    }

    #[test]
    fn file_name_round_trip() {
        let cases = [
            ("foo/bar", "master", "README.md"),
            ("foo/bar_baz", "main", "README.rst"),
            ("owner/very_long_repo_name", "default", "readme.txt"),
        ];
        for (repo, branch, file) in cases {
            let name = readme_file_name(repo, branch, file);
            let (owner, parsed_repo) = parse_readme_file_name(&name).unwrap();
            assert_eq!(format!("{}/{}", owner, parsed_repo), repo, "name: {}", name);
        }
    }

    #[test]
    fn file_name_parse_takes_first_branch_token() {
        // A repo whose name embeds a branch token ("app_main") mis-splits
        // by contract: the first token at index >= 2 wins, so the owner
        // stays exact and the repo field truncates at the token.
        let (owner, repo) = parse_readme_file_name("foo_app_main_master_README.md").unwrap();
        assert_eq!(owner, "foo");
        assert_eq!(repo, "app");

        // A token at index 1 belongs to the repo name, not the branch.
        let (owner, repo) = parse_readme_file_name("foo_main_app_master_README.md").unwrap();
        assert_eq!(owner, "foo");
        assert_eq!(repo, "main_app");
    }

    #[test]
    fn file_name_parse_rejects_non_artifacts() {
        assert_eq!(parse_readme_file_name("not-a-readme.txt"), None);
        assert_eq!(parse_readme_file_name("owner_repo"), None);
        // A token at index 1 would leave an empty repo
        assert_eq!(parse_readme_file_name("owner_master"), None);
    }

    #[test]
    fn budget_exhausted_detected_through_chain() {
        let err = anyhow::Error::new(BudgetExhausted).context("chunk 3 failed");
        assert!(is_budget_exhausted(&err));
        let other = anyhow::anyhow!("plain failure");
        assert!(!is_budget_exhausted(&other));
    }
}
