//! Session catalog: durable slug → record mapping backed by
//! `./.kml/sessions.json`.
//!
//! The file holds `{"sessions": {"<slug>": {...}}}`, pretty-printed. Reads
//! are lazy and corruption-tolerant (a malformed file reads as empty);
//! every write persists the full document. Unrecognized fields on a record
//! round-trip untouched so newer kml versions can add fields without
//! breaking older ones.

use anyhow::{bail, Result};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Longest prompt excerpt kept on a conversation entry.
const PROMPT_EXCERPT_LEN: usize = 51;

/// One conversation with the in-sandbox assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub uuid: String,
    pub created_at: String,
    pub last_prompt_excerpt: String,
}

/// Durable representation of one session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionRecord {
    /// Catalog key; injected on read, never serialized into the record body.
    #[serde(skip)]
    pub slug: String,

    /// 64 hex chars, generated at create and never rotated.
    pub access_token: String,
    pub created_at: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_token: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversations: Vec<Conversation>,

    /// Fields this version does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,

    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// File-backed session catalog.
///
/// Not safe under concurrent writers; one kml process per working directory
/// is assumed (last writer wins otherwise).
pub struct SessionCatalog {
    path: PathBuf,
}

impl SessionCatalog {
    /// Catalog rooted at `dir` (the working directory, not the state dir).
    pub fn new(dir: &Path) -> Self {
        Self {
            path: super::sessions_path(dir),
        }
    }

    /// Catalog for the current working directory.
    pub fn open_default() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self::new(&cwd))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a record for `slug` with a fresh access token.
    /// Fails if the slug already exists.
    pub fn create(&self, slug: &str) -> Result<SessionRecord> {
        let mut doc = self.load();
        if doc.sessions.contains_key(slug) {
            bail!("session '{slug}' already exists");
        }

        let record = SessionRecord {
            slug: slug.to_string(),
            access_token: generate_access_token(),
            created_at: Utc::now().to_rfc3339(),
            ..SessionRecord::default()
        };

        doc.sessions.insert(slug.to_string(), record.clone());
        self.persist(&doc)?;
        Ok(record)
    }

    /// Look up a record, with `slug` injected. `None` if missing.
    pub fn find(&self, slug: &str) -> Option<SessionRecord> {
        let doc = self.load();
        doc.sessions.get(slug).map(|r| {
            let mut record = r.clone();
            record.slug = slug.to_string();
            record
        })
    }

    /// Apply `patch` to an existing record and persist. No-op if missing.
    pub fn update(&self, slug: &str, patch: impl FnOnce(&mut SessionRecord)) -> Result<()> {
        let mut doc = self.load();
        if let Some(record) = doc.sessions.get_mut(slug) {
            patch(record);
            self.persist(&doc)?;
        }
        Ok(())
    }

    /// Remove a record. No-op if missing.
    pub fn delete(&self, slug: &str) -> Result<()> {
        let mut doc = self.load();
        if doc.sessions.remove(slug).is_some() {
            self.persist(&doc)?;
        }
        Ok(())
    }

    /// Append a conversation entry to a session.
    pub fn add_conversation(&self, slug: &str, uuid: &str, prompt: &str) -> Result<()> {
        self.update(slug, |record| {
            record.conversations.push(Conversation {
                uuid: uuid.to_string(),
                created_at: Utc::now().to_rfc3339(),
                last_prompt_excerpt: prompt_excerpt(prompt),
            });
        })
    }

    /// Refresh the prompt excerpt of an existing conversation entry.
    pub fn update_conversation(&self, slug: &str, uuid: &str, prompt: &str) -> Result<()> {
        self.update(slug, |record| {
            if let Some(conv) = record.conversations.iter_mut().find(|c| c.uuid == uuid) {
                conv.last_prompt_excerpt = prompt_excerpt(prompt);
            }
        })
    }

    /// All records, keyed by slug (with slugs injected).
    pub fn all(&self) -> BTreeMap<String, SessionRecord> {
        let doc = self.load();
        doc.sessions
            .into_iter()
            .map(|(slug, mut record)| {
                record.slug = slug.clone();
                (slug, record)
            })
            .collect()
    }

    fn load(&self) -> Document {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!("catalog at {} is malformed ({e}); treating as empty", self.path.display());
                Document::default()
            }),
            Err(_) => Document::default(),
        }
    }

    fn persist(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(doc)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// 32 random bytes as 64 lowercase hex chars.
fn generate_access_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// First 51 characters of the prompt, for `session list` display.
fn prompt_excerpt(prompt: &str) -> String {
    prompt.chars().take(PROMPT_EXCERPT_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog(tmp: &TempDir) -> SessionCatalog {
        SessionCatalog::new(tmp.path())
    }

    #[test]
    fn create_generates_64_hex_token() {
        let tmp = TempDir::new().unwrap();
        let record = catalog(&tmp).create("test-run").unwrap();
        assert_eq!(record.access_token.len(), 64);
        assert!(record.access_token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(!record.created_at.is_empty());
    }

    #[test]
    fn create_rejects_duplicate_slug() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        cat.create("dup").unwrap();
        let err = cat.create("dup").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn find_injects_slug() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        cat.create("alpha").unwrap();
        let record = cat.find("alpha").unwrap();
        assert_eq!(record.slug, "alpha");
        assert!(cat.find("missing").is_none());
    }

    #[test]
    fn update_merges_and_ignores_missing() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        cat.create("s").unwrap();

        cat.update("s", |r| r.sandbox_id = Some("sb-1".into())).unwrap();
        assert_eq!(cat.find("s").unwrap().sandbox_id.as_deref(), Some("sb-1"));

        // Missing slug is a no-op, not an error.
        cat.update("ghost", |r| r.sandbox_id = Some("x".into())).unwrap();
        assert!(cat.find("ghost").is_none());
    }

    #[test]
    fn delete_removes_record() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        cat.create("gone").unwrap();
        cat.delete("gone").unwrap();
        assert!(cat.find("gone").is_none());
    }

    #[test]
    fn conversations_append_and_mutate() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        cat.create("s").unwrap();

        cat.add_conversation("s", "u1", "hello").unwrap();
        cat.add_conversation("s", "u2", "world").unwrap();
        let record = cat.find("s").unwrap();
        assert_eq!(record.conversations.len(), 2);
        assert_eq!(record.conversations[0].last_prompt_excerpt, "hello");

        cat.update_conversation("s", "u1", "a much longer follow-up prompt").unwrap();
        let record = cat.find("s").unwrap();
        assert_eq!(record.conversations.len(), 2);
        assert_eq!(
            record.conversations[0].last_prompt_excerpt,
            "a much longer follow-up prompt"
        );
        assert_eq!(record.conversations[0].uuid, "u1");
    }

    #[test]
    fn excerpt_is_truncated_to_51_chars() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        cat.create("s").unwrap();
        let long = "x".repeat(200);
        cat.add_conversation("s", "u1", &long).unwrap();
        let record = cat.find("s").unwrap();
        assert_eq!(record.conversations[0].last_prompt_excerpt.chars().count(), 51);
    }

    #[test]
    fn malformed_file_reads_as_empty_and_recovers() {
        let tmp = TempDir::new().unwrap();
        let path = crate::store::sessions_path(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"this is not json {{{").unwrap();

        let cat = catalog(&tmp);
        assert!(cat.all().is_empty());

        cat.create("x").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(doc["sessions"]["x"]["access_token"].is_string());
    }

    #[test]
    fn unknown_fields_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = crate::store::sessions_path(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::json!({
                "sessions": {
                    "s": {
                        "access_token": "ab".repeat(32),
                        "created_at": "2025-01-01T00:00:00Z",
                        "future_field": {"nested": true}
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        let cat = catalog(&tmp);
        cat.update("s", |r| r.sandbox_id = Some("sb".into())).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["sessions"]["s"]["future_field"]["nested"], true);
        assert_eq!(doc["sessions"]["s"]["sandbox_id"], "sb");
    }

    #[test]
    fn file_is_pretty_printed() {
        let tmp = TempDir::new().unwrap();
        catalog(&tmp).create("s").unwrap();
        let text = std::fs::read_to_string(crate::store::sessions_path(tmp.path())).unwrap();
        assert!(text.contains('\n'));
        assert!(text.starts_with('{'));
    }
}
