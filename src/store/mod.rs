//! kml store layer: file-backed persistence for session records.
//!
//! All state lives under `./.kml/` in the working directory. The catalog is
//! a single pretty-printed JSON document so it stays inspectable and
//! hand-editable; there is no locking, and exactly one kml process per
//! working directory is assumed.

pub mod catalog;

pub use catalog::{Conversation, SessionCatalog, SessionRecord};

use std::path::{Path, PathBuf};

/// Directory holding kml state, relative to the working directory.
pub const STATE_DIR: &str = ".kml";

/// Catalog file name inside [`STATE_DIR`].
pub const SESSIONS_FILE: &str = "sessions.json";

/// Resolve the catalog path for a working directory.
pub fn sessions_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join(SESSIONS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_path_is_fixed() {
        let path = sessions_path(Path::new("/work"));
        assert_eq!(path, Path::new("/work/.kml/sessions.json"));
    }
}
