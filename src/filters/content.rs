//! Raw rule-list content storage: one text file per filter id.

use std::path::{Path, PathBuf};

use crate::error::FilterError;

/// Stores the raw text of each filter under `<dir>/<id>.txt`.
pub struct FilterContentStore {
    dir: PathBuf,
}

impl FilterContentStore {
    /// Open (creating if needed) the content directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, FilterError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, filter_id: i64) -> PathBuf {
        self.dir.join(format!("{filter_id}.txt"))
    }

    /// Raw content for a filter, or `None` if nothing is stored.
    pub fn content(&self, filter_id: i64) -> Result<Option<String>, FilterError> {
        match std::fs::read_to_string(self.path(filter_id)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_content(&self, filter_id: i64, text: &str) -> Result<(), FilterError> {
        std::fs::write(self.path(filter_id), text)?;
        Ok(())
    }

    /// Delete a filter's content. Deleting absent content is not an error.
    pub fn delete_content(&self, filter_id: i64) -> Result<(), FilterError> {
        match std::fs::remove_file(self.path(filter_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write bundled default lists for ids that have no stored content yet.
    /// Existing files are never overwritten. Returns how many were written.
    pub fn unpack_bundled_defaults(&self, bundled: &[(i64, &str)]) -> Result<usize, FilterError> {
        let mut written = 0;
        for (filter_id, text) in bundled {
            let path = self.path(*filter_id);
            if !path.exists() {
                std::fs::write(&path, text)?;
                written += 1;
            }
        }
        if written > 0 {
            tracing::info!("Unpacked {written} bundled default filter lists");
        }
        Ok(written)
    }

    /// Remove every stored filter file.
    pub fn clear_all(&self) -> Result<(), FilterError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "txt") {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, FilterContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilterContentStore::open(dir.path().join("filters")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_get_delete_round_trip() {
        let (_dir, store) = open_temp();
        assert!(store.content(3).unwrap().is_none());

        store.save_content(3, "||ads.example.com^\n").unwrap();
        assert_eq!(
            store.content(3).unwrap().as_deref(),
            Some("||ads.example.com^\n")
        );

        store.delete_content(3).unwrap();
        assert!(store.content(3).unwrap().is_none());
        // Deleting again stays quiet.
        store.delete_content(3).unwrap();
    }

    #[test]
    fn test_save_overwrites_existing_content() {
        let (_dir, store) = open_temp();
        store.save_content(7, "old\n").unwrap();
        store.save_content(7, "new\n").unwrap();
        assert_eq!(store.content(7).unwrap().as_deref(), Some("new\n"));
    }

    #[test]
    fn test_unpack_bundled_defaults_skips_existing() {
        let (_dir, store) = open_temp();
        store.save_content(1, "user content\n").unwrap();

        let written = store
            .unpack_bundled_defaults(&[(1, "bundled one\n"), (2, "bundled two\n")])
            .unwrap();
        assert_eq!(written, 1);
        // Existing content was not clobbered.
        assert_eq!(store.content(1).unwrap().as_deref(), Some("user content\n"));
        assert_eq!(store.content(2).unwrap().as_deref(), Some("bundled two\n"));
    }

    #[test]
    fn test_clear_all_removes_every_file() {
        let (_dir, store) = open_temp();
        store.save_content(1, "a").unwrap();
        store.save_content(2, "b").unwrap();
        store.clear_all().unwrap();
        assert!(store.content(1).unwrap().is_none());
        assert!(store.content(2).unwrap().is_none());
    }
}
