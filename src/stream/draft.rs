// Locally selected attachment, held as a preview until send time

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

impl LocalFile {
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            size: metadata.len(),
        })
    }
}

/// At most one pending file per composer. Taking it for a send clears the
/// preview; what happens to the send afterwards does not touch the draft.
#[derive(Debug, Default)]
pub struct AttachmentDraft {
    selected: Option<LocalFile>,
}

impl AttachmentDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the file it replaced, if any.
    pub fn select(&mut self, file: LocalFile) -> Option<LocalFile> {
        self.selected.replace(file)
    }

    pub fn clear(&mut self) {
        self.selected = None;
    }

    pub fn preview(&self) -> Option<&LocalFile> {
        self.selected.as_ref()
    }

    pub fn take(&mut self) -> Option<LocalFile> {
        self.selected.take()
    }
}
