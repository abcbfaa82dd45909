use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ProcessError;
use crate::pipeline::Mode;

enum Workspace {
    Temp(TempDir),
    Fixed(PathBuf),
}

/// Per-user scratch area plus the outputs of the most recent batch.
///
/// A session created with [`Session::new`] owns a fresh temp directory that
/// is deleted when the session is dropped. Call [`Session::into_kept_path`]
/// to keep it around instead.
pub struct Session {
    workspace: Workspace,
    outputs: Vec<PathBuf>,
}

impl Session {
    pub fn new() -> Result<Self, ProcessError> {
        let dir = tempfile::Builder::new()
            .prefix("metatag-")
            .tempdir()
            .map_err(|e| ProcessError::io("failed to create session workspace", e))?;
        log::debug!("Session workspace: {}", dir.path().display());
        Ok(Self {
            workspace: Workspace::Temp(dir),
            outputs: Vec::new(),
        })
    }

    /// Use a caller-chosen directory. It is created if missing and never
    /// deleted by the session.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| ProcessError::io(format!("failed to create {}", root.display()), e))?;
        Ok(Self {
            workspace: Workspace::Fixed(root),
            outputs: Vec::new(),
        })
    }

    pub fn workspace(&self) -> &Path {
        match &self.workspace {
            Workspace::Temp(dir) => dir.path(),
            Workspace::Fixed(path) => path,
        }
    }

    /// Output subdirectory for `mode`, created on first use.
    pub fn output_dir(&self, mode: Mode) -> Result<PathBuf, ProcessError> {
        let dir = self.workspace().join(mode.dir_name());
        std::fs::create_dir_all(&dir)
            .map_err(|e| ProcessError::io(format!("failed to create {}", dir.display()), e))?;
        Ok(dir)
    }

    /// Output files of the last batch, in input order.
    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    pub fn replace_outputs(&mut self, paths: Vec<PathBuf>) {
        self.outputs = paths;
    }

    /// Delete every recorded output that still exists, plus any batch
    /// archives, and forget them.
    pub fn clear_outputs(&mut self) {
        for path in self.outputs.drain(..) {
            remove_if_exists(&path);
        }
        for mode in [Mode::Tagging, Mode::Stripping] {
            remove_if_exists(&self.workspace().join(mode.archive_name()));
        }
    }

    /// Write `bytes` into the workspace. The file is removed when the
    /// returned guard is dropped.
    pub fn scratch_copy(&self, name: &str, bytes: &[u8]) -> Result<ScratchFile, ProcessError> {
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let path = self.workspace().join(format!("scratch-{file_name}"));
        std::fs::write(&path, bytes)
            .map_err(|e| ProcessError::io(format!("failed to write {}", path.display()), e))?;
        Ok(ScratchFile { path })
    }

    /// Zip the current outputs into `<workspace>/<mode>.zip` when there is
    /// more than one. Members are stored uncompressed under their basename;
    /// later files with an already-used name are skipped.
    pub fn bundle(&self, mode: Mode) -> Result<Option<PathBuf>, ProcessError> {
        if self.outputs.len() <= 1 {
            return Ok(None);
        }

        let archive_path = self.workspace().join(mode.archive_name());
        let file = File::create(&archive_path).map_err(|e| {
            ProcessError::io(format!("failed to create {}", archive_path.display()), e)
        })?;
        let mut writer = ZipWriter::new(file);
        let options =
            FileOptions::<'_, ()>::default().compression_method(CompressionMethod::Stored);

        let mut seen = HashSet::new();
        for path in &self.outputs {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !seen.insert(name.clone()) {
                log::warn!("Skipping duplicate archive entry {name}");
                continue;
            }
            let contents = std::fs::read(path)
                .map_err(|e| ProcessError::io(format!("failed to read {}", path.display()), e))?;
            writer.start_file(name, options)?;
            writer
                .write_all(&contents)
                .map_err(|e| ProcessError::io("failed to write archive entry", e))?;
        }
        writer.finish()?;

        log::info!("Archive written: {}", archive_path.display());
        Ok(Some(archive_path))
    }

    /// Consume the session without deleting its workspace.
    pub fn into_kept_path(self) -> PathBuf {
        match self.workspace {
            Workspace::Temp(dir) => dir.keep(),
            Workspace::Fixed(path) => path,
        }
    }
}

fn remove_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

/// A scratch file that is deleted when dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        remove_if_exists(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write(path: &Path, data: &[u8]) -> PathBuf {
        std::fs::write(path, data).unwrap();
        path.to_path_buf()
    }

    #[test]
    fn new_session_has_prefixed_workspace() {
        let session = Session::new().unwrap();
        let name = session.workspace().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("metatag-"));
        assert!(session.workspace().is_dir());
    }

    #[test]
    fn workspace_removed_on_drop() {
        let session = Session::new().unwrap();
        let path = session.workspace().to_path_buf();
        drop(session);
        assert!(!path.exists());
    }

    #[test]
    fn kept_workspace_survives() {
        let session = Session::new().unwrap();
        let path = session.into_kept_path();
        assert!(path.is_dir());
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn output_dir_is_idempotent() {
        let session = Session::new().unwrap();
        let a = session.output_dir(Mode::Tagging).unwrap();
        let b = session.output_dir(Mode::Tagging).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("tagged_images"));
        assert!(session.output_dir(Mode::Stripping).unwrap().ends_with("stripped_images"));
    }

    #[test]
    fn scratch_copy_removed_on_drop() {
        let session = Session::new().unwrap();
        let scratch = session.scratch_copy("../../etc/photo.jpg", b"data").unwrap();
        let path = scratch.path().to_path_buf();
        assert_eq!(path.parent().unwrap(), session.workspace());
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn bundle_single_output_is_none() {
        let mut session = Session::new().unwrap();
        let dir = session.output_dir(Mode::Tagging).unwrap();
        session.replace_outputs(vec![write(&dir.join("a.jpg"), b"a")]);
        assert!(session.bundle(Mode::Tagging).unwrap().is_none());
    }

    #[test]
    fn bundle_stores_members_by_basename() {
        let mut session = Session::new().unwrap();
        let dir = session.output_dir(Mode::Stripping).unwrap();
        let a = write(&dir.join("a.png"), b"first");
        let b = write(&dir.join("b.png"), b"second");
        session.replace_outputs(vec![a, b]);

        let archive_path = session.bundle(Mode::Stripping).unwrap().unwrap();
        assert_eq!(archive_path, session.workspace().join("stripped_images.zip"));

        let mut archive = zip::ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut entry = archive.by_name("b.png").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Stored);
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"second");
    }

    #[test]
    fn clear_outputs_removes_files_and_archives() {
        let mut session = Session::new().unwrap();
        let dir = session.output_dir(Mode::Tagging).unwrap();
        let a = write(&dir.join("a.jpg"), b"a");
        let b = write(&dir.join("b.jpg"), b"b");
        session.replace_outputs(vec![a.clone(), b.clone()]);
        let archive = session.bundle(Mode::Tagging).unwrap().unwrap();

        std::fs::remove_file(&b).unwrap();
        session.clear_outputs();

        assert!(session.outputs().is_empty());
        assert!(!a.exists());
        assert!(!archive.exists());
    }

    #[test]
    fn fixed_root_is_not_deleted() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("work");
        let session = Session::with_root(&root).unwrap();
        assert!(root.is_dir());
        drop(session);
        assert!(root.is_dir());
    }
}
