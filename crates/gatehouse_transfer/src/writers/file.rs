use crate::finalizer::{CleanupToken, Finalizer};
use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Output file staged as `.<name>.tmp` next to its final path and renamed
/// into place on commit.
///
/// The temp file is registered with the run's finalizer until it is either
/// renamed or removed.
pub(crate) struct StagedFile {
    final_path: PathBuf,
    temp_path: Option<PathBuf>,
    committed: bool,
    finalizer: Finalizer,
    cleanup: Option<CleanupToken>,
}

impl StagedFile {
    /// Create the temp file, returning it for writing.
    pub fn create(final_path: &Path, finalizer: &Finalizer) -> Result<(Self, File)> {
        let dir = final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Output path has no file name: {}", final_path.display()))?;
        let temp_path = dir.join(format!(".{}.tmp", file_name));
        let file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        let orphan = temp_path.clone();
        let cleanup = finalizer.register(format!("staged {}", temp_path.display()), move || {
            remove_if_present(&orphan)
        });

        Ok((
            Self {
                final_path: final_path.to_path_buf(),
                temp_path: Some(temp_path),
                committed: false,
                finalizer: finalizer.clone(),
                cleanup: Some(cleanup),
            },
            file,
        ))
    }

    fn disarm(&mut self) {
        if let Some(token) = self.cleanup.take() {
            self.finalizer.dismiss(token);
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    pub fn commit(&mut self) -> Result<()> {
        if let Some(temp_path) = self.temp_path.take() {
            std::fs::rename(&temp_path, &self.final_path).with_context(|| {
                format!(
                    "Failed to rename {} -> {}",
                    temp_path.display(),
                    self.final_path.display()
                )
            })?;
            info!("Committed {}", self.final_path.display());
            self.committed = true;
            self.disarm();
        }
        Ok(())
    }

    /// Remove staged output, including a committed final file.
    pub fn discard(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            if temp_path.exists() {
                let _ = std::fs::remove_file(&temp_path);
                warn!("Rolled back temp file: {}", temp_path.display());
            }
        }
        self.disarm();
        if self.committed {
            if self.final_path.exists() {
                let _ = std::fs::remove_file(&self.final_path);
                warn!("Rolled back committed file: {}", self.final_path.display());
            }
            self.committed = false;
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            if temp_path.exists() {
                let _ = std::fs::remove_file(temp_path);
                warn!("Cleaned up orphaned temp file: {}", temp_path.display());
            }
        }
        self.disarm();
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!("Removed staged file left by an interrupted run: {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn commit_renames_and_discard_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out").join("data.jsonl");
        let finalizer = Finalizer::new();
        let (mut staged, mut file) = StagedFile::create(&target, &finalizer).unwrap();
        assert_eq!(finalizer.pending(), 1);
        file.write_all(b"{}\n").unwrap();
        drop(file);

        let temp = staged.temp_path().unwrap().to_path_buf();
        assert!(temp.ends_with(".data.jsonl.tmp"));
        assert!(!target.exists());

        staged.commit().unwrap();
        assert!(target.exists());
        assert!(!temp.exists());
        assert_eq!(finalizer.pending(), 0);

        staged.discard();
        assert!(!target.exists());
    }

    #[test]
    fn drop_cleans_up_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("data.csv");
        let temp = {
            let (staged, _file) = StagedFile::create(&target, &Finalizer::new()).unwrap();
            staged.temp_path().unwrap().to_path_buf()
        };
        assert!(!temp.exists());
        assert!(!target.exists());
    }

    #[test]
    fn finalizer_removes_an_abandoned_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("data.jsonl");
        let finalizer = Finalizer::new();
        let (staged, file) = StagedFile::create(&target, &finalizer).unwrap();
        let temp = staged.temp_path().unwrap().to_path_buf();
        // a writer stuck on another thread never gets to roll back
        std::mem::forget(staged);
        drop(file);
        assert!(temp.exists());

        finalizer.run_all();
        assert!(!temp.exists());
        assert!(!target.exists());
    }
}
