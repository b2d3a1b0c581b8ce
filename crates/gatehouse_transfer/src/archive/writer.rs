use super::{
    digest_file, entry_file, read_manifest, validate_entry_name, ContainerError, Manifest,
    ManifestEntry, ENTRIES_DIR, FORMAT_VERSION, LOCK_FILE, MANIFEST_FILE,
};
use crate::error::StreamError;
use crate::finalizer::{CleanupToken, Finalizer};
use crate::stream::{ObjectWriter, WriterOutput};
use crate::writers::file::StagedFile;
use crate::writers::json_lines::{write_row_line, write_stream_header};
use anyhow::Context;
use fs2::FileExt;
use chrono::{DateTime, Utc};
use gatehouse_protocol::{Row, SchemaInfo};
use indexmap::IndexMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

enum EntryState {
    Writing,
    Done(ManifestEntry),
    Failed,
}

struct WriterState {
    /// Entries of a previously committed manifest.
    existing: Vec<ManifestEntry>,
    /// Entries created through this writer, in creation order.
    entries: IndexMap<String, EntryState>,
    closed: bool,
    /// Exclusively locked `archive.lock`; the OS releases it if the process dies.
    lock: Option<File>,
    cleanup: Option<CleanupToken>,
}

/// Write side of an archive. Holds the archive lock until committed or
/// abandoned; dropping an uncommitted writer abandons it.
///
/// Shared through `Arc` so entries can be written from several threads.
pub struct ArchiveWriter {
    root: PathBuf,
    created_at: DateTime<Utc>,
    state: Mutex<WriterState>,
    settled: Condvar,
    finalizer: Finalizer,
}

impl ArchiveWriter {
    /// Open an archive for writing, creating it when missing.
    ///
    /// Entries of an already committed archive are kept; new entries are
    /// added alongside them.
    pub fn open(root: &Path) -> Result<Arc<Self>, ContainerError> {
        Self::open_with_finalizer(root, &Finalizer::new())
    }

    /// Like [`ArchiveWriter::open`], registering the abandon of the
    /// unfinished archive and its staged entry files with `finalizer`.
    pub fn open_with_finalizer(
        root: &Path,
        finalizer: &Finalizer,
    ) -> Result<Arc<Self>, ContainerError> {
        let entries_dir = root.join(ENTRIES_DIR);
        std::fs::create_dir_all(&entries_dir).map_err(|e| ContainerError::io(&entries_dir, e))?;

        let lock = acquire_lock(root)?;
        let manifest = read_manifest(root)?;
        let (existing, created_at) = match manifest {
            Some(m) => (m.entries, m.created_at),
            None => (Vec::new(), Utc::now()),
        };

        info!(
            "Opened archive {} for writing ({} existing entries)",
            root.display(),
            existing.len()
        );
        let archive = Arc::new(Self {
            root: root.to_path_buf(),
            created_at,
            state: Mutex::new(WriterState {
                existing,
                entries: IndexMap::new(),
                closed: false,
                lock: Some(lock),
                cleanup: None,
            }),
            settled: Condvar::new(),
            finalizer: finalizer.clone(),
        });

        let weak = Arc::downgrade(&archive);
        let token = finalizer.register(format!("archive {}", root.display()), move || {
            if let Some(archive) = weak.upgrade() {
                archive.abandon();
            }
            Ok(())
        });
        archive.lock().cleanup = Some(token);
        Ok(archive)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve an entry name and return its writer. The schema is taken from
    /// the stream when the writer is initialised.
    pub fn entry_writer(self: &Arc<Self>, name: &str) -> Result<EntryWriter, ContainerError> {
        validate_entry_name(name)?;
        let mut state = self.lock();
        if state.closed {
            return Err(ContainerError::Locked(self.root.clone()));
        }
        if state.existing.iter().any(|e| e.name == name) || state.entries.contains_key(name) {
            return Err(ContainerError::DuplicateEntry(name.to_string()));
        }
        state.entries.insert(name.to_string(), EntryState::Writing);
        debug!(entry = name, "Reserved archive entry");

        Ok(EntryWriter {
            archive: Arc::clone(self),
            name: name.to_string(),
            schema: None,
            staged: None,
            out: None,
            digest: None,
            rows: 0,
            settled: false,
        })
    }

    /// Create an entry with a known schema.
    pub fn create_entry(
        self: &Arc<Self>,
        name: &str,
        schema: &SchemaInfo,
    ) -> anyhow::Result<EntryWriter> {
        let mut writer = self.entry_writer(name)?;
        writer.init(schema)?;
        Ok(writer)
    }

    fn settle(&self, name: &str, outcome: EntryState) {
        let mut state = self.lock();
        if let Some(slot) = state.entries.get_mut(name) {
            *slot = outcome;
        }
        self.settled.notify_all();
    }

    /// Write the manifest once every entry is terminal and release the lock.
    ///
    /// Failed entries are left out of the manifest.
    pub fn commit(&self) -> Result<Manifest, ContainerError> {
        let mut state = self.lock();
        while state
            .entries
            .values()
            .any(|e| matches!(e, EntryState::Writing))
        {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.closed {
            return Err(ContainerError::Locked(self.root.clone()));
        }

        let mut entries = state.existing.clone();
        for entry in state.entries.values() {
            if let EntryState::Done(entry) = entry {
                entries.push(entry.clone());
            }
        }
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            created_at: self.created_at,
            committed_at: Utc::now(),
            entries,
        };

        let manifest_path = self.root.join(MANIFEST_FILE);
        let temp_path = self.root.join(format!(".{}.tmp", MANIFEST_FILE));
        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|source| {
            ContainerError::Manifest {
                path: manifest_path.clone(),
                source,
            }
        })?;
        std::fs::write(&temp_path, bytes).map_err(|e| ContainerError::io(&temp_path, e))?;
        std::fs::rename(&temp_path, &manifest_path)
            .map_err(|e| ContainerError::io(&manifest_path, e))?;

        state.closed = true;
        state.lock = None;
        self.disarm(&mut state);
        info!(
            "Committed archive {} ({} entries)",
            self.root.display(),
            manifest.entries.len()
        );
        Ok(manifest)
    }

    /// Drop every entry written through this writer and release the lock.
    /// Previously committed entries stay valid.
    pub fn abandon(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        for name in state.entries.keys() {
            let path = self.root.join(entry_file(name));
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }
        state.closed = true;
        state.lock = None;
        self.disarm(&mut state);
        self.settled.notify_all();
        warn!("Abandoned archive {}", self.root.display());
    }

    fn disarm(&self, state: &mut WriterState) {
        if let Some(token) = state.cleanup.take() {
            self.finalizer.dismiss(token);
        }
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Take the exclusive advisory lock on `<root>/archive.lock`.
///
/// The file itself may be left over from a writer that died; only a live
/// lock holder keeps other writers out. The pid is written for diagnostics.
fn acquire_lock(root: &Path) -> Result<File, ContainerError> {
    let lock_path = root.join(LOCK_FILE);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| ContainerError::io(&lock_path, e))?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            debug!("Archive {} is held by another writer", root.display());
            return Err(ContainerError::Locked(root.to_path_buf()));
        }
        Err(err) => return Err(ContainerError::io(&lock_path, err)),
    }

    if let Err(err) = file
        .set_len(0)
        .and_then(|()| writeln!(file, "{}", std::process::id()))
    {
        warn!("Failed to record pid in {}: {}", lock_path.display(), err);
    }
    Ok(file)
}

/// Writer for one archive entry.
pub struct EntryWriter {
    archive: Arc<ArchiveWriter>,
    name: String,
    schema: Option<SchemaInfo>,
    staged: Option<StagedFile>,
    out: Option<BufWriter<File>>,
    digest: Option<String>,
    rows: u64,
    settled: bool,
}

impl EntryWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn out(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .with_context(|| format!("archive entry '{}' not initialized", self.name))
    }

    fn fail(&mut self) {
        self.out = None;
        if let Some(mut staged) = self.staged.take() {
            staged.discard();
        }
        if !self.settled {
            self.settled = true;
            self.archive.settle(&self.name, EntryState::Failed);
        }
    }
}

impl ObjectWriter for EntryWriter {
    fn init(&mut self, schema: &SchemaInfo) -> anyhow::Result<()> {
        let final_path = self.archive.root.join(entry_file(&self.name));
        let (staged, file) = StagedFile::create(&final_path, &self.archive.finalizer)?;
        let mut out = BufWriter::new(file);
        write_stream_header(&mut out, schema)?;
        self.staged = Some(staged);
        self.out = Some(out);
        self.schema = Some(schema.clone());
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> anyhow::Result<()> {
        write_row_line(self.out()?, row)?;
        self.rows += 1;
        Ok(())
    }

    fn prepare(&mut self) -> anyhow::Result<()> {
        let out = self
            .out
            .take()
            .with_context(|| format!("archive entry '{}' not initialized", self.name))?;
        out.into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Failed to flush archive entry '{}'", self.name))?;
        let temp_path = self
            .staged
            .as_ref()
            .and_then(|s| s.temp_path())
            .with_context(|| format!("archive entry '{}' has no staged file", self.name))?;
        self.digest = Some(digest_file(temp_path)?);
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<WriterOutput> {
        let staged = self
            .staged
            .as_mut()
            .with_context(|| format!("archive entry '{}' not prepared", self.name))?;
        staged.commit()?;
        let entry = ManifestEntry {
            name: self.name.clone(),
            file: entry_file(&self.name),
            schema: self.schema.clone().unwrap_or_default(),
            rows: self.rows,
            blake3: self.digest.clone().unwrap_or_default(),
        };
        self.settled = true;
        self.archive.settle(&self.name, EntryState::Done(entry));
        debug!(entry = %self.name, rows = self.rows, "Archive entry written");
        Ok(WriterOutput {
            rows: self.rows,
            collected: None,
        })
    }

    fn rollback(&mut self, reason: &StreamError) {
        warn!(entry = %self.name, "Rolling back archive entry: {}", reason);
        self.fail();
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if !self.settled {
            self.fail();
        }
    }
}
