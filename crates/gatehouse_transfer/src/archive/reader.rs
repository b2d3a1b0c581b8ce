use super::{digest_file, read_manifest, ContainerError, Manifest, ManifestEntry};
use crate::readers::json_lines;
use crate::stream::ObjectReader;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Read side of a committed archive.
pub struct ArchiveReader {
    root: PathBuf,
    manifest: Manifest,
}

impl ArchiveReader {
    /// Open a committed archive. Fails with `Incomplete` when the manifest
    /// was never written.
    pub fn open(root: &Path) -> Result<Self, ContainerError> {
        if !root.is_dir() {
            return Err(ContainerError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "archive directory not found"),
            ));
        }
        let manifest =
            read_manifest(root)?.ok_or_else(|| ContainerError::Incomplete(root.to_path_buf()))?;
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Entries in commit order.
    pub fn list_entries(&self) -> &[ManifestEntry] {
        &self.manifest.entries
    }

    /// Open an entry as a stream after checking its digest.
    pub fn open_entry(&self, name: &str) -> Result<Box<dyn ObjectReader>, ContainerError> {
        let entry = self
            .manifest
            .entry(name)
            .ok_or_else(|| ContainerError::MissingEntry(name.to_string()))?;
        let path = self.root.join(&entry.file);
        if !path.is_file() {
            return Err(ContainerError::Corrupt {
                entry: name.to_string(),
                reason: format!("entry file {} is missing", entry.file),
            });
        }

        let digest = digest_file(&path)?;
        if digest != entry.blake3 {
            return Err(ContainerError::Corrupt {
                entry: name.to_string(),
                reason: "content digest does not match the manifest".to_string(),
            });
        }

        let file = File::open(&path).map_err(|e| ContainerError::io(&path, e))?;
        let reader = json_lines::from_buf_read(name.to_string(), BufReader::new(file), 1)
            .map_err(|err| ContainerError::Corrupt {
                entry: name.to_string(),
                reason: format!("{:#}", err),
            })?;
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, LOCK_FILE, MANIFEST_FILE};
    use crate::stream::testing::{id_name_row, id_name_schema};
    use crate::stream::{ObjectWriter, StreamEvent};
    use gatehouse_protocol::{ColumnInfo, DataType, SchemaInfo, Value};

    fn write_entry(archive: &std::sync::Arc<ArchiveWriter>, name: &str, rows: i64) {
        let mut writer = archive.create_entry(name, &id_name_schema()).unwrap();
        for i in 1..=rows {
            writer.write_row(&id_name_row(i, &format!("n{}", i))).unwrap();
        }
        writer.prepare().unwrap();
        writer.commit().unwrap();
    }

    fn drain(mut reader: Box<dyn ObjectReader>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        loop {
            let event = reader.next_event();
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                return out;
            }
        }
    }

    #[test]
    fn round_trip_preserves_schema_and_order() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("export");
        let archive = ArchiveWriter::open(&root).unwrap();
        write_entry(&archive, "users", 50);
        archive.commit().unwrap();
        drop(archive);
        assert!(ArchiveWriter::open(&root).is_ok());

        let reader = ArchiveReader::open(&root).unwrap();
        assert_eq!(reader.list_entries().len(), 1);
        assert_eq!(reader.list_entries()[0].rows, 50);

        let events = drain(reader.open_entry("users").unwrap());
        assert_eq!(events[0], StreamEvent::Schema(id_name_schema()));
        assert_eq!(events.len(), 52);
        for (i, event) in events[1..51].iter().enumerate() {
            let StreamEvent::Row(row) = event else {
                panic!("expected row");
            };
            assert_eq!(row["id"], Value::Int(i as i64 + 1));
        }
        assert_eq!(events[51], StreamEvent::End);
    }

    #[test]
    fn duplicate_entry_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        let _first = archive.entry_writer("users").unwrap();
        assert!(matches!(
            archive.entry_writer("users"),
            Err(ContainerError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn uncommitted_archive_is_incomplete() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("half");
        {
            let archive = ArchiveWriter::open(&root).unwrap();
            write_entry(&archive, "users", 3);
        }
        assert!(matches!(
            ArchiveReader::open(&root),
            Err(ContainerError::Incomplete(_))
        ));
        assert!(!root.join("entries/users.jsonl").exists());
    }

    #[test]
    fn tampered_entry_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        write_entry(&archive, "users", 2);
        archive.commit().unwrap();
        drop(archive);

        let path = tmp.path().join("entries/users.jsonl");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"id\":3,\"name\":\"forged\"}\n");
        std::fs::write(&path, text).unwrap();

        let reader = ArchiveReader::open(tmp.path()).unwrap();
        assert!(matches!(
            reader.open_entry("users"),
            Err(ContainerError::Corrupt { .. })
        ));
        assert!(matches!(
            reader.open_entry("orders"),
            Err(ContainerError::MissingEntry(_))
        ));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        assert!(matches!(
            ArchiveWriter::open(tmp.path()),
            Err(ContainerError::Locked(_))
        ));
        archive.abandon();
        assert!(ArchiveWriter::open(tmp.path()).is_ok());
    }

    #[test]
    fn leftover_lock_file_without_holder_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        // what a killed writer leaves behind: the file, but no live lock
        std::fs::write(tmp.path().join(LOCK_FILE), "4242\n").unwrap();

        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        let pid = std::fs::read_to_string(tmp.path().join(LOCK_FILE)).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
        write_entry(&archive, "users", 2);
        archive.commit().unwrap();
    }

    #[test]
    fn reopening_keeps_committed_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        write_entry(&archive, "users", 1);
        archive.commit().unwrap();
        drop(archive);

        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        assert!(matches!(
            archive.entry_writer("users"),
            Err(ContainerError::DuplicateEntry(_))
        ));
        let schema = SchemaInfo::new(vec![ColumnInfo::new("total", DataType::Float64)]);
        let mut orders = archive.create_entry("orders", &schema).unwrap();
        orders.prepare().unwrap();
        orders.commit().unwrap();
        let manifest = archive.commit().unwrap();
        let names: Vec<&str> = manifest.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["users", "orders"]);
        assert!(tmp.path().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn failed_entry_is_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::open(tmp.path()).unwrap();
        write_entry(&archive, "good", 1);
        let mut bad = archive.create_entry("bad", &id_name_schema()).unwrap();
        bad.rollback(&crate::error::StreamError::source("boom"));
        let manifest = archive.commit().unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert!(!tmp.path().join("entries/bad.jsonl").exists());
    }
}
