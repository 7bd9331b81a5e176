//! Destinations for received file bytes.

use super::{FileId, FileMeta, TransferError};
use crate::PeerId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Accumulates one incoming file.
///
/// Exactly one of `finish` or `discard` ends the sink's life.
#[async_trait]
pub trait FileSink: Send + Sized {
    type Output: Send;

    async fn write(&mut self, data: &[u8]) -> Result<(), TransferError>;

    /// Flush and hand over the assembled file.
    async fn finish(self) -> Result<Self::Output, TransferError>;

    /// Drop partial data.
    async fn discard(self);
}

/// Creates a sink per incoming transfer.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    type Sink: FileSink;

    async fn create(&self, from: PeerId, meta: &FileMeta) -> Result<Self::Sink, TransferError>;
}

/// Keeps the file in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

#[async_trait]
impl FileSink for MemorySink {
    type Output = Vec<u8>;

    async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn finish(self) -> Result<Vec<u8>, TransferError> {
        Ok(self.data)
    }

    async fn discard(self) {}
}

/// Largest up-front allocation for an in-memory sink.
const MEMORY_PREALLOC_LIMIT: u64 = 8 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySinkFactory;

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    type Sink = MemorySink;

    async fn create(&self, _from: PeerId, meta: &FileMeta) -> Result<MemorySink, TransferError> {
        Ok(MemorySink {
            data: Vec::with_capacity(meta.size.min(MEMORY_PREALLOC_LIMIT) as usize),
        })
    }
}

/// Writes into a download directory.
///
/// Bytes go to a hidden `.part` file that is renamed to a free name on
/// completion and removed on discard.
#[derive(Debug, Clone)]
pub struct DirectorySinkFactory {
    dir: PathBuf,
}

impl DirectorySinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SinkFactory for DirectorySinkFactory {
    type Sink = DirectorySink;

    async fn create(&self, _from: PeerId, meta: &FileMeta) -> Result<DirectorySink, TransferError> {
        fs::create_dir_all(&self.dir).await?;
        let name = sanitize_file_name(&meta.name);
        let part_path = self
            .dir
            .join(format!(".{}.{}.part", name, part_token(&meta.file_id)));
        let file = File::create(&part_path).await?;
        debug!("Receiving {} into {}", meta.name, part_path.display());
        Ok(DirectorySink {
            dir: self.dir.clone(),
            name,
            part_path,
            file,
        })
    }
}

pub struct DirectorySink {
    dir: PathBuf,
    name: String,
    part_path: PathBuf,
    file: File,
}

#[async_trait]
impl FileSink for DirectorySink {
    /// Final location of the file
    type Output = PathBuf;

    async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn finish(mut self) -> Result<PathBuf, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let target = free_path(&self.dir, &self.name).await?;
        fs::rename(&self.part_path, &target).await?;
        Ok(target)
    }

    async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.part_path).await {
            warn!("Failed to remove {}: {}", self.part_path.display(), e);
        }
    }
}

/// Reduce a sender-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// The file id as it appears in a part file name. Ids come from the sender,
/// so anything but ASCII letters, digits and `-` is replaced.
fn part_token(file_id: &FileId) -> String {
    file_id
        .as_str()
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// `name`, or `stem (n).ext` for the first `n` that is not taken.
async fn free_path(dir: &Path, name: &str) -> Result<PathBuf, TransferError> {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(name: &str) -> FileMeta {
        FileMeta {
            file_id: FileId::generate(),
            name: name.into(),
            size: 5,
            mime_type: "text/plain".into(),
            chunk_bytes: 1024,
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("what?.txt"), "what_.txt");
        assert_eq!(sanitize_file_name(""), "download");
        assert_eq!(sanitize_file_name(".."), "download");
    }

    #[tokio::test]
    async fn test_part_file_stays_inside_dir_for_hostile_file_id() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("inbox");
        let factory = DirectorySinkFactory::new(&dir);
        let mut meta = meta("a.txt");
        meta.file_id = FileId::from("x/../../escaped");

        let mut sink = factory.create(PeerId::from(1), &meta).await.unwrap();
        sink.write(b"part").await.unwrap();

        let entries: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec![".a.txt.x_______escaped.part".to_string()]);
        assert!(!tmp.path().join("escaped").exists());

        let path = sink.finish().await.unwrap();
        assert_eq!(path, dir.join("a.txt"));
    }

    #[tokio::test]
    async fn test_memory_sink_collects_bytes() {
        let mut sink = MemorySinkFactory.create(PeerId::from(1), &meta("a")).await.unwrap();
        sink.write(b"hel").await.unwrap();
        sink.write(b"lo").await.unwrap();
        assert_eq!(sink.finish().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_directory_sink_finish_renames() {
        let tmp = TempDir::new().unwrap();
        let factory = DirectorySinkFactory::new(tmp.path());

        let mut sink = factory.create(PeerId::from(1), &meta("notes.txt")).await.unwrap();
        sink.write(b"hello").await.unwrap();
        let path = sink.finish().await.unwrap();

        assert_eq!(path, tmp.path().join("notes.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        // No part files left behind
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_directory_sink_avoids_collisions() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"old").unwrap();
        let factory = DirectorySinkFactory::new(tmp.path());

        let mut sink = factory.create(PeerId::from(1), &meta("notes.txt")).await.unwrap();
        sink.write(b"new").await.unwrap();
        let path = sink.finish().await.unwrap();

        assert_eq!(path, tmp.path().join("notes (1).txt"));
        assert_eq!(std::fs::read(tmp.path().join("notes.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_directory_sink_discard_removes_part() {
        let tmp = TempDir::new().unwrap();
        let factory = DirectorySinkFactory::new(tmp.path());

        let mut sink = factory.create(PeerId::from(1), &meta("big.bin")).await.unwrap();
        sink.write(b"par").await.unwrap();
        sink.discard().await;

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
