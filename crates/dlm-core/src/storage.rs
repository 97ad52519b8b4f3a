//! Positional-write temp file for the parallel fetcher.
//!
//! Chunks write at their own offsets into `<output>.part`; completion is
//! published only by the atomic rename in [`ChunkWriter::finalize`], so a
//! partial final file is never observable.

use anyhow::{Context, Result};
use std::fs::File;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writer over the temp file. Cheap to clone; every clone targets the same
/// preallocated file and `write_at` never moves a shared cursor.
#[derive(Clone)]
pub struct ChunkWriter {
    file: Arc<File>,
    temp_path: PathBuf,
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

impl ChunkWriter {
    /// Creates (truncating) `<final_path>.part` preallocated to `len` bytes.
    pub fn create(final_path: &Path, len: u64) -> Result<Self> {
        let temp_path = temp_path_for(final_path);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;
        file.set_len(len)
            .with_context(|| format!("failed to preallocate {} bytes", len))?;
        Ok(Self {
            file: Arc::new(file),
            temp_path,
        })
    }

    /// Writes all of `data` at `offset` without touching any shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Non-Unix fallback: seek + write on a cloned handle.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("temp file sync failed")?;
        Ok(())
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically renames the temp file onto `final_path`. Call `sync` first
    /// when durability matters. Fails across filesystems.
    pub fn finalize(self, final_path: &Path) -> Result<()> {
        let temp_path = self.temp_path.clone();
        drop(self.file);
        std::fs::rename(&temp_path, final_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }

    /// Removes the temp file. Used on a failed fetch so no partial data is
    /// left behind.
    pub fn discard(self) -> Result<()> {
        let temp_path = self.temp_path.clone();
        drop(self.file);
        std::fs::remove_file(&temp_path)
            .with_context(|| format!("failed to remove {}", temp_path.display()))?;
        Ok(())
    }
}
