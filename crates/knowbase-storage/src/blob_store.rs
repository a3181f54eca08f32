//! C14 — local filesystem blob store rooted at `FILE_STORAGE_BASE_PATH`
//! (spec §6). Paths passed to every method are relative; this adapter
//! resolves and creates parent directories as needed.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use knowbase_core::error::{KbError, KbResult};
use knowbase_core::ports::BlobStore;

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, relative_path: &str) -> KbResult<PathBuf> {
        if relative_path.contains("..") {
            return Err(KbError::input_invalid(format!(
                "relative path must not contain '..': {relative_path}"
            )));
        }
        Ok(self.root.join(relative_path))
    }
}

fn io_err(context: &'static str) -> impl Fn(std::io::Error) -> KbError {
    move |e| KbError::storage(format!("{context}: {e}"))
}

impl BlobStore for LocalBlobStore {
    fn write_at_offset(&self, relative_path: &str, offset: u64, data: &[u8]) -> KbResult<()> {
        let path = self.resolve(relative_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("failed to create blob directory"))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(io_err("failed to open blob for writing"))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(io_err("failed to seek in blob"))?;
        file.write_all(data).map_err(io_err("failed to write blob chunk"))?;
        Ok(())
    }

    fn open_read(&self, relative_path: &str) -> KbResult<Box<dyn Read>> {
        let path = self.resolve(relative_path)?;
        let file = File::open(&path).map_err(io_err("failed to open blob for reading"))?;
        Ok(Box::new(file))
    }

    fn size(&self, relative_path: &str) -> KbResult<u64> {
        let path = self.resolve(relative_path)?;
        let metadata = fs::metadata(&path).map_err(io_err("failed to stat blob"))?;
        Ok(metadata.len())
    }

    fn mv(&self, from_relative_path: &str, to_relative_path: &str) -> KbResult<()> {
        let from = self.resolve(from_relative_path)?;
        let to = self.resolve(to_relative_path)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(io_err("failed to create destination directory"))?;
        }
        fs::rename(&from, &to).map_err(io_err("failed to move blob"))?;
        Ok(())
    }

    fn delete(&self, relative_path: &str) -> KbResult<()> {
        let path = self.resolve(relative_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("failed to delete blob")(e)),
        }
    }

    fn exists(&self, relative_path: &str) -> KbResult<bool> {
        let path = self.resolve(relative_path)?;
        Ok(path.exists())
    }
}
