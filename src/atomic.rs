//! All-or-nothing file replacement
//!
//! Output is staged in a temporary file beside the target and renamed over
//! the target when finalized. The replacement is atomic whenever the
//! filesystem's rename is, which POSIX requires for renames within one
//! filesystem. Readers of the target path see either the old complete file
//! or the new complete file, never a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const STAGING_SUFFIX: &str = "aftmp";

/// A staged file that becomes visible at its target only on [`finalize`].
///
/// Dropping an `AtomicFile` without finalizing discards the staged data.
///
/// [`finalize`]: AtomicFile::finalize
#[derive(Debug)]
pub struct AtomicFile {
    /// Open staging handle; `None` once the rename succeeded or the file was cancelled
    tmp: Option<File>,
    tmp_path: PathBuf,
    target: PathBuf,
}

impl AtomicFile {
    /// Stage a new file for `target` with the given unix permission bits.
    ///
    /// Fails if `target` exists and is not a regular file.
    pub fn new(target: impl AsRef<Path>, mode: u32) -> io::Result<Self> {
        let target = target.as_ref().to_path_buf();
        if let Ok(meta) = fs::symlink_metadata(&target) {
            if !meta.file_type().is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} exists and is not a regular file", target.display()),
                ));
            }
        }

        let name = target
            .file_name()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", target.display()),
                )
            })?
            .to_string_lossy()
            .into_owned();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp_path = dir.join(format!(
            "{}-{}.{}",
            name,
            uuid::Uuid::new_v4().simple(),
            STAGING_SUFFIX
        ));

        let tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;

        if let Err(e) = set_mode(&tmp, mode) {
            drop(tmp);
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        Ok(Self {
            tmp: Some(tmp),
            tmp_path,
            target,
        })
    }

    /// Path the content will appear at after finalizing
    #[cfg(test)]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Path of the staging file
    #[cfg(test)]
    pub fn staging_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Flush the staged data and rename it onto the target.
    ///
    /// On failure the staging file is removed before the error is returned.
    /// Finalizing twice is an error.
    pub fn finalize(&mut self) -> io::Result<()> {
        let mut tmp = self.tmp.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "file is already closed")
        })?;

        let synced = tmp.flush().and_then(|()| tmp.sync_all());
        drop(tmp);
        if let Err(e) = synced {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&self.tmp_path, &self.target) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e);
        }
        Ok(())
    }

    /// Discard the staged data.
    ///
    /// Safe to call after a successful [`finalize`](Self::finalize), in
    /// which case it has no effect. The live-handle check prevents removing
    /// a file someone else created at the staging name after the rename.
    pub fn cancel(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            drop(tmp);
            let _ = fs::remove_file(&self.tmp_path);
        }
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        self.tmp
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file is already closed"))
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Run `f` against a staged file for `target`, finalizing if it succeeds.
///
/// When `f` fails the staged data is discarded and its error returned.
pub fn transact<T, F>(target: impl AsRef<Path>, mode: u32, f: F) -> io::Result<T>
where
    F: FnOnce(&mut AtomicFile) -> io::Result<T>,
{
    let mut file = AtomicFile::new(target, mode)?;
    match f(&mut file) {
        Ok(value) => {
            file.finalize()?;
            Ok(value)
        }
        Err(e) => {
            file.cancel();
            Err(e)
        }
    }
}

/// Atomically replace `target` with `data`
pub fn write_data(target: impl AsRef<Path>, data: &[u8], mode: u32) -> io::Result<()> {
    transact(target, mode, |f| f.write_all(data))
}

/// Atomically replace `target` with everything read from `reader`,
/// returning the number of bytes written
pub fn write_all<R: Read + ?Sized>(
    target: impl AsRef<Path>,
    reader: &mut R,
    mode: u32,
) -> io::Result<u64> {
    transact(target, mode, |f| io::copy(reader, f))
}
