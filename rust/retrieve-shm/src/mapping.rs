//! Shared memory mappings.
//!
//! A mapping is either backed by a file (any process that knows the path can
//! open it) or anonymous (shared only with children forked after creation).
//! New mappings are zero-filled.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::region::Region;

enum Backing {
    File { _file: File, path: PathBuf },
    Anonymous,
}

/// An `mmap`ed `MAP_SHARED` block. Unmapped on drop.
pub struct ShmMapping {
    base_addr: *mut u8,
    size: usize,
    backing: Backing,
}

// SAFETY: the memory is synchronized by atomics and locks living inside it.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    /// Create a new file of `size` bytes at `path` and map it.
    ///
    /// Fails with `AlreadyExists` if the file is already there.
    pub fn create(path: impl AsRef<Path>, size: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        if let Err(e) = file.set_len(size as u64) {
            std::fs::remove_file(path).ok();
            return Err(e);
        }

        match map_fd(&file, size) {
            Ok(base_addr) => {
                tracing::trace!(path = %path.display(), size, "shared memory file created");
                Ok(Self {
                    base_addr,
                    size,
                    backing: Backing::File {
                        _file: file,
                        path: path.to_path_buf(),
                    },
                })
            }
            Err(e) => {
                std::fs::remove_file(path).ok();
                Err(e)
            }
        }
    }

    /// Map an existing file in full.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory file is empty",
            ));
        }
        let base_addr = map_fd(&file, size)?;
        Ok(Self {
            base_addr,
            size,
            backing: Backing::File {
                _file: file,
                path: path.to_path_buf(),
            },
        })
    }

    /// Map `size` bytes of anonymous shared memory.
    pub fn anonymous(size: usize) -> io::Result<Self> {
        // SAFETY: anonymous mapping with no address hint.
        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base_addr: base_addr as *mut u8,
            size,
            backing: Backing::Anonymous,
        })
    }

    pub fn region(&self) -> Region {
        // SAFETY: the mapping stays valid until self is dropped.
        unsafe { Region::from_raw(self.base_addr, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Backing file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Anonymous => None,
        }
    }

    /// Remove the backing file name. Existing mappings stay valid.
    pub fn unlink(&self) -> io::Result<()> {
        match &self.backing {
            Backing::File { path, .. } => {
                tracing::trace!(path = %path.display(), "shared memory file unlinked");
                std::fs::remove_file(path)
            }
            Backing::Anonymous => Ok(()),
        }
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: base_addr and size were valid when created.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}

impl std::fmt::Debug for ShmMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmMapping")
            .field("size", &self.size)
            .field("path", &self.path())
            .finish()
    }
}

fn map_fd(file: &File, size: usize) -> io::Result<*mut u8> {
    // SAFETY: fd is open read/write and at least `size` bytes long.
    let base_addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if base_addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(base_addr as *mut u8)
}
