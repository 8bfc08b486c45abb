//! Filesystem operations inspired by the standard library, built on the
//! ring's `openat2`/`read`/`write`/`fsync`/`close` opcodes (§4.2) rather than
//! blocking syscalls.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::runtime::fd::Fd;
use crate::runtime::{ops, Switch};
use crate::{Error, IoResult};

/// Handle to an open file.
pub struct File {
    fd: std::rc::Rc<Fd>,
    /// Owns the fd's release hook (§3 "Resource scopes"): dropping `File`
    /// drops this scope, which closes the fd if it's still open.
    _switch: Switch,
}

impl File {
    /// Opens a file in read-only mode.
    pub async fn open(path: impl AsRef<Path>) -> IoResult<Self> {
        OpenOptions::new().read(true).open(path.as_ref()).await
    }

    /// Opens a file in write-only mode, creating it if it doesn't exist and
    /// truncating it if it does.
    pub async fn create(path: impl AsRef<Path>) -> IoResult<Self> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .await
    }

    /// Returns an [`OpenOptions`] builder. Equivalent to [`OpenOptions::new`].
    #[must_use]
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Reads up to `buf.len()` bytes starting at the file's current position,
    /// returning the number of bytes read (`0` at end-of-file).
    pub async fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
        ops::read_upto(self.fd.raw(), buf, None, self.fd.is_seekable()).await
    }

    /// Reads until `buf` is completely filled or end-of-file is reached,
    /// returning the number of bytes actually read.
    pub async fn read_exact(&self, buf: &mut [u8]) -> IoResult<usize> {
        ops::read_exactly(self.fd.raw(), buf, None, self.fd.is_seekable()).await
    }

    /// Writes all of `buf`, retrying on short writes.
    pub async fn write_all(&self, buf: &[u8]) -> IoResult<()> {
        ops::write_all(self.fd.raw(), buf, None, self.fd.is_seekable()).await
    }

    /// Syncs all OS-internal metadata and content to disk. Catches errors
    /// that would otherwise be ignored when dropping the file.
    pub async fn sync_all(&self) -> IoResult<()> {
        ops::fsync(self.fd.raw(), false).await.map(|_| ())
    }

    /// Syncs content, but maybe not metadata, to disk. Cheaper than
    /// [`Self::sync_all`] when the metadata hasn't changed.
    pub async fn sync_data(&self) -> IoResult<()> {
        ops::fsync(self.fd.raw(), true).await.map(|_| ())
    }

    /// Truncates or extends the underlying file. `ftruncate(2)` has no ring
    /// opcode, so this is a direct (non-cancellable, effectively instant)
    /// blocking syscall rather than a suspension point.
    pub fn set_len(&self, size: u64) -> IoResult<()> {
        let result = unsafe { libc::ftruncate(self.fd.raw(), size as libc::off_t) };
        if result != 0 {
            return Err(Error::from_io_error(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Queries metadata about the underlying file. `statx(2)` isn't part of
    /// the ring's opcode surface here (§4.2's operation list), and
    /// `std::fs::Metadata` has no public constructor, so this borrows the fd
    /// into a scratch `std::fs::File` just long enough to call `fstat`.
    pub fn metadata(&self) -> IoResult<std::fs::Metadata> {
        let borrowed = unsafe { std::fs::File::from_raw_fd(self.fd.raw()) };
        let metadata = borrowed.metadata();
        std::mem::forget(borrowed);
        metadata.map_err(Error::from_io_error)
    }

    /// Changes the permissions on the underlying file.
    pub fn set_permissions(&self, permissions: std::fs::Permissions) -> IoResult<()> {
        let borrowed = unsafe { std::fs::File::from_raw_fd(self.fd.raw()) };
        let result = borrowed.set_permissions(permissions);
        std::mem::forget(borrowed);
        result.map_err(Error::from_io_error)
    }
}

impl AsRawFd for File {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

/// Options and flags for configuring how a file is opened.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    // generic
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    // system-specific
    custom_flags: i32,
    mode: libc::mode_t,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    /// Creates a blank new set of options ready for configuration. All
    /// options are initially set to `false`.
    pub fn new() -> Self {
        OpenOptions {
            read: false,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
            custom_flags: 0,
            mode: 0o666,
        }
    }

    /// Sets the option for read access.
    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    /// Sets the option for write access. If the file already exists, write
    /// calls overwrite its contents without truncating it.
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Sets the option for append mode. Doesn't create the file if it
    /// doesn't exist — combine with [`Self::create`] for that.
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    /// Sets the option for truncating a previous file. The file must be
    /// opened with write access for truncate to work.
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Sets the option to create a new file, or open it if it already
    /// exists. Requires write or append access.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Sets the option to create a new file, failing atomically if it
    /// already exists. Ignores [`Self::create`] and [`Self::truncate`] when
    /// set. Requires write or append access.
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    fn get_access_mode(&self) -> IoResult<libc::c_int> {
        match (self.read, self.write, self.append) {
            (true, false, false) => Ok(libc::O_RDONLY),
            (false, true, false) => Ok(libc::O_WRONLY),
            (true, true, false) => Ok(libc::O_RDWR),
            (false, _, true) => Ok(libc::O_WRONLY | libc::O_APPEND),
            (true, _, true) => Ok(libc::O_RDWR | libc::O_APPEND),
            (false, false, false) => Err(Error::from_io_error(std::io::Error::from_raw_os_error(libc::EINVAL))),
        }
    }

    fn get_creation_mode(&self) -> IoResult<libc::c_int> {
        match (self.write, self.append) {
            (true, false) => {}
            (false, false) => {
                if self.truncate || self.create || self.create_new {
                    return Err(Error::from_io_error(std::io::Error::from_raw_os_error(libc::EINVAL)));
                }
            }
            (_, true) => {
                if self.truncate && !self.create_new {
                    return Err(Error::from_io_error(std::io::Error::from_raw_os_error(libc::EINVAL)));
                }
            }
        }

        Ok(match (self.create, self.truncate, self.create_new) {
            (false, false, false) => 0,
            (true, false, false) => libc::O_CREAT,
            (false, true, false) => libc::O_TRUNC,
            (true, true, false) => libc::O_CREAT | libc::O_TRUNC,
            (_, _, true) => libc::O_CREAT | libc::O_EXCL,
        })
    }

    /// Opens a file at `path` with the options specified by `self`.
    pub async fn open(&self, path: impl AsRef<Path>) -> IoResult<File> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes()).expect("path contains a NUL byte");
        let flags = libc::O_CLOEXEC
            | self.get_access_mode()?
            | self.get_creation_mode()?
            | (self.custom_flags & !libc::O_ACCMODE);
        let how = io_uring::types::OpenHow::new()
            .flags(flags as u64)
            .mode(self.mode as u64);

        let raw = ops::openat2(None, path.as_ptr(), &how).await? as RawFd;

        let fd = std::rc::Rc::new(Fd::new(raw, true));
        let switch = Switch::new();
        fd.clone().bind_to(&switch);

        Ok(File { fd, _switch: switch })
    }
}

/// Copies the contents of one file to another, creating or truncating `to`.
/// Also copies `from`'s permission bits. Returns the number of bytes copied.
pub async fn copy(from: impl AsRef<Path>, to: impl AsRef<Path>) -> IoResult<u64> {
    let source = File::open(from.as_ref()).await?;
    let permissions = source.metadata()?.permissions();
    let destination = File::create(to.as_ref()).await?;

    let total = ops::copy(source.fd.raw(), destination.fd.raw()).await?;

    destination.set_permissions(permissions)?;
    Ok(total)
}

/// Queries metadata about the file at `path`.
pub async fn metadata(path: impl AsRef<Path>) -> IoResult<std::fs::Metadata> {
    File::open(path.as_ref()).await?.metadata()
}

/// Reads the entire contents of a file into a byte vector.
pub async fn read(path: impl AsRef<Path>) -> IoResult<Vec<u8>> {
    let file = File::open(path.as_ref()).await?;
    let len = file.metadata()?.len() as usize;

    let mut contents = vec![0u8; len];
    let filled = file.read_exact(&mut contents).await?;
    contents.truncate(filled);

    Ok(contents)
}

/// Reads the entire contents of a file into a string.
pub async fn read_to_string(path: impl AsRef<Path>) -> IoResult<String> {
    let bytes = read(path).await?;
    String::from_utf8(bytes).map_err(|err| Error::from_io_error(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))
}

/// Removes a file from the filesystem.
pub async fn remove_file(path: impl AsRef<Path>) -> IoResult<()> {
    let path = CString::new(path.as_ref().as_os_str().as_bytes()).expect("path contains a NUL byte");
    ops::unlinkat(None, path.as_ptr()).await?;
    Ok(())
}

/// Creates a directory at `path`.
pub async fn create_dir(path: impl AsRef<Path>) -> IoResult<()> {
    let path = CString::new(path.as_ref().as_os_str().as_bytes()).expect("path contains a NUL byte");
    ops::mkdirat(None, path.as_ptr(), 0o777).await?;
    Ok(())
}

/// Writes a slice as the entire contents of a file, creating or truncating it.
pub async fn write(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> IoResult<()> {
    File::create(path).await?.write_all(contents.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::start;

    #[test]
    fn creates_and_deletes_file() {
        start(|| async {
            let path = format!("/tmp/{}", uuid::Uuid::new_v4());

            File::create(&path).await.unwrap();
            assert!(Path::new(&path).exists());

            remove_file(&path).await.unwrap();
            assert!(!Path::new(&path).exists());
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn copies_file() {
        start(|| async {
            let path = format!("/tmp/{}", uuid::Uuid::new_v4());

            copy("/etc/hosts", &path).await.unwrap();

            assert_eq!(read("/etc/hosts").await.unwrap(), read(&path).await.unwrap());

            remove_file(&path).await.unwrap();
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn truncates_file() {
        start(|| async {
            let path = format!("/tmp/{}", uuid::Uuid::new_v4());
            write(&path, b"hi").await.unwrap();

            write(&path, b"hello").await.unwrap();

            assert_eq!(read(&path).await.unwrap(), b"hello");
            remove_file(&path).await.unwrap();
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn appends_to_file() {
        start(|| async {
            let path = format!("/tmp/{}", uuid::Uuid::new_v4());
            write(&path, b"hi ").await.unwrap();

            let file = File::options().append(true).open(&path).await.unwrap();
            file.write_all(b"hello").await.unwrap();

            assert_eq!(read(&path).await.unwrap(), b"hi hello");
            remove_file(&path).await.unwrap();
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn creates_directory() {
        start(|| async {
            let path = format!("/tmp/{}", uuid::Uuid::new_v4());

            create_dir(&path).await.unwrap();
            assert!(Path::new(&path).is_dir());

            std::fs::remove_dir(&path).unwrap();
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn queries_metadata() {
        start(|| async {
            let ours = metadata("/etc/hosts").await.unwrap();
            let theirs = std::fs::metadata("/etc/hosts").unwrap();

            assert_eq!(ours.file_type(), theirs.file_type());
            assert_eq!(ours.is_dir(), theirs.is_dir());
            assert_eq!(ours.is_file(), theirs.is_file());
            assert_eq!(ours.len(), theirs.len());
            assert_eq!(ours.permissions(), theirs.permissions());

            use std::os::unix::fs::MetadataExt;
            assert_eq!(ours.ino(), theirs.ino());
            assert_eq!(ours.mode(), theirs.mode());
        })
        .unwrap()
        .unwrap();
    }
}
