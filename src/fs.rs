//! Static file support.
//!
//! The server does not touch a filesystem itself. Platforms provide a [`FileSource`], which is
//! consulted by [`Request::send_file`](crate::request::Request::send_file) and by deferred
//! uploads. Paths given to a `FileSource` are request paths such as `/css/site.css`; mapping
//! them onto a mount point is the source's business.

use arrayvec::ArrayString;

use crate::ascii::eq_ignore_case;

/// Opaque handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileHandle(pub u32);

/// An opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileInfo {
    /// Handle for subsequent reads.
    pub handle: FileHandle,
    /// Size in bytes.
    pub size: u32,
    /// The path names a directory.
    pub is_dir: bool,
}

/// Filesystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum FsError {
    /// No such file.
    NotFound,
    /// The operation is not supported by this source.
    Unsupported,
    /// The underlying storage failed.
    Io,
}

/// A read (and optionally write) file store.
pub trait FileSource {
    /// Open `path` for reading.
    fn open(&mut self, path: &str) -> Result<FileInfo, FsError>;

    /// Read from the current position into `buf`. Returns 0 at end of file.
    fn read(&mut self, file: FileHandle, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Release a handle returned by [`FileSource::open`] or [`FileSource::create`].
    fn close(&mut self, file: FileHandle);

    /// Create (or truncate) `path` for writing.
    fn create(&mut self, _path: &str) -> Result<FileHandle, FsError> {
        Err(FsError::Unsupported)
    }

    /// Append `data` to a file returned by [`FileSource::create`].
    fn write(&mut self, _file: FileHandle, _data: &[u8]) -> Result<usize, FsError> {
        Err(FsError::Unsupported)
    }
}

/// A content type mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MimeType {
    /// Extension without the dot.
    pub ext: &'static str,
    /// Content type.
    pub mime: &'static str,
    /// The type is text.
    pub text: bool,
    /// Responses of this type may be cached by clients.
    pub cache: bool,
}

const fn mime(ext: &'static str, mime: &'static str, text: bool, cache: bool) -> MimeType {
    MimeType {
        ext,
        mime,
        text,
        cache,
    }
}

/// Known extensions, most frequently requested first.
pub const MIME_TYPES: &[MimeType] = &[
    mime("html", "text/html", true, false),
    mime("js", "application/javascript", true, true),
    mime("css", "text/css", true, true),
    mime("json", "application/json", true, false),
    mime("png", "image/png", false, true),
    mime("jpg", "image/jpeg", false, true),
    mime("svg", "image/svg+xml", true, true),
    mime("ico", "image/x-icon", false, true),
    mime("htm", "text/html", true, false),
    mime("xml", "application/xml", true, false),
    mime("jpeg", "image/jpeg", false, true),
    mime("gif", "image/gif", false, true),
    mime("webp", "image/webp", false, true),
    mime("txt", "text/plain", true, false),
    mime("woff2", "font/woff2", false, true),
    mime("woff", "font/woff", false, true),
    mime("ttf", "font/ttf", false, true),
    mime("otf", "font/otf", false, true),
    mime("pdf", "application/pdf", false, true),
    mime("zip", "application/zip", false, false),
    mime("gz", "application/gzip", false, false),
];

/// Content type for unknown extensions.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Mapping for the extension of `path`, compared case insensitively.
pub fn lookup_mime(path: &str) -> Option<&'static MimeType> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }

    MIME_TYPES
        .iter()
        .find(|m| eq_ignore_case(m.ext.as_bytes(), ext.as_bytes()))
}

/// Content type of `path`.
pub fn mime_type(path: &str) -> &'static str {
    lookup_mime(path).map_or(DEFAULT_MIME, |m| m.mime)
}

/// A file located by [`resolve`], open and ready to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFile {
    /// The open file.
    pub info: FileInfo,
    /// The `.gz` sibling was found instead of the file itself.
    pub gzipped: bool,
    /// Content type, from the requested name.
    pub mime: &'static str,
    /// Clients may cache the response.
    pub cacheable: bool,
}

type PathBuf = ArrayString<256>;

fn open_plain_or_gz(fs: &mut dyn FileSource, path: &str) -> Option<(FileInfo, bool)> {
    if let Ok(info) = fs.open(path) {
        return Some((info, false));
    }

    let mut gz = PathBuf::new();
    gz.try_push_str(path).ok()?;
    gz.try_push_str(".gz").ok()?;
    fs.open(&gz).ok().map(|info| (info, true))
}

/// Locate `path`: the file itself, then its `.gz` sibling, then for paths ending in `/` the
/// directory's `index.html` (or `index.html.gz`). Paths containing `..` are refused, as are
/// directories.
pub fn resolve(fs: &mut dyn FileSource, path: &str) -> Option<ResolvedFile> {
    if path.contains("..") {
        warn!("refusing path with parent reference");
        return None;
    }

    let mut index = PathBuf::new();
    let (found, name) = match open_plain_or_gz(fs, path) {
        Some(found) => (found, path),
        None if path.ends_with('/') => {
            index.try_push_str(path).ok()?;
            index.try_push_str("index.html").ok()?;
            (open_plain_or_gz(fs, &index)?, index.as_str())
        }
        None => return None,
    };

    let (info, gzipped) = found;
    if info.is_dir {
        fs.close(info.handle);
        return None;
    }

    let mime = lookup_mime(name);
    Some(ResolvedFile {
        info,
        gzipped,
        mime: mime.map_or(DEFAULT_MIME, |m| m.mime),
        cacheable: mime.is_some_and(|m| m.cache),
    })
}

/// Whether `path` (or its `.gz` sibling) exists and is not a directory.
pub fn exists(fs: &mut dyn FileSource, path: &str) -> bool {
    match open_plain_or_gz(fs, path) {
        Some((info, _)) => {
            fs.close(info.handle);
            !info.is_dir
        }
        None => false,
    }
}
