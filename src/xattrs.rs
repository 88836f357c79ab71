use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

/// Content SHA-256, hex. Attached to script files and image blobs.
pub const HASH_ATTR: &str = "user.hash";
/// Name of the image a job is bound to. Attached to the job `properties` file.
pub const IMAGE_ATTR: &str = "user.image";
/// Comma-joined artifact paths declared for a job.
pub const ARTIFACTS_ATTR: &str = "user.artifacts";
/// Exit code of the job's last run.
pub const EXIT_CODE_ATTR: &str = "user.exit_code";
/// Persisted state label of a job.
pub const STATE_ATTR: &str = "user.state";

/// Read a user extended attribute. An absent attribute is `None`.
///
/// On filesystems without user xattr support the per-attribute sidecar
/// file is consulted instead, so metadata semantics are identical either
/// way.
pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    match xattr::get(path, name) {
        Ok(value) => Ok(value),
        Err(err) if unsupported(&err) => {
            trace!("xattrs unsupported at {}, using sidecar", path.display());
            read_sidecar(path, name)
        }
        Err(err) => Err(err),
    }
}

/// Read an attribute as UTF-8 text. Undecodable values count as absent.
pub fn get_string(path: &Path, name: &str) -> io::Result<Option<String>> {
    Ok(get(path, name)?.and_then(|value| String::from_utf8(value).ok()))
}

/// Write a user extended attribute, falling back to the sidecar file on
/// filesystems without user xattr support.
pub fn set(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    match xattr::set(path, name, value) {
        Ok(()) => Ok(()),
        Err(err) if unsupported(&err) => {
            trace!("xattrs unsupported at {}, using sidecar", path.display());
            write_sidecar(path, name, value)
        }
        Err(err) => Err(err),
    }
}

fn unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported
}

/// Sidecar location for one attribute: a hidden file next to the target,
/// keyed by the same attribute name.
fn sidecar_path(path: &Path, name: &str) -> PathBuf {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file}.{name}"))
}

fn read_sidecar(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(sidecar_path(path, name)) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_sidecar(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    std::fs::write(sidecar_path(path, name), value)
}
