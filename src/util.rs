use crate::prelude::*;
use std::fs::File;
use std::io;
use std::path::Component;
use std::sync::{Mutex, MutexGuard};

/// fs2's lock calls are thin wrappers around flock(2)/lockf and don't handle
/// EINTR themselves.
pub fn retry_interrupted<T, F>(mut f: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

#[cfg(unix)]
const DIR_PERMS: u32 = 0o700;
#[cfg(unix)]
const FILE_PERMS: u32 = 0o600;

/// Cache directories are owner-only.
#[cfg(unix)]
pub fn fix_dir_perms(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path)?;
    if meta.permissions().mode() & 0o777 != DIR_PERMS {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_PERMS))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn fix_dir_perms(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Cache files are owner read/write only.
#[cfg(unix)]
pub fn fix_file_perms(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = file.metadata()?;
    if meta.permissions().mode() & 0o777 != FILE_PERMS {
        file.set_permissions(std::fs::Permissions::from_mode(FILE_PERMS))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn fix_file_perms(_file: &File) -> io::Result<()> {
    Ok(())
}

/// Validate and normalize a lookup path into a relative path safe to join
/// under both the source root and the cache root. Dot-prefixed segments are
/// reserved (the pool lock lives at `.lock`), and `..`/absolute paths would
/// escape the roots.
pub fn clean_rel_path(path: &str) -> Result<PathBuf, CacheError> {
    let mut out = PathBuf::new();
    let mut any = false;
    for comp in Path::new(path).components() {
        match comp {
            Component::Normal(part) => {
                let part_str = part.to_string_lossy();
                if part_str.starts_with('.') {
                    return Err(CacheError::InvalidPath(path.to_owned()));
                }
                out.push(part);
                any = true;
            }
            Component::CurDir => continue,
            _ => return Err(CacheError::InvalidPath(path.to_owned())),
        }
    }
    if !any {
        return Err(CacheError::InvalidPath(path.to_owned()));
    }
    Ok(out)
}

/// A poisoned mutex only means some other thread panicked mid-update; the
/// guarded state here is always valid (plain maps and counters), so recover
/// the guard instead of propagating the panic.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
