use log::debug;
use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

fn held() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Identity of `path` that stays the same whether or not it exists yet:
/// the deepest existing ancestor is resolved and the missing tail appended.
fn claim_key(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut missing: Vec<OsString> = Vec::new();
    let mut existing = absolute.as_path();
    loop {
        if let Ok(mut key) = existing.canonicalize() {
            key.extend(missing.iter().rev());
            return key;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Process-wide claim on one PKI directory. At most one mutating operation
/// holds it at a time; dropping the guard releases it.
#[derive(Debug)]
pub struct DirectoryLock {
    key: PathBuf,
}

impl DirectoryLock {
    /// Claim `path`, or `None` when another operation already holds it.
    pub fn try_acquire(path: &Path) -> Option<Self> {
        let key = claim_key(path);
        let mut held = held().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.clone()) {
            debug!("{} is busy", key.display());
            return None;
        }
        Some(Self { key })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let mut held = held().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}
