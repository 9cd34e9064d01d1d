use log::debug;
use std::path::PathBuf;

use super::validation::validate_template_name;

/// Source of Easy-RSA vars files. Contents are handed to Easy-RSA untouched.
pub trait TemplateProvider: Send + Sync {
    /// Path of the vars file for `name`, or `None` if there is no such template.
    fn resolve(&self, name: &str) -> Option<PathBuf>;

    /// Names this provider can resolve, for display.
    fn available(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Templates stored as `<dir>/<name>.vars`.
#[derive(Debug, Clone)]
pub struct VarsDirectory {
    dir: PathBuf,
}

impl VarsDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TemplateProvider for VarsDirectory {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if let Err(e) = validate_template_name(name) {
            debug!("rejecting template {:?}: {}", name, e);
            return None;
        }
        let path = self.dir.join(format!("{}.vars", name));
        if path.is_file() {
            Some(path)
        } else {
            debug!("template {} not found at {}", name, path.display());
            None
        }
    }

    fn available(&self) -> Vec<String> {
        let Ok(listing) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = listing
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("vars"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

/// Provider with no templates; every lookup fails.
#[derive(Debug, Clone, Default)]
pub struct NoTemplates;

impl TemplateProvider for NoTemplates {
    fn resolve(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolves_vars_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("short-lived.vars"), "set_var EASYRSA_CERT_EXPIRE 30\n").unwrap();
        fs::write(temp_dir.path().join("readme.txt"), "").unwrap();

        let provider = VarsDirectory::new(temp_dir.path());
        assert_eq!(
            provider.resolve("short-lived"),
            Some(temp_dir.path().join("short-lived.vars"))
        );
        assert_eq!(provider.resolve("missing"), None);
        assert_eq!(provider.available(), vec!["short-lived".to_string()]);
    }

    #[test]
    fn test_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let inner = temp_dir.path().join("templates");
        fs::create_dir(&inner).unwrap();
        fs::write(temp_dir.path().join("outside.vars"), "").unwrap();

        let provider = VarsDirectory::new(&inner);
        assert_eq!(provider.resolve("../outside"), None);
        assert_eq!(NoTemplates.resolve("anything"), None);
    }
}
