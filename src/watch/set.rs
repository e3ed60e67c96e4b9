use std::path::{Component, Path, PathBuf};

use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode};

use crate::supervisor::error::SupervisorError;

/// Paths and glob patterns a unit reloads on.
///
/// Plain directories are watched recursively, plain files through their
/// parent directory (editors often replace files on save), and each glob
/// through the literal directory prefix before its first wildcard.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    roots: Vec<(PathBuf, RecursiveMode)>,
    plain: Vec<PathBuf>,
    patterns: Vec<glob::Pattern>,
}

impl WatchSet {
    pub fn parse(entries: &[String]) -> Result<Self, SupervisorError> {
        let mut set = Self::default();

        for entry in entries {
            if is_glob(entry) {
                let (base, rest) = split_glob(entry);
                let base = absolute(&base);
                let full = base.join(rest);
                let pattern = glob::Pattern::new(&full.to_string_lossy()).map_err(|e| {
                    SupervisorError::InvalidPattern {
                        pattern: entry.clone(),
                        reason: e.to_string(),
                    }
                })?;
                set.add_root(base, RecursiveMode::Recursive);
                set.patterns.push(pattern);
                continue;
            }

            let path = absolute(Path::new(entry));
            if path.is_dir() {
                set.add_root(path.clone(), RecursiveMode::Recursive);
            } else {
                let parent = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| path.clone());
                set.add_root(parent, RecursiveMode::NonRecursive);
            }
            set.plain.push(path);
        }

        Ok(set)
    }

    fn add_root(&mut self, path: PathBuf, mode: RecursiveMode) {
        if let Some(existing) = self.roots.iter_mut().find(|(p, _)| *p == path) {
            if mode == RecursiveMode::Recursive {
                existing.1 = RecursiveMode::Recursive;
            }
            return;
        }
        self.roots.push((path, mode));
    }

    pub fn roots(&self) -> &[(PathBuf, RecursiveMode)] {
        &self.roots
    }

    /// Whether a changed path belongs to this set.
    pub fn matches(&self, path: &Path) -> bool {
        if is_temp_file(path) {
            return false;
        }
        self.plain.iter().any(|p| path.starts_with(p))
            || self.patterns.iter().any(|p| p.matches_path(path))
    }

    /// Whether a raw notify event counts as a change of this set.
    pub fn is_change(&self, event: &notify::Event) -> bool {
        let relevant = match event.kind {
            EventKind::Create(_) | EventKind::Remove(_) => true,
            // mtime/atime/chmod noise
            EventKind::Modify(ModifyKind::Metadata(_)) => false,
            EventKind::Modify(_) => true,
            _ => false,
        };
        relevant && event.paths.iter().any(|path| self.matches(path))
    }
}

fn is_glob(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

/// Split a glob into its literal directory prefix and the wildcard remainder.
fn split_glob(entry: &str) -> (PathBuf, PathBuf) {
    let mut base = PathBuf::new();
    let mut rest = PathBuf::new();
    let mut in_pattern = false;

    for component in Path::new(entry).components() {
        let text = component.as_os_str().to_string_lossy();
        if !in_pattern && !is_glob(&text) {
            base.push(component);
        } else {
            in_pattern = true;
            rest.push(component);
        }
    }

    if base.as_os_str().is_empty() {
        base.push(Component::CurDir);
    }
    (base, rest)
}

/// Absolute, symlink-resolved form of `path` when it exists.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Editor swap and backup files.
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with(".#")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(kind: EventKind, path: &Path) -> notify::Event {
        notify::Event {
            kind,
            paths: vec![path.to_path_buf()],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_split_glob() {
        assert_eq!(
            split_glob("src/lib/**/*.js"),
            (PathBuf::from("src/lib"), PathBuf::from("**/*.js"))
        );
        assert_eq!(split_glob("*.sh"), (PathBuf::from("."), PathBuf::from("*.sh")));
    }

    #[test]
    fn test_plain_file_watches_parent_directory() {
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("module.sh");
        std::fs::write(&module, "").unwrap();

        let set = WatchSet::parse(&[module.to_string_lossy().into_owned()]).unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(set.roots(), &[(root.clone(), RecursiveMode::NonRecursive)]);

        let canonical = std::fs::canonicalize(&module).unwrap();
        assert!(set.matches(&canonical));
        assert!(!set.matches(&root.join("other.sh")));
    }

    #[test]
    fn test_directory_and_glob_entries() {
        let dir = TempDir::new().unwrap();
        let lib = dir.path().join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();

        let entries = vec![
            lib.to_string_lossy().into_owned(),
            format!("{}/conf/*.toml", dir.path().display()),
        ];
        let set = WatchSet::parse(&entries).unwrap();

        assert!(set.matches(&root.join("lib/deep/file.js")));
        assert!(set.matches(&root.join("conf/app.toml")));
        assert!(!set.matches(&root.join("conf/app.json")));
        assert!(!set.matches(&root.join("lib/.#file.js")));
        assert!(!set.matches(&root.join("lib/file.js.swp")));
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let err = WatchSet::parse(&["src/[*.js".to_string()]).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPattern { .. }));
    }

    #[test]
    fn test_event_kinds() {
        let dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let set = WatchSet::parse(&[root.to_string_lossy().into_owned()]).unwrap();
        let file = root.join("a.js");

        assert!(set.is_change(&event(EventKind::Create(notify::event::CreateKind::File), &file)));
        assert!(set.is_change(&event(EventKind::Remove(notify::event::RemoveKind::File), &file)));
        assert!(set.is_change(&event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
            &file
        )));
        assert!(!set.is_change(&event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Any)),
            &file
        )));
        assert!(!set.is_change(&event(EventKind::Access(notify::event::AccessKind::Any), &file)));
    }
}
