use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Read a file to string, replacing invalid UTF-8 sequences with the replacement character.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn read_to_string_lossy(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Lexically normalize a path: drop `.` segments and fold `..` into the
/// preceding segment. Does not touch the filesystem.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join `request` onto `base` and normalize the result, the way
/// `path.resolve(base, request)` treats relative and absolute requests.
#[must_use]
pub fn resolve_against(base: &Path, request: &str) -> PathBuf {
    normalize_path(&base.join(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_to_string_lossy() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello \xff world").unwrap();
        file.flush().unwrap();

        let content = read_to_string_lossy(file.path()).unwrap();
        assert!(content.starts_with("hello "));
        assert!(content.ends_with(" world"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d.js")),
            PathBuf::from("/a/c/d.js")
        );
        assert_eq!(normalize_path(Path::new("a/./b")), PathBuf::from("a/b"));
    }

    #[test]
    fn test_resolve_against() {
        assert_eq!(
            resolve_against(Path::new("/proj/src"), "./lib/a"),
            PathBuf::from("/proj/src/lib/a")
        );
        assert_eq!(
            resolve_against(Path::new("/proj/src"), "../test/x.js"),
            PathBuf::from("/proj/test/x.js")
        );
        assert_eq!(
            resolve_against(Path::new("/proj/src"), "/abs/y.js"),
            PathBuf::from("/abs/y.js")
        );
    }
}
