//! CommonJS request resolution for the host loader.
//!
//! Relative, absolute and bare (`node_modules`) requests. Files are probed
//! as-is first, then with each of [`EXTENSIONS`] appended, then as a
//! directory (`package.json` `main`, then `index.*`).

use std::path::{Path, PathBuf};

/// Extensions probed after the exact path.
pub const EXTENSIONS: &[&str] = &[".js", ".json", ".cjs", ".mjs"];

/// Modules served by the runtime itself.
pub const BUILTINS: &[&str] = &["assert", "assert/strict", "path"];

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Builtin(String),
    /// Canonical path of a file on disk.
    File(PathBuf),
}

impl Resolved {
    #[must_use]
    pub fn as_file(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Builtin(_) => None,
        }
    }
}

/// Resolve `request` as if required from a module in `parent_dir`.
#[must_use]
pub fn resolve(request: &str, parent_dir: &Path) -> Option<Resolved> {
    if request.is_empty() {
        return None;
    }

    let builtin = request.strip_prefix("node:").unwrap_or(request);
    if BUILTINS.contains(&builtin) {
        return Some(Resolved::Builtin(builtin.to_string()));
    }
    if request.starts_with("node:") {
        return None;
    }

    let resolved = if is_path_request(request) {
        resolve_path(&parent_dir.join(request))
    } else {
        resolve_bare(request, parent_dir)
    };
    resolved.map(|path| Resolved::File(canonical(&path)))
}

fn is_path_request(request: &str) -> bool {
    request == "."
        || request == ".."
        || request.starts_with("./")
        || request.starts_with("../")
        || Path::new(request).is_absolute()
}

fn canonical(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn resolve_path(base: &Path) -> Option<PathBuf> {
    resolve_file(base).or_else(|| resolve_directory(base))
}

fn resolve_file(base: &Path) -> Option<PathBuf> {
    if base.is_file() {
        return Some(base.to_path_buf());
    }
    EXTENSIONS.iter().find_map(|ext| {
        let mut candidate = base.as_os_str().to_owned();
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        candidate.is_file().then_some(candidate)
    })
}

fn resolve_directory(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }

    if let Some(main) = package_main(&dir.join("package.json")) {
        let main_path = dir.join(main);
        if let Some(found) = resolve_file(&main_path).or_else(|| resolve_index(&main_path)) {
            return Some(found);
        }
    }

    resolve_index(dir)
}

fn resolve_index(dir: &Path) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("index{ext}")))
        .find(|index| index.is_file())
}

fn package_main(pkg_json: &Path) -> Option<String> {
    let text = std::fs::read_to_string(pkg_json).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    value
        .get("main")
        .and_then(serde_json::Value::as_str)
        .filter(|main| !main.is_empty())
        .map(str::to_string)
}

fn resolve_bare(request: &str, parent_dir: &Path) -> Option<PathBuf> {
    let mut current = Some(parent_dir);
    while let Some(dir) = current {
        let node_modules = dir.join("node_modules");
        if node_modules.is_dir() {
            if let Some(found) = resolve_path(&node_modules.join(request)) {
                return Some(found);
            }
        }
        current = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/lib")).unwrap();
        fs::write(root.join("src/a.js"), "").unwrap();
        fs::write(root.join("src/data.json"), "{}").unwrap();
        fs::write(root.join("src/lib/index.js"), "").unwrap();
        fs::create_dir_all(root.join("node_modules/left-pad/dist")).unwrap();
        fs::write(
            root.join("node_modules/left-pad/package.json"),
            r#"{ "main": "./dist/main" }"#,
        )
        .unwrap();
        fs::write(root.join("node_modules/left-pad/dist/main.js"), "").unwrap();
        fs::create_dir_all(root.join("node_modules/@scope/pkg")).unwrap();
        fs::write(root.join("node_modules/@scope/pkg/index.js"), "").unwrap();
        fs::write(root.join("node_modules/@scope/pkg/extra.js"), "").unwrap();
        dir
    }

    fn file(dir: &Path, rel: &str) -> Option<Resolved> {
        Some(Resolved::File(dunce::canonicalize(dir.join(rel)).unwrap()))
    }

    #[test]
    fn test_builtins() {
        let dir = project();
        assert_eq!(
            resolve("node:path", dir.path()),
            Some(Resolved::Builtin("path".into()))
        );
        assert_eq!(
            resolve("assert", dir.path()),
            Some(Resolved::Builtin("assert".into()))
        );
        assert_eq!(resolve("node:fs", dir.path()), None);
    }

    #[test]
    fn test_relative_with_extension_probing() {
        let dir = project();
        let src = dir.path().join("src");
        assert_eq!(resolve("./a", &src), file(dir.path(), "src/a.js"));
        assert_eq!(resolve("./a.js", &src), file(dir.path(), "src/a.js"));
        assert_eq!(resolve("./data", &src), file(dir.path(), "src/data.json"));
        assert_eq!(resolve("./lib", &src), file(dir.path(), "src/lib/index.js"));
        assert_eq!(resolve("../src/a", &src.join("lib")), file(dir.path(), "src/a.js"));
        assert_eq!(resolve("./missing", &src), None);
    }

    #[test]
    fn test_absolute() {
        let dir = project();
        let abs = dir.path().join("src/a").to_string_lossy().into_owned();
        assert_eq!(resolve(&abs, Path::new("/")), file(dir.path(), "src/a.js"));
    }

    #[test]
    fn test_node_modules_walks_up() {
        let dir = project();
        let nested = dir.path().join("src/lib");
        assert_eq!(
            resolve("left-pad", &nested),
            file(dir.path(), "node_modules/left-pad/dist/main.js")
        );
        assert_eq!(
            resolve("@scope/pkg", &nested),
            file(dir.path(), "node_modules/@scope/pkg/index.js")
        );
        assert_eq!(
            resolve("@scope/pkg/extra", &nested),
            file(dir.path(), "node_modules/@scope/pkg/extra.js")
        );
        assert_eq!(resolve("nope", &nested), None);
    }
}
