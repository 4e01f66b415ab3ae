//! Routing from a changed source file to the test globs it affects.

use crate::error::{Error, Result};
use std::path::Path;

/// Components of a file path, in the shape of Node's `path.parse`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPath {
    /// `/` for absolute paths, empty otherwise.
    pub root: String,
    /// Parent directory.
    pub dir: String,
    /// File name with extension.
    pub base: String,
    /// Extension including the leading dot, or empty.
    pub ext: String,
    /// File name without extension.
    pub name: String,
}

impl ParsedPath {
    #[must_use]
    pub fn parse(resource: &str) -> Self {
        let path = Path::new(resource);
        let root = if path.has_root() {
            path.components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Node treats a leading dot as part of the name, not an extension.
        let (name, ext) = match base.rfind('.') {
            Some(idx) if idx > 0 => (base[..idx].to_string(), base[idx..].to_string()),
            _ => (base.clone(), String::new()),
        };

        Self {
            root,
            dir,
            base,
            ext,
            name,
        }
    }
}

/// Test globs produced by a router for one changed file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Route {
    /// The change affects no tests.
    #[default]
    None,
    Pattern(String),
    Patterns(Vec<String>),
}

impl Route {
    /// Usable patterns, with empty strings dropped.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::None => &[],
            Self::Pattern(p) => std::slice::from_ref(p),
            Self::Patterns(ps) => ps,
        };
        slice.iter().map(String::as_str).filter(|p| !p.is_empty())
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.patterns().next().is_none()
    }
}

impl From<&str> for Route {
    fn from(pattern: &str) -> Self {
        Self::Pattern(pattern.to_string())
    }
}

impl From<Vec<String>> for Route {
    fn from(patterns: Vec<String>) -> Self {
        Self::Patterns(patterns)
    }
}

/// Maps a changed file to the test globs that cover it.
pub trait Router {
    fn route(&self, resource: &ParsedPath) -> Route;
}

impl<F> Router for F
where
    F: Fn(&ParsedPath) -> Route,
{
    fn route(&self, resource: &ParsedPath) -> Route {
        self(resource)
    }
}

/// Router built from glob templates.
///
/// Templates may reference the changed file through `{name}`, `{ext}`,
/// `{base}` and `{dir}`. A template without placeholders routes every change
/// to the same glob.
#[derive(Debug, Clone)]
pub struct TemplateRouter {
    templates: Vec<String>,
}

const PLACEHOLDERS: &[&str] = &["{name}", "{ext}", "{base}", "{dir}"];

impl TemplateRouter {
    /// Build a router, rejecting templates with unknown placeholders or
    /// invalid glob syntax.
    pub fn new<I, S>(templates: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let templates: Vec<String> = templates.into_iter().map(Into::into).collect();
        for template in &templates {
            validate_template(template)?;
        }
        Ok(Self { templates })
    }

    #[must_use]
    pub fn templates(&self) -> &[String] {
        &self.templates
    }
}

impl Router for TemplateRouter {
    fn route(&self, resource: &ParsedPath) -> Route {
        let patterns: Vec<String> = self
            .templates
            .iter()
            .map(|t| {
                t.replace("{name}", &glob::Pattern::escape(&resource.name))
                    .replace("{ext}", &glob::Pattern::escape(&resource.ext))
                    .replace("{base}", &glob::Pattern::escape(&resource.base))
                    .replace("{dir}", &glob::Pattern::escape(&resource.dir))
            })
            .collect();
        if patterns.is_empty() {
            Route::None
        } else {
            Route::Patterns(patterns)
        }
    }
}

fn validate_template(template: &str) -> Result<()> {
    let mut stripped = template.to_string();
    for placeholder in PLACEHOLDERS {
        stripped = stripped.replace(placeholder, "x");
    }
    if let Some(start) = stripped.find('{') {
        let end = stripped[start..].find('}').map_or(stripped.len(), |e| start + e + 1);
        return Err(Error::InvalidRouter {
            template: template.to_string(),
            reason: format!("unknown placeholder `{}`", &stripped[start..end]),
        });
    }
    glob::Pattern::new(&stripped).map_err(|e| Error::InvalidRouter {
        template: template.to_string(),
        reason: e.msg.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path() {
        let parsed = ParsedPath::parse("/home/user/dir/file.spec.js");
        assert_eq!(parsed.root, "/");
        assert_eq!(parsed.dir, "/home/user/dir");
        assert_eq!(parsed.base, "file.spec.js");
        assert_eq!(parsed.ext, ".js");
        assert_eq!(parsed.name, "file.spec");
    }

    #[test]
    fn test_parse_dotfile_and_relative() {
        let parsed = ParsedPath::parse(".eslintrc");
        assert_eq!(parsed.root, "");
        assert_eq!(parsed.name, ".eslintrc");
        assert_eq!(parsed.ext, "");

        let parsed = ParsedPath::parse("src/a");
        assert_eq!(parsed.dir, "src");
        assert_eq!(parsed.name, "a");
    }

    #[test]
    fn test_route_patterns_skip_empty() {
        let route = Route::Patterns(vec![String::new(), "**/*.js".into()]);
        assert_eq!(route.patterns().collect::<Vec<_>>(), vec!["**/*.js"]);
        assert!(Route::from("").is_none());
        assert!(Route::None.is_none());
    }

    #[test]
    fn test_closure_router() {
        let router = |p: &ParsedPath| Route::from(format!("**/{}.spec.js", p.name).as_str());
        let route = router.route(&ParsedPath::parse("/src/module-1.js"));
        assert_eq!(route, Route::Pattern("**/module-1.spec.js".into()));
    }

    #[test]
    fn test_template_router() {
        let router = TemplateRouter::new(["**/{name}.spec{ext}", "**/*.test.js"]).unwrap();
        let route = router.route(&ParsedPath::parse("/src/util.js"));
        assert_eq!(
            route,
            Route::Patterns(vec!["**/util.spec.js".into(), "**/*.test.js".into()])
        );
    }

    #[test]
    fn test_template_router_rejects_bad_templates() {
        assert!(matches!(
            TemplateRouter::new(["**/{file}.js"]),
            Err(Error::InvalidRouter { .. })
        ));
        assert!(TemplateRouter::new(["***/a.js"]).is_err());
    }
}
