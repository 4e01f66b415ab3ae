//! Compile-time constant replacement.
//!
//! Mirrors the bundler's define plugin for code that runs in the sandbox
//! instead of the bundle: every whole-expression occurrence of a configured
//! key (`process.env.NODE_ENV`, `typeof window`, `__DEV__`) is replaced by
//! the literal form of its value. String literals, comments and the text
//! parts of template literals are left untouched; `${...}` expressions are
//! rewritten like any other code.

use crate::compiler::{CompileError, CompiledSource, CompilerPlugin};
use serde_json::Value;
use std::collections::BTreeMap;

/// Compiler stage that substitutes defined expressions.
#[derive(Debug, Clone, Default)]
pub struct DefineCompiler {
    /// (expression, replacement) sorted longest expression first.
    definitions: Vec<(String, String)>,
}

impl DefineCompiler {
    /// Build from expression → value pairs. Strings become quoted literals,
    /// everything else is emitted as JSON.
    #[must_use]
    pub fn new(definitions: &BTreeMap<String, Value>) -> Self {
        let mut definitions: Vec<(String, String)> = definitions
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| (key.trim().to_string(), literal(value)))
            .collect();
        definitions.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { definitions }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Apply all replacements to `source`.
    #[must_use]
    pub fn replace(&self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = String::with_capacity(source.len());
        let mut i = 0;
        let mut prev_significant: Option<u8> = None;
        // Open brace depth of each `${` currently being scanned.
        let mut interpolations: Vec<usize> = Vec::new();

        while i < bytes.len() {
            let b = bytes[i];

            // A backtick opens a template, a `}` at depth zero resumes one.
            if b == b'`' || (b == b'}' && interpolations.last() == Some(&0)) {
                if b == b'}' {
                    interpolations.pop();
                }
                let (end, opened) = template_chunk(bytes, i + 1);
                out.push_str(&source[i..end]);
                prev_significant = Some(bytes[end - 1]);
                if opened {
                    interpolations.push(0);
                }
                i = end;
                continue;
            }
            if let Some(depth) = interpolations.last_mut() {
                match b {
                    b'{' => *depth += 1,
                    b'}' => *depth -= 1,
                    _ => {}
                }
            }

            // Skip over literals and comments verbatim.
            let skip_to = match b {
                b'\'' | b'"' => Some(skip_string(bytes, i)),
                b'/' if bytes.get(i + 1) == Some(&b'/') => Some(skip_line_comment(bytes, i)),
                b'/' if bytes.get(i + 1) == Some(&b'*') => Some(skip_block_comment(bytes, i)),
                _ => None,
            };
            if let Some(end) = skip_to {
                out.push_str(&source[i..end]);
                prev_significant = Some(bytes[end - 1]);
                i = end;
                continue;
            }

            let boundary_before = prev_significant.map_or(true, |p| !is_ident_byte(p) && p != b'.');
            if boundary_before {
                if let Some((key, value)) = self.match_at(source, i) {
                    out.push_str(value);
                    i += key.len();
                    prev_significant = value.as_bytes().last().copied();
                    continue;
                }
            }

            let ch = source[i..].chars().next().unwrap_or('\u{fffd}');
            out.push(ch);
            if !ch.is_whitespace() || ch == '\n' {
                prev_significant = Some(b);
            } else {
                prev_significant = Some(b' ');
            }
            i += ch.len_utf8();
        }

        out
    }

    fn match_at<'a>(&'a self, source: &str, at: usize) -> Option<(&'a str, &'a str)> {
        let rest = &source[at..];
        self.definitions.iter().find_map(|(key, value)| {
            if !rest.starts_with(key.as_str()) {
                return None;
            }
            let after = rest.as_bytes().get(key.len()).copied();
            if after.is_some_and(is_ident_byte) {
                return None;
            }
            Some((key.as_str(), value.as_str()))
        })
    }
}

impl CompilerPlugin for DefineCompiler {
    fn name(&self) -> &str {
        "define"
    }

    fn compile(&self, input: &str, _filename: &str) -> Result<Option<CompiledSource>, CompileError> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(CompiledSource::code(self.replace(input))))
    }
}

fn literal(value: &Value) -> String {
    // JSON text is a valid JS literal for every value kind.
    value.to_string()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Scan template text from `start` up to the closing backtick or the next
/// `${`. Returns the index just past it and whether an interpolation opened.
fn template_chunk(bytes: &[u8], start: usize) -> (usize, bool) {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return (i + 1, false),
            b'$' if bytes.get(i + 1) == Some(&b'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (bytes.len(), false)
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn define(pairs: &[(&str, Value)]) -> DefineCompiler {
        let map: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        DefineCompiler::new(&map)
    }

    #[test]
    fn test_replaces_member_chain_and_typeof() {
        let compiler = define(&[
            ("process.env.NODE_ENV", json!("production")),
            ("typeof window", json!("object")),
        ]);

        let out = compiler.replace(
            "if (process.env.NODE_ENV === 'production') {\n  console.log(typeof window);\n}",
        );
        assert_eq!(
            out,
            "if (\"production\" === 'production') {\n  console.log(\"object\");\n}"
        );
    }

    #[test]
    fn test_respects_identifier_boundaries() {
        let compiler = define(&[("DEBUG", json!(false))]);
        assert_eq!(
            compiler.replace("DEBUG && IS_DEBUG && obj.DEBUG && DEBUG_X"),
            "false && IS_DEBUG && obj.DEBUG && DEBUG_X"
        );
    }

    #[test]
    fn test_skips_strings_and_comments() {
        let compiler = define(&[("__VERSION__", json!("1.0"))]);
        let out = compiler.replace("// __VERSION__\nconst s = '__VERSION__'; const v = __VERSION__;");
        assert_eq!(out, "// __VERSION__\nconst s = '__VERSION__'; const v = \"1.0\";");
    }

    #[test]
    fn test_rewrites_template_interpolations() {
        let compiler = define(&[("__DEV__", json!(false)), ("MODE", json!("test"))]);
        assert_eq!(
            compiler.replace("const s = `mode ${__DEV__}`;"),
            "const s = `mode ${false}`;"
        );
        assert_eq!(
            compiler.replace("`__DEV__ ${ { a: MODE }.a } ${`in ${MODE}`} MODE` + MODE"),
            "`__DEV__ ${ { a: \"test\" }.a } ${`in ${\"test\"}`} MODE` + \"test\""
        );
        assert_eq!(compiler.replace("`a\\${__DEV__}`"), "`a\\${__DEV__}`");
    }

    #[test]
    fn test_longest_key_wins() {
        let compiler = define(&[
            ("process.env", json!({})),
            ("process.env.MODE", json!("test")),
        ]);
        assert_eq!(
            compiler.replace("a(process.env.MODE, process.env)"),
            "a(\"test\", {})"
        );
    }

    #[test]
    fn test_empty_definitions_skip_stage() {
        let compiler = DefineCompiler::default();
        assert_eq!(compiler.compile("x", "a.js").unwrap(), None);
    }
}
