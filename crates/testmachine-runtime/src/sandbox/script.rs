//! Function wrappers around module source.
//!
//! Sandboxed modules run inside a `with` block over their scope object so
//! that free identifiers resolve against the sandbox first. Host modules get
//! the usual CommonJS function wrapper. Both put the wrapper head on the
//! first source line, so only columns on line 1 need adjusting.

use crate::error::SandboxError;
use crate::exception;
use deno_core::v8;
use std::borrow::Cow;
use testmachine_core::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wrapper {
    prefix: &'static str,
    suffix: &'static str,
}

/// Evaluates to `(scope) => function () { <code> }`.
pub(crate) const SANDBOX: Wrapper = Wrapper {
    prefix: "(function (__testmachine_scope) { with (__testmachine_scope) { return function () { ",
    suffix: "\n}; } })",
};

/// Evaluates to `(exports, require, module, __filename, __dirname) => { <code> }`.
pub(crate) const HOST: Wrapper = Wrapper {
    prefix: "(function (exports, require, module, __filename, __dirname) { ",
    suffix: "\n})",
};

impl Wrapper {
    pub(crate) fn wrap(&self, code: &str, filename: &str) -> String {
        let body = strip_shebang(code);
        let mut out =
            String::with_capacity(self.prefix.len() + body.len() + self.suffix.len() + filename.len() + 20);
        out.push_str(self.prefix);
        out.push_str(&body);
        out.push_str(self.suffix);
        out.push_str("\n//# sourceURL=");
        out.push_str(filename);
        out
    }

    /// Map a 1-based position in the wrapped text back to the original.
    pub(crate) fn location(&self, line: usize, column: usize) -> Location {
        if line == 1 {
            Location::new(1, column.saturating_sub(self.prefix.len()).max(1))
        } else {
            Location::new(line, column.max(1))
        }
    }

    /// Compile the wrapped code and evaluate it to the wrapper function.
    pub(crate) fn compile<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        code: &str,
        filename: &str,
    ) -> Result<v8::Local<'s, v8::Function>, SandboxError> {
        let wrapped = self.wrap(code, filename);
        let source = v8::String::new(scope, &wrapped)
            .ok_or_else(|| SandboxError::internal(format!("source of {filename} is too large")))?;

        let tc = &mut v8::TryCatch::new(scope);
        let Some(script) = v8::Script::compile(tc, source, None) else {
            return Err(exception::compile_failure(tc, filename, *self));
        };
        let Some(value) = script.run(tc) else {
            return Err(exception::caught(tc, filename, *self));
        };

        v8::Local::<v8::Function>::try_from(value)
            .map_err(|_| SandboxError::internal(format!("wrapper of {filename} is not a function")))
    }
}

/// Blank out a `#!` line, keeping line and column numbers intact.
fn strip_shebang(code: &str) -> Cow<'_, str> {
    match code.strip_prefix("#!") {
        Some(rest) => Cow::Owned(format!("//{rest}")),
        None => Cow::Borrowed(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_keeps_lines() {
        let wrapped = SANDBOX.wrap("a();\nb(); // trailing", "/proj/a.js");
        let lines: Vec<&str> = wrapped.lines().collect();
        assert!(lines[0].ends_with("a();"));
        assert_eq!(lines[1], "b(); // trailing");
        assert_eq!(lines[2], "}; } })");
        assert_eq!(lines[3], "//# sourceURL=/proj/a.js");
    }

    #[test]
    fn test_shebang() {
        let wrapped = HOST.wrap("#!/usr/bin/env node\nrun();", "cli.js");
        assert!(wrapped.contains("{ ///usr/bin/env node\nrun();"));
        assert_eq!(strip_shebang("x"), "x");
    }

    #[test]
    fn test_location_adjusts_first_line_only() {
        let offset = SANDBOX.prefix.len();
        assert_eq!(SANDBOX.location(1, offset + 5), Location::new(1, 5));
        assert_eq!(SANDBOX.location(1, 3), Location::new(1, 1));
        assert_eq!(SANDBOX.location(4, 7), Location::new(4, 7));
        assert_eq!(HOST.location(1, HOST.prefix.len() + 1), Location::new(1, 1));
    }
}
