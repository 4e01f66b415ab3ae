//! Translation of failures between V8 exceptions and [`SandboxError`].
//!
//! Failures crossing into JavaScript carry a `code` property so that their
//! kind survives a round trip through nested `require` calls.

use crate::error::{FailureKind, SandboxError, Thrown};
use crate::sandbox::script::Wrapper;
use deno_core::v8;

/// `code` of errors raised for unresolvable requests.
pub const NOT_FOUND_CODE: &str = "MODULE_NOT_FOUND";
/// `code` of errors raised for sources that failed to compile.
pub const SYNTAX_CODE: &str = "ERR_TESTMACHINE_SYNTAX";

/// Throw `err` into the running JavaScript. A value thrown by module code is
/// rethrown as is, so `instanceof` and custom properties survive.
pub(crate) fn throw(scope: &mut v8::HandleScope, err: &SandboxError) {
    if let Some(thrown) = err.thrown() {
        let value = v8::Local::new(scope, thrown.value());
        scope.throw_exception(value);
        return;
    }

    let (name, text) = match err {
        SandboxError::Eval { name, message, .. } => (Some(name.as_str()), message.clone()),
        SandboxError::Syntax { message, .. } | SandboxError::Reference { message, .. } => {
            (None, message.clone())
        }
        other => (None, other.to_string()),
    };

    let message = v8::String::new(scope, &text).unwrap_or_else(|| v8::String::empty(scope));
    let exception = match err.kind() {
        FailureKind::Syntax => v8::Exception::syntax_error(scope, message),
        FailureKind::Reference | FailureKind::Eval => v8::Exception::error(scope, message),
    };

    if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
        match err.kind() {
            FailureKind::Syntax => set_string(scope, object, "code", SYNTAX_CODE),
            FailureKind::Reference => set_string(scope, object, "code", NOT_FOUND_CODE),
            FailureKind::Eval => {}
        }
        if let Some(name) = name.filter(|name| *name != "Error") {
            set_string(scope, object, "name", name);
        }
    }

    scope.throw_exception(exception);
}

/// Failure of a script that did not compile.
pub(crate) fn compile_failure(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    filename: &str,
    wrapper: Wrapper,
) -> SandboxError {
    let location = tc.message().and_then(|message| {
        let line = message.get_line_number(tc)?;
        Some(wrapper.location(line, message.get_start_column() + 1))
    });

    let message = match tc.exception() {
        Some(exception) => match v8::Local::<v8::Object>::try_from(exception) {
            Ok(object) => get_string(tc, object, "message")
                .unwrap_or_else(|| exception.to_rust_string_lossy(tc)),
            Err(_) => exception.to_rust_string_lossy(tc),
        },
        None => "compilation terminated".to_string(),
    };

    SandboxError::Syntax {
        filename: filename.to_string(),
        message,
        location,
    }
}

/// Failure of a script that threw while running.
pub(crate) fn caught(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    filename: &str,
    wrapper: Wrapper,
) -> SandboxError {
    match tc.exception() {
        Some(exception) => translate(tc, exception, filename, wrapper),
        None => SandboxError::internal("execution terminated"),
    }
}

/// Classify a thrown value. The location is taken from the first stack frame
/// inside `filename`.
pub(crate) fn translate<'s>(
    scope: &mut v8::HandleScope<'s>,
    exception: v8::Local<'s, v8::Value>,
    filename: &str,
    wrapper: Wrapper,
) -> SandboxError {
    if !exception.is_native_error() {
        return SandboxError::Eval {
            name: "EvalError".to_string(),
            message: describe_raw(scope, exception),
            stack: None,
            location: None,
            wrapped: true,
            thrown: Some(Thrown::new(scope, exception)),
        };
    }

    let Ok(object) = v8::Local::<v8::Object>::try_from(exception) else {
        return SandboxError::internal("error value is not an object");
    };

    let name = get_string(scope, object, "name").unwrap_or_else(|| "Error".to_string());
    let message = get_string(scope, object, "message").unwrap_or_default();
    let stack = get_string(scope, object, "stack");
    let code = get_string(scope, object, "code");
    let location = stack
        .as_deref()
        .and_then(|stack| stack_location(stack, filename))
        .map(|(line, column)| wrapper.location(line, column));

    match code.as_deref() {
        Some(NOT_FOUND_CODE) => SandboxError::Reference { message, location },
        Some(SYNTAX_CODE) => SandboxError::Syntax {
            filename: filename.to_string(),
            message,
            location,
        },
        _ => SandboxError::Eval {
            name,
            message,
            stack,
            location,
            wrapped: false,
            thrown: Some(Thrown::new(scope, exception)),
        },
    }
}

fn describe_raw(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if value.is_object() && !value.is_function() {
        if let Some(json) = v8::json::stringify(scope, value) {
            return json.to_rust_string_lossy(scope);
        }
    }
    value.to_rust_string_lossy(scope)
}

/// First `line:column` of a stack frame inside `filename`, 1-based.
pub(crate) fn stack_location(stack: &str, filename: &str) -> Option<(usize, usize)> {
    if filename.is_empty() {
        return None;
    }
    stack
        .lines()
        .filter(|line| line.trim_start().starts_with("at "))
        .find_map(|line| {
            line.match_indices(filename)
                .find_map(|(idx, _)| parse_position(&line[idx + filename.len()..]))
        })
}

fn parse_position(rest: &str) -> Option<(usize, usize)> {
    let rest = rest.strip_prefix(':')?;
    let (line, rest) = split_number(rest)?;
    let rest = rest.strip_prefix(':')?;
    let (column, _) = split_number(rest)?;
    Some((line, column))
}

fn split_number(text: &str) -> Option<(usize, &str)> {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let number = text[..end].parse().ok()?;
    Some((number, &text[end..]))
}

pub(crate) fn get_string(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    key: &str,
) -> Option<String> {
    let key = v8::String::new(scope, key)?;
    let value = object.get(scope, key.into())?;
    if value.is_null_or_undefined() {
        return None;
    }
    Some(value.to_rust_string_lossy(scope))
}

pub(crate) fn set_string(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    key: &str,
    value: &str,
) {
    let (Some(key), Some(value)) = (v8::String::new(scope, key), v8::String::new(scope, value))
    else {
        return;
    };
    object.set(scope, key.into(), value.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_location() {
        let stack = "Error: boom\n    at Object.<anonymous> (/proj/b.js:3:11)\n    at /proj/a.js:1:90";
        assert_eq!(stack_location(stack, "/proj/a.js"), Some((1, 90)));
        assert_eq!(stack_location(stack, "/proj/b.js"), Some((3, 11)));
        assert_eq!(stack_location(stack, "/proj/c.js"), None);
    }

    #[test]
    fn test_stack_location_ignores_message_line() {
        let stack = "Error: Cannot find module './x' from '/proj/a.js:1:1'\n    at /proj/a.js:4:2";
        assert_eq!(stack_location(stack, "/proj/a.js"), Some((4, 2)));
    }

    #[test]
    fn test_stack_location_requires_position() {
        let stack = "Error\n    at load (/proj/a.js)\n    at /proj/a.js:2:5";
        assert_eq!(stack_location(stack, "/proj/a.js"), Some((2, 5)));
        assert_eq!(stack_location(stack, ""), None);
    }
}
