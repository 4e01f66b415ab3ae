//! Failure types raised while loading and evaluating modules.

use deno_core::v8;
use std::fmt;
use std::rc::Rc;
use testmachine_core::{CompileError, Location};
use thiserror::Error;

/// Coarse classification of a module failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The source could not be compiled.
    Syntax,
    /// A dependency could not be resolved.
    Reference,
    /// The module threw while it was evaluated.
    Eval,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Syntax => "syntax",
            Self::Reference => "reference",
            Self::Eval => "eval",
        };
        f.write_str(name)
    }
}

/// The exact value a module threw, kept so it can be rethrown unchanged into
/// the code that required the module.
#[derive(Clone)]
pub struct Thrown(Rc<v8::Global<v8::Value>>);

impl Thrown {
    pub(crate) fn new(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Self {
        Self(Rc::new(v8::Global::new(scope, value)))
    }

    pub fn value(&self) -> &v8::Global<v8::Value> {
        &self.0
    }
}

impl fmt::Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Thrown(..)")
    }
}

/// Failure of a sandboxed or host-loaded module.
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    /// V8 rejected the source.
    #[error("SyntaxError: {message}")]
    Syntax {
        filename: String,
        message: String,
        location: Option<Location>,
    },

    /// A compiler stage rejected the source.
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{message}")]
    Reference {
        message: String,
        location: Option<Location>,
    },

    /// Evaluation threw. `wrapped` is set when the thrown value was not an
    /// error object (a string, a number, a plain object).
    #[error("{name}: {message}")]
    Eval {
        name: String,
        message: String,
        stack: Option<String>,
        location: Option<Location>,
        wrapped: bool,
        thrown: Option<Thrown>,
    },

    /// A failure annotated with the resource it happened in.
    #[error("{resource}\n{}{source}", frame_block(.frame))]
    Module {
        resource: String,
        frame: String,
        source: Box<SandboxError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

fn frame_block(frame: &str) -> String {
    if frame.is_empty() {
        String::new()
    } else {
        format!("{frame}\n")
    }
}

impl SandboxError {
    /// Failure to resolve `request` from `from`, worded like Node's.
    pub fn not_found(request: &str, from: impl fmt::Display) -> Self {
        Self::Reference {
            message: format!("Cannot find module '{request}' from '{from}'"),
            location: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Syntax { .. } | Self::Compile(_) => FailureKind::Syntax,
            Self::Reference { .. } => FailureKind::Reference,
            Self::Eval { .. } | Self::Internal(_) => FailureKind::Eval,
            Self::Module { source, .. } => source.kind(),
        }
    }

    /// Position in the failing source, when known.
    #[must_use]
    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Syntax { location, .. }
            | Self::Reference { location, .. }
            | Self::Eval { location, .. } => *location,
            Self::Module { source, .. } => source.location(),
            Self::Compile(_) | Self::Internal(_) => None,
        }
    }

    /// Whether evaluation threw something that was not an error object.
    #[must_use]
    pub fn is_wrapped_throw(&self) -> bool {
        match self {
            Self::Eval { wrapped, .. } => *wrapped,
            Self::Module { source, .. } => source.is_wrapped_throw(),
            _ => false,
        }
    }

    /// The original thrown value, when evaluation threw.
    #[must_use]
    pub fn thrown(&self) -> Option<&Thrown> {
        match self.root_cause() {
            Self::Eval { thrown, .. } => thrown.as_ref(),
            _ => None,
        }
    }

    /// The failure without its annotations.
    #[must_use]
    pub fn root_cause(&self) -> &SandboxError {
        match self {
            Self::Module { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Wrap with the failing resource and a source excerpt. Already annotated
    /// failures are returned unchanged.
    #[must_use]
    pub fn annotate(self, resource: &str, frame: String) -> Self {
        match self {
            Self::Module { .. } => self,
            other => Self::Module {
                resource: resource.to_string(),
                frame,
                source: Box::new(other),
            },
        }
    }
}

/// Failure to install or run the environment patch.
#[derive(Error, Debug, Clone)]
pub enum PatchError {
    #[error("another load interceptor is already installed")]
    AlreadyInstalled,

    #[error("failed to load global dependency '{request}': {source}")]
    Dependency {
        request: String,
        #[source]
        source: SandboxError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let compile = SandboxError::from(CompileError::new("babel", "a.js", "boom"));
        assert_eq!(compile.kind(), FailureKind::Syntax);
        assert_eq!(SandboxError::not_found("./x", "/proj").kind(), FailureKind::Reference);
        assert_eq!(SandboxError::internal("oops").kind(), FailureKind::Eval);
    }

    #[test]
    fn test_annotate_once() {
        let err = SandboxError::Eval {
            name: "Error".into(),
            message: "boom".into(),
            stack: None,
            location: Some(Location::new(2, 3)),
            wrapped: true,
            thrown: None,
        };
        let annotated = err.annotate("/proj/a.js", "> 2 | boom()".into());
        assert_eq!(annotated.to_string(), "/proj/a.js\n> 2 | boom()\nError: boom");
        assert_eq!(annotated.location(), Some(Location::new(2, 3)));
        assert!(annotated.is_wrapped_throw());

        let again = annotated.annotate("/proj/b.js", String::new());
        assert!(again.to_string().starts_with("/proj/a.js\n"));
        assert!(matches!(again.root_cause(), SandboxError::Eval { .. }));
    }

    #[test]
    fn test_annotate_without_frame() {
        let err = SandboxError::not_found("./x", "/proj").annotate("/proj/a.js", String::new());
        assert_eq!(
            err.to_string(),
            "/proj/a.js\nCannot find module './x' from '/proj'"
        );
    }
}
