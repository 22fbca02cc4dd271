//! The ordered middleware stack.

use std::fmt;

use tracing::debug;

use crate::error::RegistrationError;
use crate::handler::Handler;
use crate::topic::TopicPattern;

/// The pattern used when registration omits one.
pub const CATCH_ALL: &str = "*";

/// One registered `(pattern, handler)` pair.
#[derive(Clone)]
pub struct Layer {
    pattern: TopicPattern,
    handler: Handler,
}

impl Layer {
    /// Returns the normalized route pattern.
    pub fn route(&self) -> &str {
        self.pattern.as_str()
    }

    /// Returns the compiled pattern.
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Returns the handler.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("route", &self.route())
            .field("handler", &self.handler)
            .finish()
    }
}

/// An append-only, ordered sequence of layers.
///
/// Insertion order is traversal order. Layers are never removed or
/// reordered.
#[derive(Clone, Default, Debug)]
pub struct Stack {
    layers: Vec<Layer>,
}

impl Stack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one layer per handler, all sharing `pattern`
    /// (defaulting to `*`).
    ///
    /// Registration is atomic: the pattern is compiled and the handler list
    /// checked before anything is appended, so a failed call leaves the
    /// stack untouched.
    pub fn register<I>(
        &mut self,
        pattern: Option<&str>,
        handlers: I,
    ) -> Result<&mut Self, RegistrationError>
    where
        I: IntoIterator<Item = Handler>,
    {
        let pattern = TopicPattern::compile(pattern.unwrap_or(CATCH_ALL))?;
        let handlers: Vec<Handler> = handlers.into_iter().collect();
        if handlers.is_empty() {
            return Err(RegistrationError::NoHandlers);
        }

        debug!(
            route = %pattern,
            count = handlers.len(),
            "Registering middleware"
        );

        self.layers.extend(handlers.into_iter().map(|handler| Layer {
            pattern: pattern.clone(),
            handler,
        }));
        Ok(self)
    }

    /// Returns the layer at `index`.
    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Iterates layers in traversal order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    /// Returns the number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` if no layers are registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PatternError;

    fn pass() -> Handler {
        Handler::sync(|_, next| {
            next.advance();
            Ok(())
        })
    }

    #[test]
    fn test_register_defaults_to_catch_all() {
        let mut stack = Stack::new();
        stack.register(None, [pass()]).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.get(0).unwrap().route(), "*");
    }

    #[test]
    fn test_register_normalizes_and_chains() {
        let mut stack = Stack::new();
        stack
            .register(Some("/a/"), [pass(), pass()])
            .unwrap()
            .register(Some("b"), [pass()])
            .unwrap();

        let routes: Vec<&str> = stack.iter().map(Layer::route).collect();
        assert_eq!(routes, ["a", "a", "b"]);
    }

    #[test]
    fn test_register_without_handlers_fails() {
        let mut stack = Stack::new();
        stack.register(None, [pass()]).unwrap();

        let err = stack.register(Some("a"), Vec::new()).unwrap_err();
        assert_eq!(err, RegistrationError::NoHandlers);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_register_is_atomic_on_bad_pattern() {
        let mut stack = Stack::new();
        let err = stack
            .register(Some("a/:id/:id"), [pass(), pass()])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Pattern(PatternError::DuplicateParam { .. })
        ));
        assert!(stack.is_empty());
    }
}
