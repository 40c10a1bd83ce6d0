//! Dispatch to one of several handlers deployed from a single binary.
//!
//! The function is picked per call from `LAMBDA_FUNCTION_ID`, unless the
//! router was pinned to an id with [`Router::with_function`].

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::lifecycle::SyncHandler;

/// Environment variable naming the function to run.
pub const FUNCTION_ID_VAR: &str = "LAMBDA_FUNCTION_ID";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("LAMBDA_FUNCTION_ID environment variable is required")]
    MissingFunctionId,

    #[error("lambda function '{0}' not found")]
    UnknownFunction(String),
}

impl Classify for RouterError {
    fn error_kind(&self) -> Option<ErrorKind> {
        Some(ErrorKind::Validation)
    }
}

type Route<P, C, T, E> = Box<dyn SyncHandler<P, C, Output = T, Error = E>>;

/// A table of function ids to handlers.
pub struct Router<P, C, T, E> {
    routes: BTreeMap<String, Route<P, C, T, E>>,
    function: Option<String>,
}

impl<P, C, T, E> Default for Router<P, C, T, E> {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
            function: None,
        }
    }
}

impl<P, C, T, E> Router<P, C, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler under `id`, replacing any previous one.
    pub fn route<H>(mut self, id: impl Into<String>, handler: H) -> Self
    where
        H: SyncHandler<P, C, Output = T, Error = E> + 'static,
    {
        self.routes.insert(id.into(), Box::new(handler));
        self
    }

    /// Pins the router to one function instead of reading the environment.
    pub fn with_function(mut self, id: impl Into<String>) -> Self {
        self.function = Some(id.into());
        self
    }

    /// Registered ids, sorted.
    pub fn function_ids(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }

    /// The id the next call will dispatch to.
    pub fn function_id(&self) -> Result<String, RouterError> {
        if let Some(id) = &self.function {
            return Ok(id.clone());
        }
        std::env::var(FUNCTION_ID_VAR)
            .ok()
            .filter(|id| !id.is_empty())
            .ok_or(RouterError::MissingFunctionId)
    }

    /// Looks up the handler registered under `id`.
    pub fn get(&self, id: &str) -> Result<&(dyn SyncHandler<P, C, Output = T, Error = E>), RouterError> {
        self.routes
            .get(id)
            .map(|route| route.as_ref())
            .ok_or_else(|| RouterError::UnknownFunction(id.to_string()))
    }

    /// Calls the handler registered under `id`.
    pub fn dispatch(&self, id: &str, event: P, context: C) -> Result<T, E>
    where
        E: From<RouterError>,
    {
        let handler = self.get(id)?;
        tracing::debug!(function = id, "dispatching invocation");
        handler.call(event, context)
    }
}

impl<P, C, T, E> fmt::Debug for Router<P, C, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("functions", &self.routes.keys().collect::<Vec<_>>())
            .field("function", &self.function)
            .finish()
    }
}

impl<P, C, T, E> SyncHandler<P, C> for Router<P, C, T, E>
where
    E: From<RouterError>,
{
    type Output = T;
    type Error = E;

    fn call(&self, event: P, context: C) -> Result<T, E> {
        let id = self.function_id()?;
        self.dispatch(&id, event, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::FnHandler;

    type BoxError = Box<dyn std::error::Error + Send + Sync>;

    fn router() -> Router<i32, (), i32, BoxError> {
        Router::new()
            .route("double", FnHandler(|n: i32, _: ()| Ok::<_, BoxError>(n * 2)))
            .route("negate", FnHandler(|n: i32, _: ()| Ok::<_, BoxError>(-n)))
    }

    #[test]
    fn test_dispatch_by_id() {
        let router = router();
        assert_eq!(router.dispatch("double", 4, ()).unwrap(), 8);
        assert_eq!(router.dispatch("negate", 4, ()).unwrap(), -4);
    }

    #[test]
    fn test_pinned_function() {
        let router = router().with_function("negate");
        assert_eq!(router.call(7, ()).unwrap(), -7);
    }

    #[test]
    fn test_unknown_function() {
        let err = router().with_function("triple").call(1, ()).unwrap_err();
        assert_eq!(err.to_string(), "lambda function 'triple' not found");
    }

    #[test]
    fn test_function_ids_sorted() {
        let router = router();
        assert_eq!(router.function_ids().collect::<Vec<_>>(), vec!["double", "negate"]);
        assert!(router.contains("double"));
        assert!(!router.contains("triple"));
    }

    #[test]
    fn test_router_errors_are_validation() {
        assert_eq!(
            RouterError::MissingFunctionId.error_kind(),
            Some(ErrorKind::Validation)
        );
    }
}
