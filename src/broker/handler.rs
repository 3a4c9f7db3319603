//! Handler and middleware types for broker routes.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use super::context::Context;

/// Error surfaced by a route handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for topic {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("not authorized")]
    Unauthorized,
    #[error("{message}")]
    Handler {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HandlerError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Handler {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Cancellation is part of normal shutdown and is not logged as an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Boxed async route handler.
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Handler decorator applied at registration time.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Wrap an async function as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Handler substituted for unmatched topics; fails with [`HandlerError::NotFound`].
pub fn not_found_handler() -> Handler {
    handler(|ctx: Context| async move { Err(HandlerError::NotFound(ctx.topic().to_owned())) })
}

/// Wrap a handler with middleware so the first registered middleware is the
/// outermost.
pub fn apply_middleware(handler: Handler, middleware: &[Middleware]) -> Handler {
    middleware.iter().rev().fold(handler, |h, m| m(h))
}
