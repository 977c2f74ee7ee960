//! Typed message handlers and their registry.
//!
//! The [`HandlerRegistry`] maps a message type to an ordered list of
//! handlers. A handler resolves to `Ok(true)` on success, `Ok(false)` to
//! report failure without an error, or `Err(_)` when it fails with one.
//! Registration happens during bus assembly; the registry is read-only
//! once the bus starts, so concurrent dispatches resolve without locking.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::serialization::Message;

/// Errors returned by message handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(error))
    }
}

/// Handler for one concrete message type.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync {
    /// Process a message. `Ok(true)` acknowledges, `Ok(false)` reports an
    /// explicit failure, `Err(_)` a failure with an error.
    async fn handle(&self, message: &M) -> Result<bool, HandlerError>;
}

/// Type-erased handler stored by the registry.
pub type ErasedHandler =
    Arc<dyn Fn(Arc<dyn Message>) -> BoxFuture<'static, Result<bool, HandlerError>> + Send + Sync>;

/// Maps a message type to its ordered handler list.
///
/// Multiple handlers per type are supported; a dispatched message invokes
/// all of them in registration order. Resolving a type with no handlers
/// yields an empty slice, which is not an error here - the dispatcher
/// applies the configured unhandled-message policy.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a [`Handler`] implementation to `M`'s handler list.
    pub fn add<M, H>(&mut self, handler: H)
    where
        M: Message,
        H: Handler<M> + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |message: Arc<dyn Message>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message = message.into_any_arc().downcast::<M>().map_err(|_| {
                    HandlerError::failed("message type did not match handler registration")
                })?;
                handler.handle(&message).await
            })
        });
        self.handlers.entry(TypeId::of::<M>()).or_default().push(erased);
    }

    /// Append an async closure to `M`'s handler list.
    pub fn add_fn<M, F, Fut>(&mut self, handler: F)
    where
        M: Message,
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |message: Arc<dyn Message>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message = message.into_any_arc().downcast::<M>().map_err(|_| {
                    HandlerError::failed("message type did not match handler registration")
                })?;
                handler(message).await
            })
        });
        self.handlers.entry(TypeId::of::<M>()).or_default().push(erased);
    }

    /// The handlers registered for a message type, in registration order.
    pub fn resolve(&self, type_id: TypeId) -> &[ErasedHandler] {
        self.handlers
            .get(&type_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of message types with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug)]
    struct Pong;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<Ping> for CountingHandler {
        async fn handle(&self, _message: &Ping) -> Result<bool, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_resolve_and_invoke() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.add::<Ping, _>(CountingHandler {
            calls: Arc::clone(&calls),
        });

        let resolved = registry.resolve(TypeId::of::<Ping>());
        assert_eq!(resolved.len(), 1);

        let message: Arc<dyn Message> = Arc::new(Ping { seq: 1 });
        let result = resolved[0](message).await.unwrap();
        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multiple_handlers_in_registration_order() {
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.add_fn::<Ping, _, _>(move |_message| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().await.push(tag);
                    Ok(true)
                }
            });
        }

        let resolved = registry.resolve(TypeId::of::<Ping>());
        assert_eq!(resolved.len(), 3);
        for handler in resolved {
            handler(Arc::new(Ping { seq: 2 })).await.unwrap();
        }
        assert_eq!(*order.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_resolve_unregistered_type_is_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve(TypeId::of::<Pong>()).is_empty());
    }

    #[tokio::test]
    async fn test_handler_explicit_failure() {
        let mut registry = HandlerRegistry::new();
        registry.add_fn::<Ping, _, _>(|_message| async { Ok(false) });

        let resolved = registry.resolve(TypeId::of::<Ping>());
        let result = resolved[0](Arc::new(Ping { seq: 3 })).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn test_handler_receives_typed_message() {
        let mut registry = HandlerRegistry::new();
        registry.add_fn::<Ping, _, _>(|message| async move {
            if message.seq == 42 {
                Ok(true)
            } else {
                Err(HandlerError::failed("unexpected sequence"))
            }
        });

        let resolved = registry.resolve(TypeId::of::<Ping>());
        assert!(resolved[0](Arc::new(Ping { seq: 42 })).await.unwrap());
        assert!(resolved[0](Arc::new(Ping { seq: 1 })).await.is_err());
    }
}
