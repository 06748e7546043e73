use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::types::Event;

/// Extension points of a consumer
///
/// Every method has a default, so an implementation only overrides what it
/// needs. With no overrides at all a consumer acknowledges every event it
/// receives.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use redstream::consumer::ConsumerHooks;
/// use redstream::error::HandlerError;
/// use redstream::types::Event;
///
/// struct OrderProjector;
///
/// #[async_trait]
/// impl ConsumerHooks for OrderProjector {
///     async fn on_event(&self, event: &Event) -> Result<bool, HandlerError> {
///         let order = event.json_field("order")?;
///         println!("order {}", order["id"]);
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait ConsumerHooks: Send + Sync {
    /// Runs once the group exists, and again after every reconnection
    async fn init(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Process one event
    ///
    /// `Ok(true)` acknowledges the event. `Ok(false)`, an error or a panic
    /// leave it pending so it is replayed later.
    async fn on_event(&self, _event: &Event) -> Result<bool, HandlerError> {
        Ok(true)
    }

    /// Runs after every dispatched batch of new events
    async fn on_batch_complete(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Runs when a read finds no new events, before housekeeping
    async fn on_batches_complete(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Hooks that acknowledge everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ConsumerHooks for NoopHooks {}

#[async_trait]
impl<T: ConsumerHooks + ?Sized> ConsumerHooks for Arc<T> {
    async fn init(&self) -> Result<(), HandlerError> {
        (**self).init().await
    }

    async fn on_event(&self, event: &Event) -> Result<bool, HandlerError> {
        (**self).on_event(event).await
    }

    async fn on_batch_complete(&self) -> Result<(), HandlerError> {
        (**self).on_batch_complete().await
    }

    async fn on_batches_complete(&self) -> Result<(), HandlerError> {
        (**self).on_batches_complete().await
    }
}

/// Type alias for event handler closures
pub type EventHandler = Arc<
    dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<bool, HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Hooks built from a closure
///
/// # Example
///
/// ```
/// use redstream::consumer::FnHooks;
///
/// let hooks = FnHooks::new(|event| Box::pin(async move {
///     println!("{} -> {:?}", event.id(), event.fields());
///     Ok(true)
/// }));
/// ```
#[derive(Clone)]
pub struct FnHooks {
    handler: EventHandler,
}

impl FnHooks {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Event) -> Pin<Box<dyn Future<Output = Result<bool, HandlerError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl ConsumerHooks for FnHooks {
    async fn on_event(&self, event: &Event) -> Result<bool, HandlerError> {
        (self.handler)(event.clone()).await
    }
}
