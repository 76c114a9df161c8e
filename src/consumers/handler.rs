//! Handlers and the registry routing deliveries to them by type tag.
use crate::consumers::Delivery;
use crate::message::{JsonSerializer, Message, MessageSerializer};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Implementers of `MessageHandler` process the messages of type `M` received by a
/// [`Subscription`](super::Subscription).
///
/// The payload has already been deserialized; `delivery` gives access to the raw message and
/// its routing metadata.
///
/// While you can implement `MessageHandler` for a struct or enum, most of the time an async
/// closure registered with [`HandlerRegistryBuilder::add`] is all you need.
#[async_trait::async_trait]
pub trait MessageHandler<M>: Send + Sync + 'static {
    async fn handle(&self, message: M, delivery: &Delivery) -> Result<(), anyhow::Error>;
}

/// Wrapper type to turn an async closure into a [`MessageHandler`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<M, F, Fut> MessageHandler<M> for ClosureHandler<F>
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send,
{
    async fn handle(&self, message: M, _delivery: &Delivery) -> Result<(), anyhow::Error> {
        (self.0)(message).await
    }
}

/// A handler with its message type erased: it deserializes the payload itself.
#[async_trait::async_trait]
pub(super) trait RoutedHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery, type_tag: &str) -> Result<(), anyhow::Error>;
}

struct TypedHandler<M, H, S> {
    handler: H,
    serializer: Arc<S>,
    _message: PhantomData<fn() -> M>,
}

#[async_trait::async_trait]
impl<M, H, S> RoutedHandler for TypedHandler<M, H, S>
where
    M: Message,
    H: MessageHandler<M>,
    S: MessageSerializer,
{
    async fn handle(&self, delivery: &Delivery, type_tag: &str) -> Result<(), anyhow::Error> {
        let message: M = self.serializer.deserialize(&delivery.payload, type_tag)?;
        self.handler.handle(message, delivery).await
    }
}

/// Maps type tags to the handlers in charge of them.
///
/// The registry is built once, through [`HandlerRegistry::builder`], and is read-only
/// afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RoutedHandler>>,
}

impl HandlerRegistry {
    /// Start building a registry. Payloads are deserialized as JSON unless another serializer
    /// is set with [`HandlerRegistryBuilder::with_serializer`].
    pub fn builder() -> HandlerRegistryBuilder<JsonSerializer> {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
            serializer: Arc::new(JsonSerializer),
        }
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.handlers.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(super) fn resolve(&self, type_tag: &str) -> Option<&Arc<dyn RoutedHandler>> {
        self.handlers.get(type_tag)
    }
}

/// A builder for [`HandlerRegistry`].
pub struct HandlerRegistryBuilder<S> {
    handlers: HashMap<String, Arc<dyn RoutedHandler>>,
    serializer: Arc<S>,
}

impl<S: MessageSerializer> HandlerRegistryBuilder<S> {
    /// Deserialize the payloads of handlers registered from now on with `serializer`.
    #[must_use]
    pub fn with_serializer<S2: MessageSerializer>(self, serializer: S2) -> HandlerRegistryBuilder<S2> {
        HandlerRegistryBuilder {
            handlers: self.handlers,
            serializer: Arc::new(serializer),
        }
    }

    /// Route messages tagged with `M::TYPE_NAME` to `handler`.
    ///
    /// A later registration for the same type replaces the earlier one.
    #[must_use]
    pub fn add<M, F, Fut>(self, handler: F) -> Self
    where
        M: Message,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.add_handler::<M, _>(ClosureHandler(handler))
    }

    /// Route messages tagged with `M::TYPE_NAME` to a [`MessageHandler`] implementation.
    #[must_use]
    pub fn add_handler<M, H>(mut self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let routed = TypedHandler {
            handler,
            serializer: self.serializer.clone(),
            _message: PhantomData::<fn() -> M>,
        };
        if self
            .handlers
            .insert(M::TYPE_NAME.to_owned(), Arc::new(routed))
            .is_some()
        {
            tracing::warn!(type_tag = M::TYPE_NAME, "Replacing an already registered handler");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}
