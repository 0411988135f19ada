use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use reflex_protocol::Event;

/// A subscriber callback.
///
/// Handlers of one event are invoked one after another by the dispatch
/// worker, but must not assume anything about the order between them.
/// Returning `Err` (or panicking) is contained: it is logged as a
/// [`HandlerFailure`] and never stops the dispatch loop.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self)(&event)
    }
}

/// A handler that failed while processing one event
#[derive(Debug, thiserror::Error)]
pub enum HandlerFailure {
    #[error("handler `{pattern}` failed on `{topic}`: {source}")]
    Error {
        pattern: String,
        topic: String,
        source: anyhow::Error,
    },
    #[error("handler `{pattern}` panicked on `{topic}`: {message}")]
    Panic {
        pattern: String,
        topic: String,
        message: String,
    },
}

impl HandlerFailure {
    pub(crate) fn panic(pattern: String, topic: String, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        HandlerFailure::Panic {
            pattern,
            topic,
            message,
        }
    }
}
