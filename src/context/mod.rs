//! Ambient per-dispatch message context.
//!
//! While a message's handlers run, the raw transport envelope and owning
//! queue are available through [`current`]. The slot is a tokio task-local
//! scoped to one dispatch: concurrent dispatches each see only their own
//! context, and scope exit clears it on every path - success, handler
//! error, and cancellation alike. Outside an active dispatch, [`current`]
//! returns `None`.

use std::future::Future;
use std::sync::Arc;

use crate::transport::{QueueName, RawMessage};

tokio::task_local! {
    static CURRENT: MessageContext;
}

/// The in-flight raw message and queue identity for one dispatch.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: Arc<RawMessage>,
    pub queue: QueueName,
}

impl MessageContext {
    pub fn new(message: Arc<RawMessage>) -> Self {
        let queue = message.queue.clone();
        Self { message, queue }
    }
}

/// The context of the dispatch this task is currently executing, if any.
pub fn current() -> Option<MessageContext> {
    CURRENT.try_with(|context| context.clone()).ok()
}

/// Run `future` with `context` as the ambient dispatch context.
pub(crate) async fn scope<F>(context: MessageContext, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, future).await
}
