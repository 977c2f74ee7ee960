//! Herald - type-directed pub/sub messaging bus over AWS SQS/SNS.
//!
//! Applications register message types with a subject-keyed serialization
//! register and attach typed handlers; the bus runs one polling loop per
//! subscribed queue, decodes each raw message, invokes its handlers with
//! an ambient per-message context, and translates the outcome into an
//! acknowledgement against the transport: delete on success, extend the
//! invisibility window on failure using an attempt-aware backoff curve.
//! Delivery is at-least-once; per-message failures never stop a listener.
//!
//! ```ignore
//! let mut serialization = SerializationRegister::new();
//! serialization.register::<OrderAccepted>("OrderAccepted");
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.add_fn::<OrderAccepted, _, _>(|order| async move {
//!     println!("accepted {}", order.order_id);
//!     Ok(true)
//! });
//!
//! let queue = SqsQueue::connect(&config.sqs_config(), "orders".into()).await?;
//! let bus = Bus::builder()
//!     .serialization(serialization)
//!     .handlers(handlers)
//!     .monitor(Arc::new(LoggingMonitor))
//!     .subscribe(Arc::new(queue))
//!     .build();
//!
//! bus.start().await?;
//! ```

pub mod backoff;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod handlers;
pub mod listener;
pub mod monitor;
pub mod publish;
pub mod serialization;
pub mod transport;

pub use backoff::{BackoffStrategy, DefaultBackoff, FixedBackoff};
pub use bus::{Bus, BusBuilder, BusError};
pub use context::MessageContext;
pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher, UnhandledPolicy};
pub use handlers::{Handler, HandlerError, HandlerRegistry};
pub use listener::{ListenerConfig, QueueListener};
pub use monitor::{LoggingMonitor, Monitor, NoopMonitor, RecordingMonitor};
pub use publish::{Publisher, PublishError, SnsConfig, SnsPublisher};
pub use serialization::{Message, SerializationError, SerializationRegister};
pub use transport::{
    InMemoryQueue, QueueName, QueueTransport, RawMessage, SqsConfig, SqsQueue, TransportError,
};
