//! Lambda extension that forwards function and platform logs as structured events.
//!
//! The extension registers with the Extensions API, subscribes a local HTTP
//! listener to the Logs API, normalizes every pushed log record into a
//! timestamped event and flushes the event sink on every lifecycle event so
//! nothing is left queued when the environment freezes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod extension;
pub mod logs_api;
pub mod normalize;
pub mod publisher;
pub mod receiver;
pub mod runtime;
pub mod sink;

pub use config::{
    Compression, Config, ConfigBuilder, LogsApiConfig, PublisherConfig, ReceiverConfig,
};
pub use coordinator::{Coordinator, ExtensionSession, LifecycleState};
pub use error::{ExtensionError, Result};
pub use event::{EventBuilder, NormalizedEvent};
pub use extension::{
    ExtensionApi, ExtensionClient, LifecycleEvent, PollError, Registration, RegistrationError,
    ShutdownReason,
};
pub use logs_api::{
    BufferingConfig, LogsClient, RecordKind, SubscribeAck, SubscriptionError, SubscriptionRequest,
};
pub use normalize::{RawLogRecord, normalize};
pub use publisher::{PublishError, Publisher};
pub use receiver::{LogReceiver, ReceiverHandle};
pub use runtime::{ExtensionRuntime, RuntimeError};
pub use sink::{DeliveryResponse, EventSink, SinkCommand, SinkHandle};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at `debug` when
/// `debug` is true and everything stays at `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(debug: bool) -> Result<()> {
    let default_directive = if debug {
        "info,lambda_logs_extension=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()?;

    Ok(())
}
