//! Durable event log for pipeline transitions.
//!
//! Every request id owns an append-only stream of [`PipelineEvent`]s. The
//! [`EventLog`] persists each published event through an
//! [`AppendLog`](conductor_core::AppendLog) and then fans it out to live
//! subscribers registered on its [`EventBus`]. A [`WebhookNotifier`] is one
//! such subscriber.

mod bus;
mod error;
mod log;
mod webhook;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use conductor_core::PipelineEvent;
pub use error::WebhookError;
pub use log::EventLog;
pub use webhook::{EVENT_HEADER, SIGNATURE_HEADER, WebhookConfig, WebhookNotifier};
