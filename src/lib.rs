//! Workspace façade.
//!
//! Re-exports the user-facing entry points of the three pipeline crates so
//! integration tests and embedders can depend on one crate.

pub use receiver::{Receiver, ReceiverConfig, SessionConfig, State};
pub use rtp_pcm_common::{init_tracing, Context, ContextConfig, Endpoint, Frame, Interface};
pub use sender::{Sender, SenderConfig};
