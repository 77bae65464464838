//! # Relay API
//!
//! The synchronous edge of the pipeline: message submission (with client
//! idempotency), conversation lookup, and the DTOs/error codes the HTTP
//! façade maps onto status codes. Downstream failures never surface here;
//! they are observable only through the conversation document.

mod dto;
mod error;
mod ingress;

pub use dto::{
    ActionResultView, ConversationView, HealthResponse, IntentView, MessageView, SubmitOutcome,
};
pub use error::{ApiError, ErrorCode};
pub use ingress::IngressService;
