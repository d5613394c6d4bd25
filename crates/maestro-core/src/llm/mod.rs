//! Model invocation
//!
//! A single stateless gateway serves both the orchestrator and every worker
//! agent. [`GeminiGateway`] is the production implementation; tests plug in
//! their own [`ModelGateway`].

mod error;
mod gateway;
mod gemini;

pub use error::GatewayError;
pub use gateway::{Invocation, ModelGateway, SharedGateway};
pub use gemini::{
    build_request_body, interpret_response, normalize_model, GeminiGateway, DEFAULT_BASE_URL,
};
