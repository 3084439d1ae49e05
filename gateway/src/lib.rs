//! OpenAI-compatible inference gateway (spec §1 OVERVIEW): the Compatibility Layer,
//! Context Manager, Prompt Optimizer, Process Group Manager, Tool Loop, Responses
//! Bridge, Ollama Adapter, and the dispatcher/HTTP surface that ties them together.

pub mod activity;
pub mod assets;
pub mod compat;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod http;
pub mod model;
pub mod ollama;
pub mod optimize;
pub mod process;
pub mod responses;
pub mod tools;
pub mod toolloop;

pub use dispatch::GatewayState;
pub use error::GatewayError;
