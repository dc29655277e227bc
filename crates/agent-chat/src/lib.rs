// agent-chat/crates/agent-chat/src/lib.rs

pub mod agent;
pub mod api;
pub mod auth;
pub mod chat_db;
pub mod client;
pub mod config;
pub mod conversion;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod shared_state;
pub mod telemetry;
pub mod thread_pool;
pub mod thread_server;
pub mod tools;

// Public API exports
pub use agent::{AgentLoop, AgentRequest};
pub use client::{ApiClient, ClientError, TokenSession};
pub use config::Config;
pub use events::{ChatEvent, EventEmitter};
pub use thread_server::{build_router, run_thread_server};
