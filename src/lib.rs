//! Weft: runtime core for a tool-calling, multi-agent conversational service.
//!
//! A turn takes a user message, loads the session log (compacting it when it
//! grows too large), streams LLM calls through an event processor, runs the
//! requested tools, and emits a single ordered stream of [`stream::AgentEvent`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::llm::LlmProvider;
//! use weft::runtime::RuntimeContext;
//! use weft::turn::TurnRequest;
//!
//! # async fn example(llm: Arc<dyn LlmProvider>) {
//! let runtime = RuntimeContext::builder().llm(llm).build();
//! let (sink, mut events) = runtime.event_channel();
//! let request = TurnRequest::builder().user_id("u1").session_id("s1").message("hello").build();
//! tokio::spawn(async move { runtime.run_turn(request, &sink).await });
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.kind());
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod logging;
pub mod prelude;
pub mod runtime;
pub mod session;
pub mod stop;
pub mod stream;
pub mod swarm;
pub mod tools;
pub mod turn;
pub mod types;
pub mod util;

#[cfg(feature = "server")]
pub mod server;
