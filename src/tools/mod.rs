//! Tool system: registry, invocation backends, and batch dispatch.

pub mod context;
pub mod dispatcher;
pub mod gateway;
pub mod peer;
pub mod registry;
pub mod schema;
pub mod tool;

pub use context::{InvocationContext, TurnContext};
pub use dispatcher::{DispatchOutcome, DispatchStatus, ToolDispatcher};
pub use gateway::{HttpGatewayClient, ToolGateway};
pub use peer::{PeerAgent, PeerStream};
pub use registry::{RegisteredTool, ToolKind, ToolRegistry, ToolRegistryBuilder, ToolSelection};
pub use schema::SchemaBuilder;
pub use tool::{FnTool, ToolHandler, ToolOutput};
