//! HTTP and WebSocket surface
//!
//! One axum router serves:
//! - GET /ws - the duplex control/data channel clients speak
//! - GET /health - health check
//!
//! Everything else (auth, landing pages, exports) lives outside this
//! service.

mod messages;
mod routes;
mod state;
mod ws;

pub use messages::{ClientMessage, NewChunk, ServerMessage};
pub use routes::create_router;
pub use state::AppState;
