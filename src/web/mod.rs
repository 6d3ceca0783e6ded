//! Web interface for Hoard.
//!
//! A push-only WebSocket at `GET /ws` streams change events to connected
//! clients, next to `GET /health` and `GET /status`.

pub mod error;
pub mod router;
pub mod server;
pub mod ws;

pub use error::{ApiError, ErrorCode};
pub use router::{create_router, AppState};
pub use server::WebServer;
pub use ws::ws_handler;
