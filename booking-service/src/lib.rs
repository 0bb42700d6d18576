pub mod analysis;
pub mod auth;
pub mod models;
pub mod responder;
pub mod service;
pub mod sse;

pub use analysis::PhotoAnalysisEngine;
pub use auth::{Capability, Role};
pub use service::{AppState, build_router, create_app};
pub use models::*;
