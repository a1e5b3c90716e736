//! REST API for block image management

mod server;
mod handlers;
mod types;

pub use handlers::AppState;
pub use server::{router, Server};
pub use types::*;
