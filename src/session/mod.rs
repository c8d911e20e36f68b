//! Sessions, iterations and the cursor that moves between them.

pub mod manager;
pub mod types;

pub use manager::SessionManager;
pub use types::*;
