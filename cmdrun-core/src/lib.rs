pub mod error;
pub mod models;

pub use error::{CmdrunError, Result};
pub use models::*;
