pub mod cli;
pub mod fleet;

pub use cli::*;
pub use fleet::*;
