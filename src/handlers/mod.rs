pub mod calls;
pub mod config;
pub mod debug;

pub use calls::*;
pub use config::*;
pub use debug::*;
