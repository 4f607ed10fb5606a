pub mod config;
pub mod messages;
pub mod packet;

pub use config::*;
pub use messages::*;
pub use packet::*;
