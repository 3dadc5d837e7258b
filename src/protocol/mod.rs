//! Minecraft wire primitives and packet framing

pub mod packet;
pub mod types;

pub use packet::*;
pub use types::*;
