//! Upstream transport: address resolution, dialing and socket setup

pub mod dialer;
pub mod socket;

pub use dialer::{dial, resolve};
pub use socket::{bind_listener, ListenOptions};
