//! Reef Server Library
//!
//! A shared terminal aquarium. Every connected terminal sees the same fish,
//! drawn with the Kitty graphics protocol and animated by one server-side
//! scheduler. Sessions connect over telnet; each owns its fish and may turn
//! them with a mouse click.

pub mod aquarium;
pub mod assets;
pub mod config;
pub mod metrics;
pub mod net;
pub mod util;
