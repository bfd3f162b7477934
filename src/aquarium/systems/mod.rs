pub mod interaction;
pub mod physics;
