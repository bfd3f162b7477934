pub mod constants;
pub mod manager;
pub mod render;
pub mod state;
pub mod systems;
