pub mod input;
pub mod negotiate;
pub mod overlay;
pub mod sink;
pub mod terminal;
pub mod transport;
