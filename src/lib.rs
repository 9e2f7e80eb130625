pub mod core;
pub mod plugins;
