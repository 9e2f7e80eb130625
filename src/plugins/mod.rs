pub mod http;
pub mod photo;
pub mod pin;
pub mod registry;
pub mod shortpost;
pub mod video;
