pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod repository;
pub mod retry;
pub mod sanitize;
pub mod transfer;
