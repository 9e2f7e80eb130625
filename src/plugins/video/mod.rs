pub mod audio;
pub mod cli;
pub mod extractor;
pub mod strategy;
