pub mod config;
pub mod core;
pub mod reviews;
pub mod rubrics;
pub mod scoring;
