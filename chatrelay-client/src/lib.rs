pub mod config;
pub mod connection;
pub mod image_pipeline;
pub mod media;
pub mod message_log;
pub mod session;
