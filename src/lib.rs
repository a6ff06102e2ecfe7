pub mod utils;
pub mod pipeline;
pub mod config;
pub mod error;
pub mod helper;
pub mod modules;
