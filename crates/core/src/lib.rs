//! Core crate for the cutout background-removal service.

pub mod config;
pub mod imaging;
pub mod jobs;
pub mod logging;
pub mod remover;
pub mod server;
