pub mod config;
pub mod controller;
pub mod error;
pub mod messages;
pub mod scheduler;
pub mod status;
pub mod sync;
pub mod traits;
