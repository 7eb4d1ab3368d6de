pub mod backoff;
pub mod conflict;
mod download;
pub mod engine;
pub mod index;
pub mod network;
pub mod queue;
pub mod scheduler;
pub mod status;
mod upload;
