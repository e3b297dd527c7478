pub mod batch;
pub mod compression;
pub mod config;
pub mod event;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod transform;
