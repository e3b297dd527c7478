pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod error;
pub mod sink;
pub mod transform;
pub mod worker;
