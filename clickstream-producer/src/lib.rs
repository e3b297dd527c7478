pub mod buffer;
pub mod config;
pub mod debounce;
pub mod producer;
pub mod scroll;
