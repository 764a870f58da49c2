pub mod blobs;
pub mod config;
pub mod loader;
pub mod lock;
pub mod platform;
pub mod pool;
pub mod storage;

#[cfg(test)]
mod testutil;
