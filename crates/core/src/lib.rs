pub mod config;
pub mod data_distributor;
pub mod distributed;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
