pub mod buffer;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod reading;
pub mod upload;

#[cfg(test)]
pub mod test_support;
