//! Base types and error handling.
//!
//! - [`neterror::NetError`]: network error codes shared by every layer
//! - [`tcpstate::TcpState`]: TCP connection states as reported by the stack
//! - [`context::IoResultExt`]: resolver `io::Error` to `NetError` conversion

pub mod context;
pub mod neterror;
pub mod tcpstate;

#[cfg(test)]
mod tests;
