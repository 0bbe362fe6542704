//! Attaching the looked-up name to resolver failures.

use crate::base::neterror::NetError;
use std::io;

/// Converts the `io::Error` of a name lookup into
/// [`NetError::NameNotResolvedFor`].
///
/// ```ignore
/// use coopnet::base::context::IoResultExt;
///
/// let addrs = ("sensor.local", 0).to_socket_addrs().dns_context("sensor.local")?;
/// ```
pub trait IoResultExt<T> {
    fn dns_context(self, domain: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }
}
