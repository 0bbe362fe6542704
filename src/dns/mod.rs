//! DNS Resolution Module
//!
//! Pluggable name resolution for connect-by-hostname:
//! - System resolver (getaddrinfo via thread pool), the default
//! - Async hickory-dns resolver
//! - Hostname-to-IP overrides
//!
//! Numeric hosts are recognized by [`parse_ip_literal`] and never reach a
//! resolver.

mod gai;
mod hickory;
mod resolve;

pub use gai::GaiResolver;
pub use hickory::HickoryResolver;
pub use resolve::{parse_ip_literal, Addrs, DnsResolverWithOverrides, Name, Resolve, Resolving};
