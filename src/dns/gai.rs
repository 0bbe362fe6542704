//! System DNS resolver using getaddrinfo.
//!
//! Resolution runs on tokio's blocking pool so the event loop keeps turning
//! while the system resolver works.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::{io, net::ToSocketAddrs};

/// System DNS resolver using `getaddrinfo` in a thread pool.
///
/// Respects the host's resolver configuration (`/etc/hosts`, `resolv.conf`).
/// This is the default resolver of a [`Network`](crate::network::Network).
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let domain = host.clone();

            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16).to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            let addrs = result
                .map_err(|e| {
                    tracing::error!(error = %e, "DNS resolution task failed");
                    NetError::NameNotResolved
                })?
                .dns_context(&domain)?;

            if addrs.is_empty() {
                return Err(NetError::dns_failed(
                    domain,
                    io::Error::new(io::ErrorKind::NotFound, "no addresses returned by getaddrinfo"),
                ));
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "DNS resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
