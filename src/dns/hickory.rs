//! hickory-dns backed resolver.
//!
//! Lookups run on the event loop instead of the blocking pool. A connect only
//! ever uses one address, so the lookup prefers A records and the resolver
//! hands back just the first answer.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::io;
use std::iter;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

/// Resolver selected by `"resolver": "hickory"` in
/// [`NetworkConfig`](crate::NetworkConfig).
///
/// Clones share one underlying resolver and its cache. The resolver is built
/// on the first lookup, from the system configuration when it can be read.
///
/// ```rust,ignore
/// let net = Network::builder()
///     .stack(stack)
///     .resolver(Arc::new(HickoryResolver::new()))
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct HickoryResolver {
    inner: Arc<OnceLock<TokioResolver>>,
}

impl HickoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolver(&self) -> &TokioResolver {
        self.inner.get_or_init(build_resolver)
    }
}

fn build_resolver() -> TokioResolver {
    let mut builder = match TokioResolver::builder_tokio() {
        Ok(builder) => builder,
        Err(e) => {
            tracing::warn!(error = %e, "system resolver config unreadable, using defaults");
            TokioResolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
        }
    };
    builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4thenIpv6;
    builder.build()
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let host = name.as_str();
            let lookup = this.resolver().lookup_ip(host).await.map_err(|e| {
                tracing::debug!(host, error = %e, "hickory lookup failed");
                NetError::dns_failed(host, io::Error::new(io::ErrorKind::NotFound, e.to_string()))
            })?;

            let Some(ip) = lookup.iter().next() else {
                return Err(NetError::dns_failed(
                    host,
                    io::Error::new(io::ErrorKind::NotFound, "empty answer"),
                ));
            };
            tracing::debug!(host, %ip, "resolved via hickory");
            Ok(Box::new(iter::once(SocketAddr::new(ip, 0))) as Addrs)
        })
    }
}
