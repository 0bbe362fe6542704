//! Entry point tying a TCP stack, a resolver and a handle registry together.
//!
//! A [`Network`] belongs to one event loop thread. Every handle it hands out
//! is registered with it, so [`Network::stop_all`] reaches all of them.
//!
//! ```rust,ignore
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let net = Network::builder()
//!         .config(NetworkConfig::from_file(Path::new("net.json"))?)
//!         .build();
//!     let client = net.client();
//!     client.connect("gateway.local", 80).await?;
//!     client.write(b"GET / HTTP/1.0\r\n\r\n");
//!     client.flush().await;
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! }).await?;
//! ```

use crate::base::neterror::NetError;
use crate::config::{NetworkConfig, ResolverKind};
use crate::dns::{
    parse_ip_literal, DnsResolverWithOverrides, GaiResolver, HickoryResolver, Name, Resolve,
};
use crate::socket::client::ClientHandle;
use crate::socket::context::{ConnectionContext, ContextRef};
use crate::socket::registry::HandleRegistry;
use crate::stack::native::NativeStack;
use crate::stack::{RawConn, TcpStack};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

struct NetworkInner {
    stack: Rc<dyn TcpStack>,
    resolver: Arc<dyn Resolve>,
    registry: HandleRegistry,
    config: RefCell<NetworkConfig>,
    local_port: Cell<u16>,
}

/// Cheaply cloneable handle to one network instance.
#[derive(Clone)]
pub struct Network {
    inner: Rc<NetworkInner>,
}

impl Network {
    /// Network over `stack` with the system resolver and default config.
    pub fn new(stack: impl TcpStack + 'static) -> Self {
        Self::builder().stack(stack).build()
    }

    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::default()
    }

    /// A new idle client handle.
    pub fn client(&self) -> ClientHandle {
        ClientHandle::new(self, None)
    }

    /// A handle sharing an existing context.
    pub fn wrap(&self, context: ContextRef) -> ClientHandle {
        ClientHandle::new(self, Some(context))
    }

    /// Adopt an already-established connection, such as one a listener
    /// accepted.
    pub fn accept(&self, pcb: RawConn) -> ClientHandle {
        let context = ConnectionContext::new(pcb);
        if self.default_nodelay() {
            context.set_nodelay(true);
        }
        self.wrap(context)
    }

    /// Abort every registered handle's connection. See
    /// [`HandleRegistry::stop_all`].
    pub fn stop_all(&self) -> usize {
        self.inner.registry.stop_all()
    }

    pub fn live_handles(&self) -> usize {
        self.inner.registry.len()
    }

    /// Restart local port assignment at `port`. 0 hands the choice back to
    /// the stack. Later [`config`](Self::config) calls report the new start.
    pub fn set_local_port_start(&self, port: u16) {
        self.inner.config.borrow_mut().local_port_start = port;
        self.inner.local_port.set(port);
    }

    /// Local port for the next outbound connection, if ports are assigned.
    ///
    /// Returns the current counter then advances it, wrapping to the start
    /// port after 65535.
    pub(crate) fn next_local_port(&self) -> Option<u16> {
        let port = self.inner.local_port.get();
        if port == 0 {
            return None;
        }
        let next = match port.checked_add(1) {
            Some(next) => next,
            None => self.inner.config.borrow().local_port_start,
        };
        self.inner.local_port.set(next);
        Some(port)
    }

    /// Resolve `host` to the single address a connect will use.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, NetError> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(ip);
        }
        if host.is_empty() {
            return Err(NetError::NameNotResolved);
        }

        let mut addrs = self.inner.resolver.resolve(Name::new(host)).await.map_err(|e| {
            tracing::debug!(host, error = %e, "host resolution failed");
            e
        })?;
        match addrs.next() {
            Some(addr) => Ok(addr.ip()),
            None => Err(NetError::NameNotResolved),
        }
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> NetworkConfig {
        self.inner.config.borrow().clone()
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.inner.config.borrow().connect_timeout()
    }

    pub(crate) fn default_nodelay(&self) -> bool {
        self.inner.config.borrow().default_nodelay
    }

    pub fn stack(&self) -> &dyn TcpStack {
        self.inner.stack.as_ref()
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.registry
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("registry", &self.inner.registry)
            .field("local_port", &self.inner.local_port.get())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a [`Network`].
#[derive(Default)]
pub struct NetworkBuilder {
    stack: Option<Rc<dyn TcpStack>>,
    resolver: Option<Arc<dyn Resolve>>,
    config: NetworkConfig,
}

impl NetworkBuilder {
    /// Set the TCP stack. Defaults to [`NativeStack`].
    pub fn stack(mut self, stack: impl TcpStack + 'static) -> Self {
        self.stack = Some(Rc::new(stack));
        self
    }

    /// Set the resolver. Defaults to the one named by
    /// [`NetworkConfig::resolver`].
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_port_start(mut self, port: u16) -> Self {
        self.config.local_port_start = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis().max(1)).unwrap_or(u64::MAX);
        self.config.connect_timeout_ms = Some(millis);
        self
    }

    pub fn resolver_kind(mut self, kind: ResolverKind) -> Self {
        self.config.resolver = kind;
        self
    }

    pub fn default_nodelay(mut self, nodelay: bool) -> Self {
        self.config.default_nodelay = nodelay;
        self
    }

    /// Answer `host` with `ip` without asking the resolver.
    pub fn dns_override(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.config.dns_overrides.entry(host.into()).or_default().push(ip);
        self
    }

    pub fn build(self) -> Network {
        let stack: Rc<dyn TcpStack> = match self.stack {
            Some(stack) => stack,
            None => Rc::new(NativeStack::new()),
        };
        let mut resolver: Arc<dyn Resolve> = match (self.resolver, self.config.resolver) {
            (Some(resolver), _) => resolver,
            (None, ResolverKind::System) => Arc::new(GaiResolver::new()),
            (None, ResolverKind::Hickory) => Arc::new(HickoryResolver::new()),
        };
        if !self.config.dns_overrides.is_empty() {
            resolver =
                Arc::new(DnsResolverWithOverrides::new(resolver, self.config.dns_overrides.clone()));
        }

        let start = self.config.local_port_start;
        Network {
            inner: Rc::new(NetworkInner {
                stack,
                resolver,
                registry: HandleRegistry::new(),
                config: RefCell::new(self.config),
                local_port: Cell::new(start),
            }),
        }
    }
}
