//! Service discovery
//!
//! Makes a controller discoverable on the local network and lets a companion
//! find it without manual addressing. Two backends implement
//! [`ServiceDirectory`]: [`MdnsDirectory`] (multicast DNS-SD) and
//! [`MemoryDirectory`] (process-local, for tests and loopback setups).
//!
//! Browsing never fails because nothing was found yet. Absence is the steady
//! state; only local network-stack faults surface as [`Error::Browse`].

pub mod mdns;
pub mod memory;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use mdns::MdnsDirectory;
pub use memory::MemoryDirectory;

use crate::{Error, Result};

/// Default service type shared by advertiser and browser
///
/// Must match exactly on both sides or discovery silently finds nothing.
pub const SERVICE_TYPE: &str = "_beacon-ring._tcp.local.";

/// What a device advertises about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    service_type: String,
    port: Option<u16>,
}

impl ServiceDescriptor {
    /// Describe a service with an OS-assigned port
    #[must_use]
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            port: None,
        }
    }

    /// Same descriptor pinned to a port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Instance name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type tag
    #[must_use]
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Port, if one has been chosen
    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        self.port
    }
}

/// A sighting of an advertised service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Fully qualified instance name
    pub instance: String,

    /// Service type the endpoint was found under
    pub service_type: String,

    /// Candidate transport addresses, preferred first
    pub addrs: Vec<SocketAddr>,
}

impl fmt::Display for DiscoveredEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{} ({addr})", self.instance),
            None => f.write_str(&self.instance),
        }
    }
}

/// Events reported by a browse stream
///
/// The same endpoint may be reported more than once. Callers that care
/// deduplicate on [`DiscoveredEndpoint::instance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// An endpoint was resolved
    Found(DiscoveredEndpoint),

    /// An instance stopped advertising
    Lost(String),
}

/// Unbounded stream of discovery events
pub type EndpointStream = Pin<Box<dyn Stream<Item = DiscoveryEvent> + Send>>;

/// Advertise/browse abstraction over a local-network directory
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Begin advertising `descriptor`
    ///
    /// Picks an ephemeral port when the descriptor has none. The device stays
    /// discoverable until the returned handle is dropped or stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Advertise`] if the network stack cannot bind or broadcast
    async fn advertise(&self, descriptor: ServiceDescriptor) -> Result<AdvertiseHandle>;

    /// Browse for endpoints of `service_type`
    ///
    /// Each call starts a fresh stream. Dropping the stream stops browsing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Browse`] only on local network-stack faults
    async fn browse(&self, service_type: &str) -> Result<EndpointStream>;
}

/// Keeps an advertisement alive
///
/// Releasing the handle (drop or [`AdvertiseHandle::stop`]) withdraws the
/// advertisement.
pub struct AdvertiseHandle {
    descriptor: ServiceDescriptor,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AdvertiseHandle {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            descriptor,
            release: Some(Box::new(release)),
        }
    }

    /// The advertised descriptor, with its resolved port
    #[must_use]
    pub const fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Withdraw the advertisement now
    pub fn stop(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for AdvertiseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvertiseHandle")
            .field("descriptor", &self.descriptor)
            .field("active", &self.release.is_some())
            .finish()
    }
}

impl Drop for AdvertiseHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Resolve the port to advertise, asking the OS for one when unset
pub(crate) fn resolve_port(descriptor: &ServiceDescriptor) -> Result<u16> {
    if let Some(port) = descriptor.port() {
        return Ok(port);
    }

    let probe = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|l| l.local_addr())
        .map_err(|e| Error::Advertise(format!("no ephemeral port available: {e}")))?;

    Ok(probe.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_format() {
        assert!(SERVICE_TYPE.ends_with(".local."));
        assert!(SERVICE_TYPE.starts_with('_'));
        assert!(SERVICE_TYPE.contains("._tcp."));
    }

    #[test]
    fn test_resolve_port_keeps_explicit_port() {
        let descriptor = ServiceDescriptor::new("kitchen", SERVICE_TYPE).with_port(4242);
        assert_eq!(resolve_port(&descriptor).unwrap(), 4242);
    }

    #[test]
    fn test_resolve_port_picks_ephemeral() {
        let descriptor = ServiceDescriptor::new("kitchen", SERVICE_TYPE);
        assert_ne!(resolve_port(&descriptor).unwrap(), 0);
    }

    #[test]
    fn test_handle_releases_once() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let handle = AdvertiseHandle::new(
            ServiceDescriptor::new("kitchen", SERVICE_TYPE).with_port(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        handle.stop();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
