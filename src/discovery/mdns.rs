//! mDNS service advertisement and browsing
//!
//! Service type: `_beacon-ring._tcp.local.` by default
//! Instance name: the configured device name
//!
//! TXT records:
//! - `version`: Crate version
//! - `proto`: Wire protocol identifier

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    AdvertiseHandle, DiscoveredEndpoint, DiscoveryEvent, EndpointStream, ServiceDescriptor,
    ServiceDirectory, resolve_port,
};
use crate::protocol::PROTOCOL_VERSION;
use crate::{Error, Result};

/// How often the browse forwarder checks whether its consumer went away
const BROWSE_POLL: Duration = Duration::from_millis(250);

/// Buffered sightings per browse stream
const BROWSE_BUFFER: usize = 16;

/// Directory backed by multicast DNS-SD
///
/// Advertisements share one daemon; every browse stream owns its own.
pub struct MdnsDirectory {
    daemon: ServiceDaemon,
}

impl MdnsDirectory {
    /// Create a new mDNS directory
    ///
    /// # Errors
    ///
    /// Returns error if the mDNS daemon cannot bind its sockets
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Advertise(format!("failed to create mDNS daemon: {e}")))?;

        Ok(Self { daemon })
    }
}

#[async_trait]
impl ServiceDirectory for MdnsDirectory {
    async fn advertise(&self, descriptor: ServiceDescriptor) -> Result<AdvertiseHandle> {
        let port = resolve_port(&descriptor)?;

        let hostname = hostname::get()
            .map_or_else(|_| "beacon-ring".to_string(), |h| h.to_string_lossy().to_string());

        let mut properties = HashMap::new();
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        properties.insert("proto".to_string(), PROTOCOL_VERSION.to_string());

        let service = ServiceInfo::new(
            descriptor.service_type(),
            descriptor.name(),
            &format!("{hostname}.local."),
            "",
            port,
            properties,
        )
        .map_err(|e| Error::Advertise(format!("failed to create service info: {e}")))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| Error::Advertise(format!("failed to register mDNS service: {e}")))?;

        tracing::info!(
            service_type = descriptor.service_type(),
            instance = descriptor.name(),
            port,
            "mDNS service registered"
        );

        let daemon = self.daemon.clone();
        Ok(AdvertiseHandle::new(descriptor.with_port(port), move || {
            if let Err(e) = daemon.unregister(&fullname) {
                tracing::warn!(error = %e, "failed to unregister mDNS service");
            } else {
                tracing::info!(instance = %fullname, "mDNS service unregistered");
            }
        }))
    }

    async fn browse(&self, service_type: &str) -> Result<EndpointStream> {
        // The daemon keeps one querier per service type, so a shared daemon
        // would let an ending stream stop the browse of its successor
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Browse(format!("failed to create mDNS daemon: {e}")))?;
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| Error::Browse(format!("failed to browse {service_type}: {e}")))?;

        let (tx, rx) = mpsc::channel(BROWSE_BUFFER);
        let service_type = service_type.to_string();

        tracing::debug!(service_type = %service_type, "mDNS browse started");

        // The daemon hands out a blocking receiver; drain it off the runtime
        tokio::task::spawn_blocking(move || {
            while !tx.is_closed() {
                let event = match receiver.recv_timeout(BROWSE_POLL) {
                    Ok(event) => translate_event(event, &service_type),
                    Err(_) if receiver.is_disconnected() => break,
                    Err(_) => None,
                };

                if let Some(event) = event {
                    tracing::trace!(?event, "mDNS sighting");
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            }

            if let Err(e) = daemon.shutdown() {
                tracing::trace!(error = %e, "mDNS browse daemon shutdown error");
            }
            tracing::debug!(service_type = %service_type, "mDNS browse stopped");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl Drop for MdnsDirectory {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::trace!(error = %e, "mDNS daemon shutdown error (expected on normal exit)");
        }
    }
}

fn translate_event(event: ServiceEvent, service_type: &str) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            endpoint_from_info(&info, service_type).map(DiscoveryEvent::Found)
        }
        ServiceEvent::ServiceRemoved(_, fullname) => Some(DiscoveryEvent::Lost(fullname)),
        _ => None,
    }
}

/// Turn a resolved record into an endpoint with dialable addresses
///
/// IPv4 goes first; link-local IPv6 is skipped since it needs a scope id.
fn endpoint_from_info(info: &ServiceInfo, service_type: &str) -> Option<DiscoveredEndpoint> {
    let addrs = preferred_addrs(info.get_addresses().iter().copied(), info.get_port());
    if addrs.is_empty() {
        tracing::debug!(instance = info.get_fullname(), "resolved service has no usable address");
        return None;
    }

    Some(DiscoveredEndpoint {
        instance: info.get_fullname().to_string(),
        service_type: service_type.to_string(),
        addrs,
    })
}

fn preferred_addrs(ips: impl Iterator<Item = IpAddr>, port: u16) -> Vec<SocketAddr> {
    let mut ips: Vec<IpAddr> = ips
        .filter(|ip| match ip {
            IpAddr::V4(_) => true,
            IpAddr::V6(v6) => !v6.is_unicast_link_local(),
        })
        .collect();
    ips.sort_by_key(|ip| (ip.is_ipv6(), *ip));
    ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect()
}
