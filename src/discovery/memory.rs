//! In-process service directory
//!
//! Advertisements are visible to every browser sharing the same
//! [`MemoryDirectory`] (clones share state). Endpoints resolve to loopback.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    AdvertiseHandle, DiscoveredEndpoint, DiscoveryEvent, EndpointStream, ServiceDescriptor,
    ServiceDirectory, resolve_port,
};
use crate::Result;

/// Fan-out capacity for live announcements
const ANNOUNCE_CAPACITY: usize = 64;

struct Shared {
    advertised: Mutex<HashMap<u64, DiscoveredEndpoint>>,
    next_id: AtomicU64,
    announcements: broadcast::Sender<DiscoveryEvent>,
}

/// Directory that never leaves the process
#[derive(Clone)]
pub struct MemoryDirectory {
    shared: Arc<Shared>,
}

impl MemoryDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        let (announcements, _) = broadcast::channel(ANNOUNCE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                advertised: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                announcements,
            }),
        }
    }

    /// Number of live advertisements
    #[must_use]
    pub fn advertised_count(&self) -> usize {
        self.shared.advertised.lock().map(|ads| ads.len()).unwrap_or_default()
    }

    fn snapshot(&self, service_type: &str) -> Vec<DiscoveredEndpoint> {
        self.shared
            .advertised
            .lock()
            .map(|ads| {
                ads.values()
                    .filter(|ep| ep.service_type == service_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDirectory for MemoryDirectory {
    async fn advertise(&self, descriptor: ServiceDescriptor) -> Result<AdvertiseHandle> {
        let port = resolve_port(&descriptor)?;
        let endpoint = DiscoveredEndpoint {
            instance: format!("{}.{}", descriptor.name(), descriptor.service_type()),
            service_type: descriptor.service_type().to_string(),
            addrs: vec![SocketAddr::from((Ipv4Addr::LOCALHOST, port))],
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut ads) = self.shared.advertised.lock() {
            ads.insert(id, endpoint.clone());
        }
        let _ = self
            .shared
            .announcements
            .send(DiscoveryEvent::Found(endpoint.clone()));

        tracing::debug!(instance = %endpoint.instance, port, "memory service registered");

        let shared = Arc::clone(&self.shared);
        Ok(AdvertiseHandle::new(descriptor.with_port(port), move || {
            let removed = shared
                .advertised
                .lock()
                .ok()
                .and_then(|mut ads| ads.remove(&id));
            if let Some(endpoint) = removed {
                let _ = shared
                    .announcements
                    .send(DiscoveryEvent::Lost(endpoint.instance));
            }
        }))
    }

    async fn browse(&self, service_type: &str) -> Result<EndpointStream> {
        // Subscribe before the snapshot so nothing slips between the two
        let mut live = self.shared.announcements.subscribe();
        let existing = self.snapshot(service_type);
        let service_type = service_type.to_string();

        let (tx, rx) = mpsc::channel(ANNOUNCE_CAPACITY);
        tokio::spawn(async move {
            for endpoint in existing {
                if tx.send(DiscoveryEvent::Found(endpoint)).await.is_err() {
                    return;
                }
            }

            loop {
                let event = tokio::select! {
                    () = tx.closed() => return,
                    event = live.recv() => event,
                };

                match event {
                    Ok(event) if matches_type(&event, &service_type) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn matches_type(event: &DiscoveryEvent, service_type: &str) -> bool {
    match event {
        DiscoveryEvent::Found(endpoint) => endpoint.service_type == service_type,
        DiscoveryEvent::Lost(instance) => instance.ends_with(service_type),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::discovery::SERVICE_TYPE;

    #[tokio::test]
    async fn test_browse_sees_existing_advertisement() {
        let directory = MemoryDirectory::new();
        let handle = directory
            .advertise(ServiceDescriptor::new("den", SERVICE_TYPE).with_port(7000))
            .await
            .unwrap();

        let mut stream = directory.browse(SERVICE_TYPE).await.unwrap();
        let Some(DiscoveryEvent::Found(endpoint)) = stream.next().await else {
            panic!("expected a sighting");
        };
        assert_eq!(endpoint.addrs[0].port(), 7000);
        assert_eq!(handle.descriptor().port(), Some(7000));
    }

    #[tokio::test]
    async fn test_handle_drop_withdraws() {
        let directory = MemoryDirectory::new();
        let mut stream = directory.browse(SERVICE_TYPE).await.unwrap();

        let handle = directory
            .advertise(ServiceDescriptor::new("den", SERVICE_TYPE))
            .await
            .unwrap();
        assert_eq!(directory.advertised_count(), 1);
        drop(handle);
        assert_eq!(directory.advertised_count(), 0);

        assert!(matches!(stream.next().await, Some(DiscoveryEvent::Found(_))));
        assert!(matches!(stream.next().await, Some(DiscoveryEvent::Lost(_))));
    }

    #[tokio::test]
    async fn test_mismatched_type_is_silent() {
        let directory = MemoryDirectory::new();
        let _handle = directory
            .advertise(ServiceDescriptor::new("den", "_other._tcp.local."))
            .await
            .unwrap();

        let mut stream = directory.browse(SERVICE_TYPE).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(next.is_err(), "no sighting expected across service types");
    }
}
