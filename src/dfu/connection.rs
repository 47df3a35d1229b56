//! Picks the DFU variant of a connection from its discovered services.
//!
//! The experimental buttonless service wins when enabled, then Secure DFU,
//! then Legacy DFU. Every later call goes to the chosen service.

use tracing::{debug, error, info};
use uuid::Uuid;

use super::error::DfuError;
use super::firmware::FirmwarePart;
use super::secure_service::SecureDfuService;
use super::service::{ConnectionOutcome, LegacyDfuService, ServiceEvent, ServiceOptions};
use super::transport::{GattEvent, GattTransport};
use super::uuids::DfuUuids;

/// DFU variant spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuVariant {
    Legacy,
    Secure,
}

impl DfuVariant {
    /// Pick the variant for a discovered service list.
    pub fn select(
        services: &[Uuid],
        uuids: &DfuUuids,
        experimental_buttonless: bool,
    ) -> Option<Self> {
        let has = |matches: fn(&DfuUuids, &Uuid) -> bool| {
            services.iter().any(|service| matches(uuids, service))
        };

        if experimental_buttonless && has(DfuUuids::is_buttonless_experimental_service) {
            Some(DfuVariant::Secure)
        } else if has(DfuUuids::is_secure_service) {
            Some(DfuVariant::Secure)
        } else if has(DfuUuids::is_legacy_service) {
            Some(DfuVariant::Legacy)
        } else {
            None
        }
    }
}

enum State {
    Discovering {
        part: FirmwarePart,
        options: ServiceOptions,
        uuids: DfuUuids,
    },
    Legacy(LegacyDfuService),
    Secure(SecureDfuService),
    /// Ended before a variant was chosen.
    Closed {
        error: Option<DfuError>,
        aborted: bool,
    },
}

/// One connection to the target, Legacy or Secure.
pub struct DfuConnection {
    state: State,
}

impl DfuConnection {
    pub fn new(part: FirmwarePart, options: ServiceOptions, uuids: DfuUuids) -> Self {
        Self {
            state: State::Discovering {
                part,
                options,
                uuids,
            },
        }
    }

    /// Begin with service discovery; call once connected.
    pub fn start<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        debug!("Discovering services...");
        transport.discover_services();
    }

    pub fn variant(&self) -> Option<DfuVariant> {
        match self.state {
            State::Legacy(_) => Some(DfuVariant::Legacy),
            State::Secure(_) => Some(DfuVariant::Secure),
            State::Discovering { .. } | State::Closed { .. } => None,
        }
    }

    pub fn is_uploading(&self) -> bool {
        match &self.state {
            State::Legacy(service) => service.is_uploading(),
            State::Secure(service) => service.is_uploading(),
            State::Discovering { .. } | State::Closed { .. } => false,
        }
    }

    pub fn poll_event(&mut self) -> Option<ServiceEvent> {
        match &mut self.state {
            State::Legacy(service) => service.poll_event(),
            State::Secure(service) => service.poll_event(),
            State::Discovering { .. } | State::Closed { .. } => None,
        }
    }

    pub fn handle_event<T: GattTransport + ?Sized>(&mut self, event: GattEvent, transport: &mut T) {
        match &mut self.state {
            State::Legacy(service) => service.handle_event(event, transport),
            State::Secure(service) => service.handle_event(event, transport),
            State::Discovering { .. } => match event {
                GattEvent::ServicesDiscovered(result) => self.on_services(result, transport),
                other => debug!("Ignoring {:?} before service discovery", other),
            },
            State::Closed { .. } => debug!("Ignoring {:?} while disconnecting", event),
        }
    }

    pub fn timer_fired<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if let State::Legacy(service) = &mut self.state {
            service.timer_fired(transport);
        }
    }

    pub fn pause(&mut self) -> bool {
        match &mut self.state {
            State::Legacy(service) => service.pause(),
            State::Secure(service) => service.pause(),
            State::Discovering { .. } | State::Closed { .. } => false,
        }
    }

    pub fn resume<T: GattTransport + ?Sized>(&mut self, transport: &mut T) -> bool {
        match &mut self.state {
            State::Legacy(service) => service.resume(transport),
            State::Secure(service) => service.resume(transport),
            State::Discovering { .. } | State::Closed { .. } => false,
        }
    }

    pub fn abort<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        match &mut self.state {
            State::Legacy(service) => service.abort(transport),
            State::Secure(service) => service.abort(transport),
            State::Discovering { .. } => {
                info!("Upload aborted");
                self.close(None, true, transport);
            }
            State::Closed { aborted, .. } => *aborted = true,
        }
    }

    /// Classify the end of the connection. The connection is spent afterwards.
    pub fn on_disconnected(&mut self, reason: Option<String>) -> ConnectionOutcome {
        match &mut self.state {
            State::Legacy(service) => service.on_disconnected(reason),
            State::Secure(service) => service.on_disconnected(reason),
            State::Closed { error, aborted } => match error.take() {
                Some(error) => ConnectionOutcome::Failed(error),
                None if *aborted => ConnectionOutcome::Aborted,
                None => ConnectionOutcome::Failed(DfuError::DeviceDisconnected {
                    reason: reason.unwrap_or_else(|| "connection lost".to_string()),
                }),
            },
            State::Discovering { .. } => ConnectionOutcome::Failed(DfuError::DeviceDisconnected {
                reason: reason.unwrap_or_else(|| "connection lost".to_string()),
            }),
        }
    }

    fn on_services<T: GattTransport + ?Sized>(
        &mut self,
        result: Result<Vec<Uuid>, String>,
        transport: &mut T,
    ) {
        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                let error = DfuError::ServiceDiscoveryFailed { reason };
                return self.close(Some(error), false, transport);
            }
        };
        let State::Discovering {
            part,
            options,
            uuids,
        } = std::mem::replace(
            &mut self.state,
            State::Closed {
                error: None,
                aborted: false,
            },
        )
        else {
            return;
        };

        let event = GattEvent::ServicesDiscovered(Ok(services.clone()));
        match DfuVariant::select(&services, &uuids, options.experimental_buttonless) {
            Some(DfuVariant::Secure) => {
                info!("Secure DFU Service found");
                let mut service = SecureDfuService::new(part, options, uuids);
                service.handle_event(event, transport);
                self.state = State::Secure(service);
            }
            Some(DfuVariant::Legacy) => {
                info!("Legacy DFU Service found");
                let mut service = LegacyDfuService::new(part, options, uuids);
                service.handle_event(event, transport);
                self.state = State::Legacy(service);
            }
            None => self.close(
                Some(DfuError::DeviceNotSupported {
                    reason: "DFU Service not found".to_string(),
                }),
                false,
                transport,
            ),
        }
    }

    fn close<T: GattTransport + ?Sized>(
        &mut self,
        error: Option<DfuError>,
        aborted: bool,
        transport: &mut T,
    ) {
        if let Some(e) = &error {
            error!("DFU failed: {} (code {})", e, e.code().value());
        }
        self.state = State::Closed { error, aborted };
        debug!("Disconnecting...");
        transport.disconnect();
    }
}
