//! The connection state machine.
//!
//! [`Machine`] never touches the radio. Caller commands and transport events go
//! in, [`Effect`]s come out, and the driver executes them. All mutation happens
//! in these methods, so events must be fed in one at a time, in arrival order.

use std::time::SystemTime;

use btleplug::api::BDAddr;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionState, DiscoveredService, LinkId};
use crate::error::{Error, Failure};
use crate::gate::AdapterGate;
use crate::notification::NotificationChannel;
use crate::scanner::{ScanId, Scanner};
use crate::sink::{Status, Update};
use crate::TargetDescriptor;

/// Something the transport reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Advertisement {
        scan: ScanId,
        address: BDAddr,
    },
    ScanFailed {
        scan: ScanId,
        reason: String,
    },
    LinkUp(LinkId),
    ConnectFailed {
        link: LinkId,
        reason: String,
    },
    LinkDown(LinkId),
    ServicesDiscovered {
        link: LinkId,
        services: Vec<DiscoveredService>,
    },
    DiscoveryFailed {
        link: LinkId,
        reason: String,
    },
    DescriptorWritten {
        link: LinkId,
        characteristic: Uuid,
        result: std::result::Result<(), String>,
    },
    ValueChanged {
        link: LinkId,
        characteristic: Uuid,
        value: Vec<u8>,
        received_at: SystemTime,
    },
}

/// Something the driver has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartScan(ScanId),
    StopScan(ScanId),
    Connect {
        link: LinkId,
        address: BDAddr,
    },
    DiscoverServices(LinkId),
    /// Write the notification descriptor of `characteristic`
    EnableNotifications {
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    /// Release the link handle. Emitted at most once per link.
    Release(LinkId),
    Publish(Update),
}

/// A command the machine refused.
///
/// `effects` still have to be carried out. When the refusal is a failure
/// they report it to the sink.
#[derive(Debug, PartialEq)]
pub struct Rejected<E> {
    pub error: E,
    pub effects: Vec<Effect>,
}

impl Rejected<Failure> {
    fn failure(failure: Failure) -> Self {
        Self {
            effects: vec![publish(Status::Failed(failure.clone()))],
            error: failure,
        }
    }
}

impl<E> Rejected<E> {
    fn map_error<T>(self, f: impl FnOnce(E) -> T) -> Rejected<T> {
        Rejected {
            error: f(self.error),
            effects: self.effects,
        }
    }
}

pub struct Machine {
    target: TargetDescriptor,
    state: ConnectionState,
    scanner: Scanner,
    connection: Option<Connection>,
    notifications: NotificationChannel,
    next_link: u64,
    closed: bool,
}

impl Machine {
    pub fn new(target: TargetDescriptor) -> Self {
        Self {
            target,
            state: ConnectionState::Idle,
            scanner: Scanner::new(),
            connection: None,
            notifications: NotificationChannel::new(),
            next_link: 0,
            closed: false,
        }
    }

    #[inline]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[inline]
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// The live (or not yet released) connection
    #[inline]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// The scan advertisements should currently be reported for
    #[inline]
    pub fn active_scan(&self) -> Option<ScanId> {
        self.scanner.active()
    }

    #[inline]
    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    /// Start scanning for the target.
    ///
    /// Starting while already scanning does nothing. A refused scan still
    /// carries effects: they report the refusal to the sink.
    pub fn start_scan<G: AdapterGate + ?Sized>(
        &mut self,
        gate: &G,
    ) -> std::result::Result<Vec<Effect>, Rejected<Error>> {
        if self.scanner.is_scanning() {
            log::info!("Scanner is already started.");
            return Ok(Vec::new());
        }

        if self.state.is_in_flight() {
            return Err(Rejected {
                error: Error::Busy,
                effects: Vec::new(),
            });
        }

        let capability = gate.check_capability();
        if !capability.is_available() {
            log::warn!("Cannot scan: {:?}", capability);
            let failure = Failure::ScanUnavailable(capability);
            self.state = ConnectionState::Failed(failure.clone());
            return Err(Rejected::failure(failure).map_error(Error::from));
        }

        let mut effects = Vec::new();

        // A link left over from a failed attempt is released before scanning again.
        if let Err(failure) = self.release_connection(gate, &mut effects) {
            return Err(Rejected::failure(failure).map_error(Error::from));
        }

        let scan = self.scanner.start();
        self.closed = false;
        self.state = ConnectionState::Scanning;

        log::info!("Scanning for device {}", self.target.address());

        effects.push(Effect::StartScan(scan));
        effects.push(publish(Status::Scanning));
        Ok(effects)
    }

    /// Stop scanning. Safe to call when no scan is running.
    pub fn stop_scan(&mut self) -> Vec<Effect> {
        match self.scanner.stop() {
            Some(scan) => {
                log::info!("Scan stopped");
                if self.state == ConnectionState::Scanning {
                    self.state = ConnectionState::Idle;
                }
                vec![Effect::StopScan(scan), publish(Status::ScanStopped)]
            }
            None => {
                log::debug!("Scanner is already stopped");
                Vec::new()
            }
        }
    }

    /// Tear everything down.
    ///
    /// Stops any scan and releases the link handle exactly once, then returns
    /// to `Idle`. A second call is a no-op. If connect capability has been
    /// revoked the handle is not touched and `CloseDenied` is returned; the call
    /// can be repeated once the capability is back.
    pub fn close<G: AdapterGate + ?Sized>(
        &mut self,
        gate: &G,
    ) -> std::result::Result<Vec<Effect>, Rejected<Failure>> {
        let mut effects = Vec::new();

        if let Some(scan) = self.scanner.stop() {
            effects.push(Effect::StopScan(scan));
        }

        if let Err(failure) = self.release_connection(gate, &mut effects) {
            log::warn!("Close denied");
            let mut rejected = Rejected::failure(failure);
            effects.append(&mut rejected.effects);
            rejected.effects = effects;
            return Err(rejected);
        }

        if self.closed {
            return Ok(effects);
        }
        self.closed = true;

        if self.state == ConnectionState::Scanning || self.state.is_in_flight() {
            self.state = ConnectionState::Idle;
        }

        log::info!("Closed");
        effects.push(publish(Status::Closed));
        Ok(effects)
    }

    /// Process one transport event.
    ///
    /// Events that do not fit the current state, or that belong to a scan or
    /// link that is no longer current, are ignored.
    pub fn handle<G: AdapterGate + ?Sized>(&mut self, event: Event, gate: &G) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            Event::Advertisement { scan, address } => {
                if self.state != ConnectionState::Scanning {
                    return effects;
                }
                if let Some(address) = self.scanner.on_advertisement(scan, address, &self.target)
                {
                    effects.push(Effect::StopScan(scan));
                    effects.push(publish(Status::Found(address)));
                    self.connect(address, gate, &mut effects);
                }
            }
            Event::ScanFailed { scan, reason } => {
                if !self.scanner.owns(scan) {
                    return effects;
                }
                log::warn!("Scan failed: {}", reason);
                self.scanner.stop();
                effects.push(Effect::StopScan(scan));
                self.fail(Failure::ScanFailed(reason), gate, &mut effects);
            }
            Event::LinkUp(link) => {
                if !self.expects(link, &ConnectionState::Connecting) {
                    return effects;
                }
                let capability = gate.check_connect_capability();
                if !capability.is_available() {
                    self.fail(Failure::CapabilityDenied(capability), gate, &mut effects);
                    return effects;
                }
                log::info!("Connected, discovering services");
                self.state = ConnectionState::DiscoveringServices;
                effects.push(Effect::DiscoverServices(link));
                effects.push(publish(Status::DiscoveringServices));
            }
            Event::ConnectFailed { link, reason } => {
                if self.expects(link, &ConnectionState::Connecting) {
                    log::warn!("Could not connect: {}", reason);
                    self.fail(Failure::ConnectFailed(reason), gate, &mut effects);
                }
            }
            Event::LinkDown(link) => {
                if !self.is_current(link) || self.state.is_terminal() {
                    return effects;
                }
                log::info!("Disconnected from {}", self.target.address());
                self.state = ConnectionState::Disconnected;
                effects.push(publish(Status::Disconnected));
                effects.push(publish(Status::Failed(Failure::LinkDropped)));
                if let Err(failure) = self.release_connection(gate, &mut effects) {
                    log::warn!("Link handle kept after disconnect: {}", failure);
                }
            }
            Event::ServicesDiscovered { link, services } => {
                if !self.expects(link, &ConnectionState::DiscoveringServices) {
                    return effects;
                }
                let located = match self.connection.as_mut() {
                    Some(connection) => connection.on_discovered(&services, &self.target),
                    None => return effects,
                };
                match located {
                    Ok(()) => {
                        log::debug!("Target characteristics located");
                        self.state = ConnectionState::Subscribing;
                        effects.push(publish(Status::Subscribing));
                        self.subscribe_next(gate, &mut effects);
                    }
                    Err(failure) => self.fail(failure, gate, &mut effects),
                }
            }
            Event::DiscoveryFailed { link, reason } => {
                if self.expects(link, &ConnectionState::DiscoveringServices) {
                    self.fail(Failure::DiscoveryFailed(reason), gate, &mut effects);
                }
            }
            Event::DescriptorWritten {
                link,
                characteristic,
                result,
            } => {
                if !self.expects(link, &ConnectionState::Subscribing) {
                    return effects;
                }
                if let Err(reason) = result {
                    log::warn!("Enabling notifications failed: {}", reason);
                    self.fail(Failure::SubscriptionFailed, gate, &mut effects);
                    return effects;
                }
                let connection = match self.connection.as_mut() {
                    Some(connection) => connection,
                    None => return effects,
                };
                if !connection.on_subscribed(characteristic) {
                    log::debug!("Ignoring unexpected descriptor write for {}", characteristic);
                    return effects;
                }
                let done = connection.fully_subscribed();
                if done {
                    log::info!("Subscribed to notifications");
                    self.state = ConnectionState::Subscribed;
                    effects.push(publish(Status::Subscribed));
                } else {
                    self.subscribe_next(gate, &mut effects);
                }
            }
            Event::ValueChanged {
                link,
                characteristic,
                value,
                received_at,
            } => {
                if !matches!(
                    self.state,
                    ConnectionState::Subscribing | ConnectionState::Subscribed
                ) || !self.is_current(link)
                {
                    return effects;
                }
                let subscribed = self
                    .connection
                    .as_ref()
                    .map_or(false, |connection| connection.is_subscribed_to(characteristic));
                if !subscribed {
                    return effects;
                }
                if let Some(sample) =
                    self.notifications
                        .on_value_changed(characteristic, &value, received_at)
                {
                    effects.push(Effect::Publish(Update::Sample(sample)));
                }
            }
        }

        effects
    }

    fn connect<G: AdapterGate + ?Sized>(
        &mut self,
        address: BDAddr,
        gate: &G,
        effects: &mut Vec<Effect>,
    ) {
        let capability = gate.check_connect_capability();
        if !capability.is_available() {
            log::warn!("No connect capability: {:?}", capability);
            self.fail(Failure::CapabilityDenied(capability), gate, effects);
            return;
        }

        self.next_link += 1;
        let link = LinkId(self.next_link);
        self.connection = Some(Connection::new(link, address));
        self.state = ConnectionState::Connecting;

        log::debug!("Connecting to device {}", address);

        effects.push(Effect::Connect { link, address });
        effects.push(publish(Status::Connecting));
    }

    fn subscribe_next<G: AdapterGate + ?Sized>(&mut self, gate: &G, effects: &mut Vec<Effect>) {
        let capability = gate.check_connect_capability();
        if !capability.is_available() {
            self.fail(Failure::CapabilityDenied(capability), gate, effects);
            return;
        }

        let descriptor = self.target.notification_descriptor_uuid();
        if let Some(connection) = self.connection.as_mut() {
            if let Some(characteristic) = connection.next_subscription() {
                log::debug!("Enabling notifications for {}", characteristic);
                effects.push(Effect::EnableNotifications {
                    link: connection.link(),
                    characteristic,
                    descriptor,
                });
            }
        }
    }

    /// Enter a terminal failure and give the link back.
    fn fail<G: AdapterGate + ?Sized>(
        &mut self,
        failure: Failure,
        gate: &G,
        effects: &mut Vec<Effect>,
    ) {
        self.state = ConnectionState::Failed(failure.clone());
        effects.push(publish(Status::Failed(failure)));

        if let Err(failure) = self.release_connection(gate, effects) {
            log::warn!("Link handle kept after failure: {}", failure);
        }
    }

    fn release_connection<G: AdapterGate + ?Sized>(
        &mut self,
        gate: &G,
        effects: &mut Vec<Effect>,
    ) -> std::result::Result<(), Failure> {
        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => return Ok(()),
        };

        if !gate.check_connect_capability().is_available() {
            return Err(Failure::CloseDenied);
        }

        if connection.release() {
            log::debug!("Releasing link to {}", connection.address());
            effects.push(Effect::Release(connection.link()));
        }
        self.connection = None;
        Ok(())
    }

    fn is_current(&self, link: LinkId) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |connection| connection.link() == link)
    }

    fn expects(&self, link: LinkId, state: &ConnectionState) -> bool {
        &self.state == state && self.is_current(link)
    }

    /// The characteristic whose descriptor write is outstanding
    pub fn pending_subscription(&self) -> Option<Uuid> {
        self.connection.as_ref().and_then(Connection::awaiting)
    }
}

fn publish(status: Status) -> Effect {
    Effect::Publish(Update::Status(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{characteristics, services};
    use crate::gate::{RadioCapability, SharedCapability};
    use crate::target::parse_address;

    fn machine() -> Machine {
        Machine::new(TargetDescriptor::parse("AA:BB:CC:DD:EE:FF").unwrap())
    }

    fn found(machine: &mut Machine, gate: &SharedCapability) -> LinkId {
        let effects = machine.start_scan(gate).unwrap();
        let scan = match effects[0] {
            Effect::StartScan(scan) => scan,
            ref other => panic!("unexpected effect {:?}", other),
        };
        let address = machine.target().address();
        machine.handle(Event::Advertisement { scan, address }, gate);
        machine.connection().unwrap().link()
    }

    #[test]
    fn scan_requires_capability() {
        let gate = SharedCapability::new(RadioCapability::PermissionDenied);
        let mut machine = machine();

        let rejected = machine.start_scan(&gate).unwrap_err();

        assert!(matches!(
            rejected.error,
            Error::Failure(Failure::ScanUnavailable(RadioCapability::PermissionDenied))
        ));
        assert_eq!(
            rejected.effects,
            vec![publish(Status::Failed(Failure::ScanUnavailable(
                RadioCapability::PermissionDenied
            )))]
        );
        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(Failure::ScanUnavailable(RadioCapability::PermissionDenied))
        );
    }

    #[test]
    fn start_scan_twice_is_a_no_op() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();

        assert_eq!(machine.start_scan(&gate).unwrap().len(), 2);
        assert!(machine.start_scan(&gate).unwrap().is_empty());
    }

    #[test]
    fn start_scan_while_connecting_is_busy() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        found(&mut machine, &gate);

        assert_eq!(machine.state(), &ConnectionState::Connecting);
        let rejected = machine.start_scan(&gate).unwrap_err();
        assert!(matches!(rejected.error, Error::Busy));
        assert!(rejected.effects.is_empty());
    }

    #[test]
    fn match_without_connect_capability_fails() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let scan = match machine.start_scan(&gate).unwrap()[0] {
            Effect::StartScan(scan) => scan,
            _ => unreachable!(),
        };
        gate.set_connect(RadioCapability::PermissionDenied);
        let address = machine.target().address();

        let effects = machine.handle(Event::Advertisement { scan, address }, &gate);

        assert_eq!(effects[0], Effect::StopScan(scan));
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::Connect { .. })));
        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(Failure::CapabilityDenied(RadioCapability::PermissionDenied))
        );
    }

    #[test]
    fn connect_failure_releases_the_link() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let link = found(&mut machine, &gate);

        let effects = machine.handle(
            Event::ConnectFailed {
                link,
                reason: "timeout".into(),
            },
            &gate,
        );

        assert!(effects.contains(&Effect::Release(link)));
        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(Failure::ConnectFailed("timeout".into()))
        );
        assert!(machine.connection().is_none());
    }

    #[test]
    fn link_up_for_another_link_is_ignored() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let link = found(&mut machine, &gate);

        let effects = machine.handle(Event::LinkUp(LinkId(link.0 + 1)), &gate);

        assert!(effects.is_empty());
        assert_eq!(machine.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn subscription_rejected() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let link = found(&mut machine, &gate);
        machine.handle(Event::LinkUp(link), &gate);
        machine.handle(
            Event::ServicesDiscovered {
                link,
                services: vec![DiscoveredService {
                    uuid: services::GAUGE,
                    characteristics: vec![characteristics::STATE_OF_CHARGE],
                }],
            },
            &gate,
        );
        assert_eq!(
            machine.pending_subscription(),
            Some(characteristics::STATE_OF_CHARGE)
        );

        machine.handle(
            Event::DescriptorWritten {
                link,
                characteristic: characteristics::STATE_OF_CHARGE,
                result: Err("write not permitted".into()),
            },
            &gate,
        );

        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(Failure::SubscriptionFailed)
        );
    }

    #[test]
    fn close_denied_keeps_the_handle_until_capability_returns() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let link = found(&mut machine, &gate);

        gate.set_connect(RadioCapability::PermissionDenied);
        assert_eq!(
            machine.close(&gate),
            Err(Rejected {
                error: Failure::CloseDenied,
                effects: vec![publish(Status::Failed(Failure::CloseDenied))],
            })
        );
        assert!(machine.connection().is_some());

        gate.set_connect(RadioCapability::Available);
        let effects = machine.close(&gate).unwrap();
        assert_eq!(
            effects,
            vec![Effect::Release(link), publish(Status::Closed)]
        );
        assert!(machine.close(&gate).unwrap().is_empty());
        assert_eq!(machine.state(), &ConnectionState::Idle);
    }

    #[test]
    fn rescan_with_a_kept_handle_reports_close_denied() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let link = found(&mut machine, &gate);
        gate.set_connect(RadioCapability::PermissionDenied);
        machine.handle(
            Event::ConnectFailed {
                link,
                reason: "timeout".into(),
            },
            &gate,
        );
        assert!(machine.connection().is_some());

        let rejected = machine.start_scan(&gate).unwrap_err();

        assert!(matches!(
            rejected.error,
            Error::Failure(Failure::CloseDenied)
        ));
        assert_eq!(
            rejected.effects,
            vec![publish(Status::Failed(Failure::CloseDenied))]
        );
        assert!(machine.active_scan().is_none());
    }

    #[test]
    fn link_drop_reports_link_dropped() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let link = found(&mut machine, &gate);
        machine.handle(Event::LinkUp(link), &gate);

        let effects = machine.handle(Event::LinkDown(link), &gate);

        assert_eq!(
            effects,
            vec![
                publish(Status::Disconnected),
                publish(Status::Failed(Failure::LinkDropped)),
                Effect::Release(link),
            ]
        );
        assert_eq!(machine.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn scan_failure_is_terminal() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = machine();
        let scan = match machine.start_scan(&gate).unwrap()[0] {
            Effect::StartScan(scan) => scan,
            _ => unreachable!(),
        };

        machine.handle(
            Event::ScanFailed {
                scan,
                reason: "adapter busy".into(),
            },
            &gate,
        );

        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(Failure::ScanFailed("adapter busy".into()))
        );
        let other = parse_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(machine
            .handle(Event::Advertisement { scan, address: other }, &gate)
            .is_empty());
    }
}
