use std::collections::VecDeque;
use std::fmt;

use btleplug::api::BDAddr;
use uuid::Uuid;

use crate::error::Failure;
use crate::TargetDescriptor;

/// Lifecycle of the single link the monitor maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Subscribed,
    Disconnected,
    Failed(Failure),
}

impl ConnectionState {
    /// A link is being established or is up.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::Subscribing
                | ConnectionState::Subscribed
        )
    }

    /// Nothing happens until the caller starts a new scan.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("Idle"),
            ConnectionState::Scanning => f.write_str("Scanning"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::DiscoveringServices => f.write_str("Discovering services"),
            ConnectionState::Subscribing => f.write_str("Subscribing"),
            ConnectionState::Subscribed => f.write_str("Subscribed"),
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Failed(failure) => write!(f, "Failed: {}", failure),
        }
    }
}

/// Identifies one connection attempt. Transport completions carry it, and a
/// completion whose link is no longer live is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u64);

/// A GATT service as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// The live link to the target peripheral.
#[derive(Debug)]
pub struct Connection {
    link: LinkId,
    address: BDAddr,
    discovered: bool,
    /// Characteristics still waiting for their descriptor write
    pending: VecDeque<Uuid>,
    /// The descriptor write currently outstanding
    awaiting: Option<Uuid>,
    subscribed: Vec<Uuid>,
    released: bool,
}

impl Connection {
    pub(crate) fn new(link: LinkId, address: BDAddr) -> Self {
        Self {
            link,
            address,
            discovered: false,
            pending: VecDeque::new(),
            awaiting: None,
            subscribed: Vec::new(),
            released: false,
        }
    }

    #[inline]
    pub fn link(&self) -> LinkId {
        self.link
    }

    #[inline]
    pub fn address(&self) -> BDAddr {
        self.address
    }

    /// Characteristics with notifications enabled
    #[inline]
    pub fn subscribed(&self) -> &[Uuid] {
        &self.subscribed
    }

    #[inline]
    pub fn is_subscribed_to(&self, uuid: Uuid) -> bool {
        self.subscribed.contains(&uuid)
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Record the discovery result. Every target characteristic must be part of
    /// the target service.
    pub(crate) fn on_discovered(
        &mut self,
        services: &[DiscoveredService],
        target: &TargetDescriptor,
    ) -> Result<(), Failure> {
        let characteristics = locate(services, target)?;

        self.discovered = true;
        self.pending = characteristics.into();
        Ok(())
    }

    /// Take the next characteristic to enable notifications for. Nothing is
    /// handed out before a successful discovery, nor while a write is pending.
    pub(crate) fn next_subscription(&mut self) -> Option<Uuid> {
        if !self.discovered || self.awaiting.is_some() {
            return None;
        }

        self.awaiting = self.pending.pop_front();
        self.awaiting
    }

    /// Confirm the outstanding descriptor write. Returns `false` for a write
    /// that was never requested.
    pub(crate) fn on_subscribed(&mut self, uuid: Uuid) -> bool {
        if self.awaiting != Some(uuid) {
            return false;
        }

        self.awaiting = None;
        self.subscribed.push(uuid);
        true
    }

    #[inline]
    pub(crate) fn awaiting(&self) -> Option<Uuid> {
        self.awaiting
    }

    /// All requested subscriptions are confirmed.
    pub(crate) fn fully_subscribed(&self) -> bool {
        self.discovered && self.awaiting.is_none() && self.pending.is_empty()
    }

    /// Mark the link handle released. Returns `true` only the first time.
    pub(crate) fn release(&mut self) -> bool {
        !std::mem::replace(&mut self.released, true)
    }
}

/// Find the target characteristics inside the target service.
pub fn locate(
    services: &[DiscoveredService],
    target: &TargetDescriptor,
) -> Result<Vec<Uuid>, Failure> {
    let service = services
        .iter()
        .find(|service| service.uuid == target.service_uuid())
        .ok_or_else(|| {
            log::debug!("Service {} not found", target.service_uuid());
            Failure::CharacteristicNotFound
        })?;

    for uuid in target.characteristic_uuids() {
        if !service.characteristics.contains(uuid) {
            log::debug!(
                "Characteristic {} not found in service {}",
                uuid,
                service.uuid
            );
            return Err(Failure::CharacteristicNotFound);
        }
    }

    Ok(target.characteristic_uuids().to_vec())
}
