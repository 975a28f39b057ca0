use std::str::FromStr;

use btleplug::api::BDAddr;
use uuid::Uuid;

use crate::common::{characteristics, descriptors, services, DEFAULT_ADDRESS};
use crate::error::{Error, Result};

/// The peripheral and GATT layout the monitor follows.
///
/// Built once and never mutated. Use the chained setters to adjust the
/// defaults before handing it to a [`Machine`](crate::Machine) or
/// [`Monitor`](crate::Monitor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    address: BDAddr,
    service: Uuid,
    characteristics: Vec<Uuid>,
    notification_descriptor: Uuid,
}

impl TargetDescriptor {
    /// Target the gauge service and its state-of-charge characteristic on `address`.
    pub fn new(address: BDAddr) -> Self {
        Self {
            address,
            service: services::GAUGE,
            characteristics: vec![characteristics::STATE_OF_CHARGE],
            notification_descriptor: descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
        }
    }

    /// Parse the address in `XX:XX:XX:XX:XX:XX` form, in either letter case.
    pub fn parse(address: &str) -> Result<Self> {
        Ok(Self::new(parse_address(address)?))
    }

    /// The gauge peripheral at [`DEFAULT_ADDRESS`].
    pub fn gauge() -> Result<Self> {
        Self::parse(DEFAULT_ADDRESS)
    }

    /// Service that holds the target characteristics
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.service = uuid;
        self
    }

    /// Replace the target characteristics with a single one
    pub fn characteristic(mut self, uuid: Uuid) -> Self {
        self.characteristics = vec![uuid];
        self
    }

    /// Subscribe to one more characteristic of the same service
    pub fn with_characteristic(mut self, uuid: Uuid) -> Self {
        if !self.characteristics.contains(&uuid) {
            self.characteristics.push(uuid);
        }
        self
    }

    /// Descriptor written to enable notifications
    pub fn notification_descriptor(mut self, uuid: Uuid) -> Self {
        self.notification_descriptor = uuid;
        self
    }

    #[inline]
    pub fn address(&self) -> BDAddr {
        self.address
    }

    #[inline]
    pub fn service_uuid(&self) -> Uuid {
        self.service
    }

    #[inline]
    pub fn characteristic_uuids(&self) -> &[Uuid] {
        &self.characteristics
    }

    #[inline]
    pub fn notification_descriptor_uuid(&self) -> Uuid {
        self.notification_descriptor
    }

    /// Whether an advertisement from `address` comes from the target.
    #[inline]
    pub fn matches(&self, address: BDAddr) -> bool {
        self.address == address
    }
}

impl FromStr for TargetDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub(crate) fn parse_address(address: &str) -> Result<BDAddr> {
    address
        .trim()
        .parse::<BDAddr>()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_matching_ignores_case() {
        let target = TargetDescriptor::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let lower = parse_address("aa:bb:cc:dd:ee:ff").unwrap();
        let other = parse_address("11:22:33:44:55:66").unwrap();

        assert!(target.matches(lower));
        assert!(!target.matches(other));
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert!(matches!(
            TargetDescriptor::parse("not an address"),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn defaults_follow_the_gauge_profile() {
        let target = TargetDescriptor::gauge().unwrap();
        assert_eq!(target.address().to_string(), DEFAULT_ADDRESS);
        assert_eq!(target.service_uuid(), services::GAUGE);
        assert_eq!(
            target.characteristic_uuids(),
            &[characteristics::STATE_OF_CHARGE]
        );
        assert_eq!(
            target.notification_descriptor_uuid(),
            descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION
        );
    }

    #[test]
    fn extra_characteristics_are_not_duplicated() {
        let target = TargetDescriptor::gauge()
            .unwrap()
            .with_characteristic(characteristics::RPM)
            .with_characteristic(characteristics::RPM);

        assert_eq!(
            target.characteristic_uuids(),
            &[characteristics::STATE_OF_CHARGE, characteristics::RPM]
        );
    }
}
