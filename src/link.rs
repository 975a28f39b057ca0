use std::pin::Pin;

use btleplug::api::{BDAddr, Central, Peripheral as _, ValueNotification};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::connection::DiscoveredService;
use crate::error::{Error, Failure, Result};

/// GATT access to the target peripheral.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    peripheral: Peripheral,
}

impl Link {
    pub(crate) fn new(peripheral: Peripheral) -> Self {
        Self { peripheral }
    }

    /// Look the peripheral with `address` up among the ones the adapter has seen.
    pub(crate) async fn find(adapter: &Adapter, address: BDAddr) -> Result<Option<Self>> {
        Ok(adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| peripheral.address() == address)
            .map(Link::new))
    }

    #[inline]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }

    #[inline]
    pub fn id(&self) -> PeripheralId {
        self.peripheral.id()
    }

    /// Open the link. Connecting an already connected peripheral does nothing.
    pub async fn connect(&self) -> Result<()> {
        if !self.peripheral.is_connected().await? {
            log::debug!("Connecting to device {}", self.address());
            self.peripheral.connect().await?;
        }
        Ok(())
    }

    /// Services of the peripheral with their characteristics
    pub async fn discover(&self) -> Result<Vec<DiscoveredService>> {
        let mut services = self.peripheral.services();
        if services.is_empty() {
            log::debug!("Discovering services for {}", self.address());
            self.peripheral.discover_services().await?;
            services = self.peripheral.services();
        }

        Ok(services
            .into_iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|characteristic| characteristic.uuid)
                    .collect(),
            })
            .collect::<Vec<_>>())
    }

    /// Write the client characteristic configuration descriptor of `uuid` so
    /// that the peripheral starts notifying.
    pub async fn enable_notifications(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or(Error::Failure(Failure::CharacteristicNotFound))?;

        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    /// Notifications from any of `uuids`, in the order the peripheral sent them.
    pub async fn notifications(
        &self,
        uuids: Vec<Uuid>,
    ) -> Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>> {
        let stream = self.peripheral.notifications().await?;

        Ok(Box::pin(stream.filter(move |n| {
            let wanted = uuids.contains(&n.uuid);
            async move { wanted }
        })))
    }

    /// Give the link handle back to the platform.
    pub async fn release(&self) -> Result<()> {
        log::debug!("Disconnecting from {}", self.address());
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
