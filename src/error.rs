use crate::gate::RadioCapability;
use thiserror::Error;

/// Why a scan or connection attempt ended.
///
/// Every failure is terminal for the attempt it belongs to. Nothing is retried
/// internally; the caller decides whether to call `start_scan` again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("radio capability denied ({0:?})")]
    CapabilityDenied(RadioCapability),
    #[error("scan unavailable ({0:?})")]
    ScanUnavailable(RadioCapability),
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("could not connect: {0}")]
    ConnectFailed(String),
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("characteristic not found")]
    CharacteristicNotFound,
    #[error("subscription failed")]
    SubscriptionFailed,
    #[error("link dropped")]
    LinkDropped,
    #[error("close denied, connect capability revoked")]
    CloseDenied,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Failure(#[from] Failure),
    #[error(transparent)]
    Btle(#[from] btleplug::Error),
    #[error("invalid peripheral address: {0}")]
    InvalidAddress(String),
    #[error("no bluetooth adapter at index {0}")]
    AdapterNotFound(usize),
    #[error("a connection is already in progress")]
    Busy,
    #[error("monitor is not started")]
    NotStarted,
    #[error("monitor worker has stopped")]
    WorkerGone,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
