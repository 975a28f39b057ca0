use std::sync::{Arc, RwLock};

/// Whether the local radio may currently be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCapability {
    Unavailable,
    Available,
    PermissionDenied,
}

impl RadioCapability {
    #[inline]
    pub fn is_available(self) -> bool {
        self == RadioCapability::Available
    }
}

/// Availability and permission checks for the local Bluetooth radio.
///
/// Implementations must answer from the current host state every time they are
/// asked. The radio can be switched off or a permission revoked between two
/// calls, so callers query the gate right before each scan or connect.
pub trait AdapterGate: Send + Sync {
    /// Whether scanning is currently permitted.
    fn check_capability(&self) -> RadioCapability;

    /// Whether connecting, subscribing and releasing a link is permitted.
    ///
    /// Hosts that grant scan and connect access separately override this.
    fn check_connect_capability(&self) -> RadioCapability {
        self.check_capability()
    }
}

impl<F> AdapterGate for F
where
    F: Fn() -> RadioCapability + Send + Sync,
{
    fn check_capability(&self) -> RadioCapability {
        self()
    }
}

/// A gate the host updates from its own permission flow.
///
/// Clones share state, so the host keeps one handle and passes another one to
/// the monitor.
#[derive(Debug, Clone)]
pub struct SharedCapability {
    scan: Arc<RwLock<RadioCapability>>,
    connect: Arc<RwLock<RadioCapability>>,
}

impl Default for SharedCapability {
    fn default() -> Self {
        SharedCapability::new(RadioCapability::Unavailable)
    }
}

impl SharedCapability {
    pub fn new(capability: RadioCapability) -> Self {
        Self {
            scan: Arc::new(RwLock::new(capability)),
            connect: Arc::new(RwLock::new(capability)),
        }
    }

    /// Set both scan and connect capability.
    pub fn set(&self, capability: RadioCapability) {
        self.set_scan(capability);
        self.set_connect(capability);
    }

    pub fn set_scan(&self, capability: RadioCapability) {
        Self::write(&self.scan, capability);
    }

    pub fn set_connect(&self, capability: RadioCapability) {
        Self::write(&self.connect, capability);
    }

    fn write(slot: &RwLock<RadioCapability>, capability: RadioCapability) {
        match slot.write() {
            Ok(mut guard) => *guard = capability,
            Err(poisoned) => *poisoned.into_inner() = capability,
        }
    }

    fn read(slot: &RwLock<RadioCapability>) -> RadioCapability {
        match slot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl AdapterGate for SharedCapability {
    fn check_capability(&self) -> RadioCapability {
        Self::read(&self.scan)
    }

    fn check_connect_capability(&self) -> RadioCapability {
        Self::read(&self.connect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_capability_is_read_fresh_on_every_check() {
        let host = SharedCapability::new(RadioCapability::Available);
        let gate = host.clone();
        assert_eq!(gate.check_capability(), RadioCapability::Available);

        host.set(RadioCapability::PermissionDenied);
        assert_eq!(gate.check_capability(), RadioCapability::PermissionDenied);
        assert_eq!(
            gate.check_connect_capability(),
            RadioCapability::PermissionDenied
        );
    }

    #[test]
    fn scan_and_connect_can_differ() {
        let gate = SharedCapability::new(RadioCapability::Available);
        gate.set_connect(RadioCapability::PermissionDenied);

        assert!(gate.check_capability().is_available());
        assert!(!gate.check_connect_capability().is_available());
    }

    #[test]
    fn closures_are_gates() {
        let gate = || RadioCapability::Unavailable;
        assert_eq!(gate.check_capability(), RadioCapability::Unavailable);
        assert_eq!(gate.check_connect_capability(), RadioCapability::Unavailable);
    }
}
