use btleplug::api::BDAddr;

use crate::TargetDescriptor;

/// Identifies one `start_scan` call. Advertisements and scan errors are tagged
/// with it so that reports from a scan that was already stopped are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub(crate) u64);

#[derive(Debug)]
struct ScanSession {
    id: ScanId,
    /// Set once the target was seen; the session is dropped right after.
    completed: bool,
}

/// Advertisement filtering for a single target.
///
/// Only one scan is active at a time. The first advertisement that matches the
/// target completes the scan; anything that arrives afterwards is ignored.
#[derive(Debug, Default)]
pub struct Scanner {
    next_id: u64,
    session: Option<ScanSession>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new scan session and return its id.
    pub fn start(&mut self) -> ScanId {
        self.next_id += 1;
        let id = ScanId(self.next_id);
        self.session = Some(ScanSession {
            id,
            completed: false,
        });
        id
    }

    /// Close the active session. Returns the id of the scan that has to be
    /// stopped on the radio, or `None` when nothing was scanning.
    pub fn stop(&mut self) -> Option<ScanId> {
        self.session.take().map(|session| session.id)
    }

    #[inline]
    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    #[inline]
    pub fn active(&self) -> Option<ScanId> {
        self.session.as_ref().map(|session| session.id)
    }

    /// Match an advertisement against the target.
    ///
    /// Returns the address to connect to for the first match of the active
    /// session. The session is closed on that match, so the caller must stop
    /// the radio scan for `id`.
    pub fn on_advertisement(
        &mut self,
        id: ScanId,
        address: BDAddr,
        target: &TargetDescriptor,
    ) -> Option<BDAddr> {
        let session = match self.session.as_mut() {
            Some(session) if session.id == id && !session.completed => session,
            _ => {
                log::trace!("Ignoring advertisement from {} for stale scan", address);
                return None;
            }
        };

        log::trace!("Advertisement from {}", address);

        if !target.matches(address) {
            return None;
        }

        session.completed = true;
        self.session = None;

        log::info!("Found target device {}", address);

        Some(address)
    }

    /// Whether a platform report for `id` still concerns the active scan.
    pub fn owns(&self, id: ScanId) -> bool {
        self.active() == Some(id)
    }
}
