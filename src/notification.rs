use std::time::SystemTime;

use uuid::Uuid;

/// One decoded reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub characteristic: Uuid,
    pub value: u8,
    pub received_at: SystemTime,
}

/// Decode a notification payload: the first byte, unsigned.
///
/// Empty payloads yield `None`.
#[inline]
pub fn decode(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

/// Turns value-changed notifications into samples.
#[derive(Debug, Default)]
pub struct NotificationChannel {
    delivered: u64,
    dropped: u64,
}

impl NotificationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_value_changed(
        &mut self,
        characteristic: Uuid,
        payload: &[u8],
        received_at: SystemTime,
    ) -> Option<Sample> {
        match decode(payload) {
            Some(value) => {
                self.delivered += 1;
                log::debug!("Received value {} from {}", value, characteristic);
                Some(Sample {
                    characteristic,
                    value,
                    received_at,
                })
            }
            None => {
                self.dropped += 1;
                log::trace!("Dropping empty notification from {}", characteristic);
                None
            }
        }
    }

    /// Number of samples produced so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Number of empty payloads dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
