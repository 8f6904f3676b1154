//! Wire-level audio frame types

/// Direction of a media frame relative to this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    /// Caller audio arriving from the telephony provider.
    Inbound,
    /// Synthesized audio leaving toward the telephony provider.
    Outbound,
}

/// Smallest wire unit: one mu-law media frame.
///
/// Frames are ephemeral; they are never persisted past their pipeline
/// stage. Sequence numbers are strictly monotonic per direction.
#[derive(Clone)]
pub struct AudioFrame {
    /// Monotonically increasing sequence number
    pub sequence: u64,
    /// Timestamp in milliseconds relative to session start
    pub timestamp_ms: u64,
    /// Raw mu-law payload bytes
    pub payload: Vec<u8>,
    /// Direction of travel
    pub direction: MediaDirection,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("sequence", &self.sequence)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("payload_len", &self.payload.len())
            .field("direction", &self.direction)
            .finish()
    }
}

impl AudioFrame {
    /// Create an inbound frame from decoded wire fields.
    pub fn inbound(sequence: u64, timestamp_ms: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp_ms,
            payload,
            direction: MediaDirection::Inbound,
        }
    }

    /// Create an outbound frame.
    pub fn outbound(sequence: u64, timestamp_ms: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp_ms,
            payload,
            direction: MediaDirection::Outbound,
        }
    }

    /// Frame duration in milliseconds at the wire rate (8kHz mu-law,
    /// one byte per sample).
    pub fn duration_ms(&self, rate_hz: u32) -> u64 {
        (self.payload.len() as u64 * 1000) / rate_hz as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        let frame = AudioFrame::inbound(0, 0, vec![0u8; 160]);
        assert_eq!(frame.duration_ms(8000), 20);
    }

    #[test]
    fn test_debug_elides_payload() {
        let frame = AudioFrame::inbound(7, 140, vec![0u8; 160]);
        let repr = format!("{:?}", frame);
        assert!(repr.contains("payload_len"));
        assert!(repr.contains("160"));
    }
}
