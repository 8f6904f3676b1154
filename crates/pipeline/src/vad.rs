//! Energy-based Voice Activity Detection
//!
//! Classifies fixed-size PCM16 windows as speech or silence from their
//! RMS energy, with a hysteresis pair of thresholds so a single noisy
//! window cannot flap the state. Speech is confirmed after
//! `min_speech_ms` of consecutive above-threshold windows; silence
//! after `min_silence_ms` below the lower threshold.

use callbridge_config::VadSettings;

/// VAD configuration.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Energy (dB RMS) above which a window counts as speech
    pub on_threshold_db: f32,
    /// Energy (dB RMS) below which a window counts as silence
    pub off_threshold_db: f32,
    /// Consecutive speech needed to confirm an utterance start, in ms
    pub min_speech_ms: u32,
    /// Consecutive silence needed to end an utterance, in ms
    pub min_silence_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            on_threshold_db: -35.0,
            off_threshold_db: -45.0,
            min_speech_ms: 120,
            min_silence_ms: 600,
        }
    }
}

impl From<&VadSettings> for VadConfig {
    fn from(settings: &VadSettings) -> Self {
        Self {
            on_threshold_db: settings.on_threshold_db,
            off_threshold_db: settings.off_threshold_db,
            min_speech_ms: settings.min_speech_ms,
            min_silence_ms: settings.min_silence_ms,
        }
    }
}

/// VAD state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    /// No speech detected
    #[default]
    Silence,
    /// Potential speech start, accumulating
    SpeechStart,
    /// Active speech confirmed
    Speech,
    /// Potential speech end, accumulating silence
    SpeechEnd,
}

/// Edge events produced by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded,
}

/// Energy VAD over fixed PCM16 windows.
pub struct EnergyVad {
    config: VadConfig,
    state: VadState,
    speech_ms: u32,
    silence_ms: u32,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Silence,
            speech_ms: 0,
            silence_ms: 0,
        }
    }

    /// Process one window of PCM16 audio lasting `window_ms`.
    ///
    /// Returns an edge event when the hysteresis thresholds are met.
    pub fn process_window(&mut self, pcm16: &[u8], window_ms: u32) -> Option<VadEvent> {
        let energy = energy_db(pcm16);
        let above_on = energy > self.config.on_threshold_db;
        let below_off = energy < self.config.off_threshold_db;

        match self.state {
            VadState::Silence => {
                if above_on {
                    self.state = VadState::SpeechStart;
                    self.speech_ms = window_ms;
                    if self.speech_ms >= self.config.min_speech_ms {
                        self.state = VadState::Speech;
                        return Some(VadEvent::SpeechStarted);
                    }
                }
                None
            }
            VadState::SpeechStart => {
                if above_on {
                    self.speech_ms += window_ms;
                    if self.speech_ms >= self.config.min_speech_ms {
                        self.state = VadState::Speech;
                        return Some(VadEvent::SpeechStarted);
                    }
                } else if below_off {
                    // Never confirmed, back to silence without an event.
                    self.state = VadState::Silence;
                    self.speech_ms = 0;
                }
                None
            }
            VadState::Speech => {
                if below_off {
                    self.state = VadState::SpeechEnd;
                    self.silence_ms = window_ms;
                    if self.silence_ms >= self.config.min_silence_ms {
                        self.state = VadState::Silence;
                        self.speech_ms = 0;
                        return Some(VadEvent::SpeechEnded);
                    }
                }
                None
            }
            VadState::SpeechEnd => {
                if below_off {
                    self.silence_ms += window_ms;
                    if self.silence_ms >= self.config.min_silence_ms {
                        self.state = VadState::Silence;
                        self.speech_ms = 0;
                        self.silence_ms = 0;
                        return Some(VadEvent::SpeechEnded);
                    }
                } else {
                    // Back above the lower threshold: speech resumes.
                    self.state = VadState::Speech;
                    self.silence_ms = 0;
                }
                None
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> VadState {
        self.state
    }

    /// Whether the detector currently considers the caller to be speaking.
    pub fn in_speech(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::SpeechEnd)
    }

    /// Reset to silence (used by the endpointing override).
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_ms = 0;
        self.silence_ms = 0;
    }
}

/// RMS energy of a PCM16 window in decibels relative to full scale.
pub fn energy_db(pcm16: &[u8]) -> f32 {
    if pcm16.len() < 2 {
        return -96.0;
    }

    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for chunk in pcm16.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
        sum_squares += sample * sample;
        count += 1;
    }

    let rms = (sum_squares / count as f64).sqrt() as f32;
    if rms > 0.0 {
        20.0 * rms.log10()
    } else {
        -96.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_window() -> Vec<u8> {
        // ~-10 dB: amplitude 0.3
        let sample = (0.3f32 * 32767.0) as i16;
        sample
            .to_le_bytes()
            .iter()
            .cycle()
            .take(320)
            .copied()
            .collect()
    }

    fn quiet_window() -> Vec<u8> {
        vec![0u8; 320]
    }

    fn config() -> VadConfig {
        VadConfig {
            on_threshold_db: -35.0,
            off_threshold_db: -45.0,
            min_speech_ms: 120,
            min_silence_ms: 600,
        }
    }

    #[test]
    fn test_energy_of_silence() {
        assert!(energy_db(&quiet_window()) <= -96.0);
        assert!(energy_db(&loud_window()) > -20.0);
    }

    #[test]
    fn test_speech_confirmed_after_min_speech() {
        let mut vad = EnergyVad::new(config());
        let loud = loud_window();

        // 120ms at 20ms windows = 6 windows
        for _ in 0..5 {
            assert_eq!(vad.process_window(&loud, 20), None);
        }
        assert_eq!(vad.process_window(&loud, 20), Some(VadEvent::SpeechStarted));
        assert_eq!(vad.state(), VadState::Speech);
    }

    #[test]
    fn test_short_burst_is_not_speech() {
        let mut vad = EnergyVad::new(config());
        let loud = loud_window();
        let quiet = quiet_window();

        // 100ms of speech then silence: below min_speech_ms.
        for _ in 0..5 {
            assert_eq!(vad.process_window(&loud, 20), None);
        }
        assert_eq!(vad.process_window(&quiet, 20), None);
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn test_speech_ends_after_min_silence() {
        let mut vad = EnergyVad::new(config());
        let loud = loud_window();
        let quiet = quiet_window();

        for _ in 0..6 {
            vad.process_window(&loud, 20);
        }
        assert_eq!(vad.state(), VadState::Speech);

        // 600ms at 20ms windows = 30 windows
        let mut ended = false;
        for _ in 0..30 {
            if vad.process_window(&quiet, 20) == Some(VadEvent::SpeechEnded) {
                ended = true;
            }
        }
        assert!(ended);
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn test_hysteresis_prevents_flapping() {
        let mut vad = EnergyVad::new(config());
        let loud = loud_window();

        for _ in 0..6 {
            vad.process_window(&loud, 20);
        }

        // -40 dB sits between off (-45) and on (-35): still speech.
        let sample = (0.01f32 * 32767.0) as i16; // ~-40 dB
        let mid: Vec<u8> = sample
            .to_le_bytes()
            .iter()
            .cycle()
            .take(320)
            .copied()
            .collect();

        for _ in 0..40 {
            assert_eq!(vad.process_window(&mid, 20), None);
        }
        assert!(vad.in_speech());
    }

    #[test]
    fn test_reset() {
        let mut vad = EnergyVad::new(config());
        for _ in 0..6 {
            vad.process_window(&loud_window(), 20);
        }
        assert!(vad.in_speech());
        vad.reset();
        assert_eq!(vad.state(), VadState::Silence);
    }
}
