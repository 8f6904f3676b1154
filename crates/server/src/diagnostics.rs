//! Diagnostic audio dumps
//!
//! Optional per-call WAV capture of inbound caller audio, for offline
//! analysis of VAD/ASR behavior. Disabled by default; never on the
//! call's hot path for more than a buffered write.

use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;

use hound::{SampleFormat, WavSpec, WavWriter};

use callbridge_config::DiagnosticsConfig;
use callbridge_core::codec::mulaw_to_linear;
use callbridge_core::WIRE_RATE_HZ;

/// Inbound audio dump for one call.
pub struct InboundDump {
    writer: WavWriter<BufWriter<fs::File>>,
    path: PathBuf,
    failed: bool,
}

impl InboundDump {
    /// Create the dump file when enabled; any failure disables the
    /// dump for this call rather than affecting it.
    pub fn create(config: &DiagnosticsConfig, stream_sid: &str) -> Option<Self> {
        if !config.dump_inbound_wav {
            return None;
        }

        if let Err(e) = fs::create_dir_all(&config.dump_dir) {
            tracing::warn!(error = %e, dir = %config.dump_dir, "cannot create dump dir");
            return None;
        }

        let path = PathBuf::from(&config.dump_dir).join(format!("{stream_sid}-inbound.wav"));
        let spec = WavSpec {
            channels: 1,
            sample_rate: WIRE_RATE_HZ,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        match WavWriter::create(&path, spec) {
            Ok(writer) => {
                tracing::info!(path = %path.display(), "inbound audio dump enabled");
                Some(Self {
                    writer,
                    path,
                    failed: false,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot create inbound dump");
                None
            }
        }
    }

    /// Append one mu-law payload.
    pub fn write_mulaw(&mut self, payload: &[u8]) {
        if self.failed {
            return;
        }
        for &byte in payload {
            if self.writer.write_sample(mulaw_to_linear(byte)).is_err() {
                tracing::warn!(path = %self.path.display(), "inbound dump write failed, disabling");
                self.failed = true;
                return;
            }
        }
    }

    /// Flush and close the file.
    pub fn finalize(self) {
        if let Err(e) = self.writer.finalize() {
            tracing::warn!(error = %e, "inbound dump finalize failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let config = DiagnosticsConfig::default();
        assert!(InboundDump::create(&config, "MZ1").is_none());
    }

    #[test]
    fn test_writes_wav() {
        let dir = std::env::temp_dir().join("callbridge-dump-test");
        let config = DiagnosticsConfig {
            dump_inbound_wav: true,
            dump_dir: dir.to_string_lossy().into_owned(),
        };

        let mut dump = InboundDump::create(&config, "MZtest").unwrap();
        dump.write_mulaw(&vec![0xFFu8; 160]);
        dump.finalize();

        let path = dir.join("MZtest-inbound.wav");
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.len(), 160);
        let _ = fs::remove_file(path);
    }
}
