use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sample rate of client audio (16 kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Client audio is mono
pub const CHANNELS: u16 = 1;

/// Client audio is signed 16-bit little-endian PCM
pub const BITS_PER_SAMPLE: u16 = 16;

/// WAV format of finalized recordings and of chunks sent for recognition
pub fn wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Append-only raw PCM buffer for one session
///
/// Chunks are appended to `<temp_dir>/<session_id>.pcm` as they arrive. On
/// finish the buffer is wrapped into a playable WAV file and the temporary
/// file is removed.
pub struct AudioBuffer {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl AudioBuffer {
    pub fn create(temp_dir: impl AsRef<Path>, session_id: &str) -> Result<Self> {
        let temp_dir = temp_dir.as_ref();
        fs::create_dir_all(temp_dir)
            .with_context(|| format!("Failed to create temp directory {:?}", temp_dir))?;

        let path = temp_dir.join(format!("{}.pcm", encode_component(session_id)));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create audio buffer {:?}", path))?;

        debug!("Opened audio buffer {}", path.display());

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
        })
    }

    pub fn append(&mut self, pcm: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("Audio buffer already closed")?;
        writer
            .write_all(pcm)
            .context("Failed to append to audio buffer")?;
        self.bytes_written += pcm.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Wrap the accumulated PCM into a WAV file at `dest` and remove the
    /// temporary buffer.
    pub fn finalize(mut self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let dest = dest.as_ref().to_path_buf();

        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("Failed to flush audio buffer")?;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create recording directory {:?}", parent))?;
        }

        let samples = write_wav(&self.path, &dest)?;
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove audio buffer {:?}", self.path))?;

        info!(
            "Recording saved: {} ({:.1}s)",
            dest.display(),
            samples as f64 / SAMPLE_RATE as f64
        );

        Ok(dest)
    }

    /// Drop the buffer without producing a recording
    pub fn discard(mut self) -> Result<()> {
        self.writer.take();
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove audio buffer {:?}", self.path))
    }
}

/// Copy raw PCM from `pcm_path` into a WAV file, returning the sample count.
fn write_wav(pcm_path: &Path, wav_path: &Path) -> Result<usize> {
    let mut reader = BufReader::new(
        File::open(pcm_path).with_context(|| format!("Failed to open {:?}", pcm_path))?,
    );
    let mut writer = hound::WavWriter::create(wav_path, wav_spec())
        .with_context(|| format!("Failed to create WAV file: {:?}", wav_path))?;

    let mut samples = 0usize;
    let mut buf = [0u8; 8192];
    // A sample may straddle two reads
    let mut carry: Option<u8> = None;

    loop {
        let n = reader.read(&mut buf).context("Failed to read audio buffer")?;
        if n == 0 {
            break;
        }

        let mut bytes = &buf[..n];
        if let Some(lo) = carry.take() {
            writer
                .write_sample(i16::from_le_bytes([lo, bytes[0]]))
                .context("Failed to write sample to WAV")?;
            samples += 1;
            bytes = &bytes[1..];
        }

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .context("Failed to write sample to WAV")?;
            samples += 1;
        }
        carry = pairs.remainder().first().copied();
    }

    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(samples)
}

/// Wrap an in-memory PCM chunk into WAV bytes
pub fn pcm_to_wav_bytes(pcm: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec())
            .context("Failed to start WAV encoding")?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .context("Failed to write sample to WAV")?;
        }
        writer.finalize().context("Failed to finalize WAV data")?;
    }
    Ok(cursor.into_inner())
}

/// Encode an identifier as a single path component.
///
/// ASCII letters, digits, `-` and `_` are kept; every other byte becomes
/// `%XX`. Distinct identifiers always map to distinct names.
pub fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        // Never produced for a non-empty input
        return "%".to_string();
    }

    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_components_are_distinct_and_flat() {
        assert_eq!(encode_component("user-01_a"), "user-01_a");
        assert_eq!(encode_component("../etc/passwd"), "%2E%2E%2Fetc%2Fpasswd");
        assert_eq!(encode_component("a b%"), "a%20b%25");
        assert_eq!(encode_component(""), "%");

        let ids = ["a_b", "a.b", "a/b", "a b", "a%2Eb", "a%5Fb", ""];
        let encoded: std::collections::HashSet<_> =
            ids.iter().map(|id| encode_component(id)).collect();
        assert_eq!(encoded.len(), ids.len());
    }

    #[test]
    fn pcm_to_wav_bytes_keeps_samples() {
        let samples: Vec<i16> = vec![1, -1, 1000, -1000];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let wav = pcm_to_wav_bytes(&pcm).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec(), wav_spec());

        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }
}
