//! Minimal WebM (EBML) support for chunked recording.
//!
//! Two halves: the boundary scanner that splits a recorded byte stream into
//! initialization segment and media data, and a small PCM muxer used by the
//! microphone source to frame captured audio so every emitted buffer starts
//! on a Cluster boundary. Only what chunked upload needs is implemented;
//! this is not a general Matroska library.

/// Cluster element ID. The first occurrence of this marker in a recording
/// delimits the initialization segment from the first media segment.
pub const CLUSTER_ID: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

/// EBML document magic (first bytes of any WebM stream).
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Best-effort header length when no Cluster marker is found in chunk 0.
pub const HEADER_FALLBACK_BYTES: usize = 4096;

/// Byte offset of the first Cluster marker, if any.
pub fn find_cluster_boundary(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(CLUSTER_ID.len())
        .position(|window| window == CLUSTER_ID)
}

/// Structural check used by tests and diagnostics: the byte sequence opens
/// with an EBML header and carries at least one media cluster after it.
pub fn is_self_decodable(bytes: &[u8]) -> bool {
    if !bytes.starts_with(&EBML_MAGIC) {
        return false;
    }
    matches!(find_cluster_boundary(bytes), Some(pos) if pos > 0)
}

fn encode_vint(value: u64) -> Vec<u8> {
    // Smallest width whose all-ones value is not reserved
    for width in 1..=8usize {
        let max = (1u64 << (7 * width)) - 1;
        if value < max {
            let mut bytes = vec![0u8; width];
            let marked = value | (1u64 << (7 * width));
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (marked >> (8 * (width - 1 - i))) as u8;
            }
            return bytes;
        }
    }
    panic!("element size exceeds vint range");
}

fn element(id: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(id.len() + 8 + payload.len());
    out.extend_from_slice(id);
    out.extend_from_slice(&encode_vint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

fn uint_payload(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }
    let mut bytes = value.to_be_bytes().to_vec();
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes.remove(0);
    }
    bytes
}

fn uint_element(id: &[u8], value: u64) -> Vec<u8> {
    element(id, &uint_payload(value))
}

fn string_element(id: &[u8], value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

fn float_element(id: &[u8], value: f32) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

/// Muxes 16-bit mono PCM into a WebM stream: one initialization segment up
/// front, then self-contained clusters. Cluster timestamps are derived from
/// the running sample count so pauses in delivery do not skew the timeline.
pub struct WebmWriter {
    sample_rate: u32,
    channels: u16,
    samples_written: u64,
}

impl WebmWriter {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            samples_written: 0,
        }
    }

    /// EBML header + Segment opening + Info + Tracks. Emitted exactly once,
    /// before any cluster.
    pub fn init_segment(&self) -> Vec<u8> {
        let mut ebml = Vec::new();
        ebml.extend(uint_element(&[0x42, 0x86], 1)); // EBMLVersion
        ebml.extend(uint_element(&[0x42, 0xF7], 1)); // EBMLReadVersion
        ebml.extend(uint_element(&[0x42, 0xF2], 4)); // EBMLMaxIDLength
        ebml.extend(uint_element(&[0x42, 0xF3], 8)); // EBMLMaxSizeLength
        ebml.extend(string_element(&[0x42, 0x82], "webm")); // DocType
        ebml.extend(uint_element(&[0x42, 0x87], 2)); // DocTypeVersion
        ebml.extend(uint_element(&[0x42, 0x85], 2)); // DocTypeReadVersion

        let mut info = Vec::new();
        info.extend(uint_element(&[0x2A, 0xD7, 0xB1], 1_000_000)); // TimestampScale: 1ms
        info.extend(string_element(&[0x4D, 0x80], "vellum")); // MuxingApp
        info.extend(string_element(&[0x57, 0x41], "vellum")); // WritingApp

        let mut audio = Vec::new();
        audio.extend(float_element(&[0xB5], self.sample_rate as f32)); // SamplingFrequency
        audio.extend(uint_element(&[0x9F], self.channels as u64)); // Channels
        audio.extend(uint_element(&[0x62, 0x64], 16)); // BitDepth

        let mut track_entry = Vec::new();
        track_entry.extend(uint_element(&[0xD7], 1)); // TrackNumber
        track_entry.extend(uint_element(&[0x73, 0xC5], 1)); // TrackUID
        track_entry.extend(uint_element(&[0x83], 2)); // TrackType: audio
        track_entry.extend(string_element(&[0x86], "A_PCM/INT/LIT")); // CodecID
        track_entry.extend(element(&[0xE1], &audio));

        let tracks = element(&[0x16, 0x54, 0xAE, 0x6B], &element(&[0xAE], &track_entry));

        let mut out = element(&EBML_MAGIC, &ebml);
        // Segment with unknown size: clusters stream in live
        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67]);
        out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        out.extend(element(&[0x15, 0x49, 0xA9, 0x66], &info));
        out.extend(tracks);
        out
    }

    /// One Cluster wrapping the given samples as a single SimpleBlock.
    pub fn cluster(&mut self, samples: &[i16]) -> Vec<u8> {
        let timestamp_ms = self.samples_written * 1000 / self.sample_rate as u64;
        self.samples_written += (samples.len() / self.channels as usize) as u64;

        let mut block = Vec::with_capacity(4 + samples.len() * 2);
        block.push(0x81); // track 1
        block.extend_from_slice(&0i16.to_be_bytes()); // relative timestamp
        block.push(0x80); // keyframe
        for sample in samples {
            block.extend_from_slice(&sample.to_le_bytes());
        }

        let mut payload = uint_element(&[0xE7], timestamp_ms);
        payload.extend(element(&[0xA3], &block));
        element(&CLUSTER_ID, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vint_widths() {
        assert_eq!(encode_vint(0), vec![0x80]);
        assert_eq!(encode_vint(1), vec![0x81]);
        assert_eq!(encode_vint(126), vec![0xFE]);
        // 127 is the reserved all-ones 1-byte vint, must widen
        assert_eq!(encode_vint(127), vec![0x40, 0x7F]);
        assert_eq!(encode_vint(300).len(), 2);
    }

    #[test]
    fn test_uint_payload_minimal_bytes() {
        assert_eq!(uint_payload(0), vec![0]);
        assert_eq!(uint_payload(1), vec![1]);
        assert_eq!(uint_payload(0x0102), vec![1, 2]);
    }

    #[test]
    fn test_init_segment_shape() {
        let writer = WebmWriter::new(48_000, 1);
        let header = writer.init_segment();
        assert!(header.starts_with(&EBML_MAGIC));
        assert!(find_cluster_boundary(&header).is_none());
        // Codec id is embedded verbatim
        let codec = b"A_PCM/INT/LIT";
        assert!(header
            .windows(codec.len())
            .any(|window| window == codec));
    }

    #[test]
    fn test_cluster_starts_with_marker() {
        let mut writer = WebmWriter::new(48_000, 1);
        let cluster = writer.cluster(&[0i16; 480]);
        assert!(cluster.starts_with(&CLUSTER_ID));
    }

    #[test]
    fn test_cluster_timestamps_advance() {
        let mut writer = WebmWriter::new(1000, 1);
        let _first = writer.cluster(&[0i16; 500]); // 500ms of audio
        let second = writer.cluster(&[0i16; 500]);
        // Second cluster timestamp element should encode 500
        let expected = uint_element(&[0xE7], 500);
        assert!(second
            .windows(expected.len())
            .any(|window| window == expected));
    }

    #[test]
    fn test_boundary_split_round_trip() {
        let mut writer = WebmWriter::new(48_000, 1);
        let header = writer.init_segment();
        let cluster = writer.cluster(&[100i16; 480]);

        let mut stream = header.clone();
        stream.extend_from_slice(&cluster);

        assert_eq!(find_cluster_boundary(&stream), Some(header.len()));
        assert!(is_self_decodable(&stream));
    }

    #[test]
    fn test_header_prepended_chunk_is_self_decodable() {
        let mut writer = WebmWriter::new(48_000, 1);
        let header = writer.init_segment();
        let _chunk0 = writer.cluster(&[1i16; 480]);
        let chunk1 = writer.cluster(&[2i16; 480]);

        // A later chunk alone is not decodable; with the header it is
        assert!(!is_self_decodable(&chunk1));
        let mut rebuilt = header;
        rebuilt.extend_from_slice(&chunk1);
        assert!(is_self_decodable(&rebuilt));
    }
}
