use std::collections::BTreeMap;
use std::time::Duration;

/// One synthesized audio segment announced by the push stream.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub index: u64,
    pub url: String,
    pub duration: Option<Duration>,
}

/// The virtual continuous timeline formed by concatenating ordered TTS
/// segments. Cumulative position = completed segment durations + position
/// within the playing segment.
#[derive(Debug, Default)]
pub struct VirtualTimeline {
    segments: BTreeMap<u64, AudioSegment>,
}

impl VirtualTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a segment; a repeated index replaces the earlier entry.
    /// Returns true if the index was new.
    pub fn insert(&mut self, segment: AudioSegment) -> bool {
        self.segments.insert(segment.index, segment).is_none()
    }

    pub fn get(&self, index: u64) -> Option<&AudioSegment> {
        self.segments.get(&index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first_index(&self) -> Option<u64> {
        self.segments.keys().next().copied()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    /// Indices in playback order.
    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.segments.keys().copied()
    }

    pub fn total_duration(&self) -> Duration {
        self.segments
            .values()
            .filter_map(|segment| segment.duration)
            .sum()
    }

    /// Sum of durations of segments ordered before `index`.
    pub fn prefix_duration(&self, index: u64) -> Duration {
        self.segments
            .range(..index)
            .filter_map(|(_, segment)| segment.duration)
            .sum()
    }

    /// Map a cumulative time to `(segment index, offset within segment)`.
    /// Times past the end clamp to the end of the last segment.
    pub fn locate(&self, target: Duration) -> Option<(u64, Duration)> {
        let mut elapsed = Duration::ZERO;
        let mut last: Option<(u64, Duration)> = None;

        for segment in self.segments.values() {
            let duration = segment.duration.unwrap_or(Duration::ZERO);
            if target < elapsed + duration {
                return Some((segment.index, target - elapsed));
            }
            elapsed += duration;
            last = Some((segment.index, duration));
        }

        last
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}
