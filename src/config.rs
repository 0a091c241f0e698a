use std::time::Duration;

/// Platform-conditional behavior for the media-session bridge and the
/// continue-conversation flow. Passed once at construction; callers never
/// sniff the platform themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCaps {
    /// OS media controls only work while something is audibly "playing"
    /// (iOS Safari). Requires the silent keepalive during recording.
    pub needs_silent_audio_for_media_session: bool,
    /// Playing audio while a capture stream is open can crash the Bluetooth
    /// stack. The silent keepalive must stop before the mic is re-acquired.
    pub avoid_concurrent_playback_during_capture: bool,
    /// Settle time for A2DP/HFP profile switching before restarting capture.
    pub profile_switch_delay: Duration,
}

impl PlatformCaps {
    /// Desktop: media controls are surfaced by the real audio output, no
    /// keepalive, no profile-switch settling.
    pub fn desktop() -> Self {
        Self {
            needs_silent_audio_for_media_session: false,
            avoid_concurrent_playback_during_capture: false,
            profile_switch_delay: Duration::ZERO,
        }
    }

    /// Mobile with OS-gated media sessions and Bluetooth profile switching.
    pub fn mobile() -> Self {
        Self {
            needs_silent_audio_for_media_session: true,
            avoid_concurrent_playback_during_capture: true,
            profile_switch_delay: Duration::from_millis(300),
        }
    }
}

impl Default for PlatformCaps {
    fn default() -> Self {
        Self::desktop()
    }
}

/// Configuration shared by every pipeline component.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Backend base URL, no trailing slash.
    pub base_url: String,
    /// Optional bearer token added to every request and push subscription.
    pub auth_token: Option<String>,

    /// Recorder timeslice between chunk emissions.
    pub chunk_interval: Duration,

    /// Per-chunk upload timeout.
    pub upload_timeout: Duration,
    /// Upload attempts per chunk (first try + retries).
    pub upload_max_attempts: u32,
    /// Base delay for exponential upload backoff (1s, 2s, 4s...).
    pub upload_backoff_base: Duration,

    /// Push stream reconnect delay after a channel close.
    pub reconnect_delay: Duration,
    /// Server heartbeat cadence; the stale watchdog fires at 3x this.
    pub heartbeat_interval: Duration,

    /// LLM status poll cadence.
    pub poll_interval: Duration,
    /// Per-poll-request timeout.
    pub poll_request_timeout: Duration,
    /// Hard cap on total polling lifetime.
    pub poll_max_duration: Duration,

    /// Wait after the final chunk upload before finalize.
    pub settle_delay: Duration,
    /// Force the playback phase if no TTS chunk arrives within this window.
    pub first_chunk_timeout: Duration,
    /// Gap inserted between TTS segments to avoid audible seams.
    pub inter_segment_gap: Duration,
    /// Transient session error flag lifetime.
    pub error_flag_duration: Duration,

    pub platform: PlatformCaps,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            auth_token: None,
            chunk_interval: Duration::from_secs(10),
            upload_timeout: Duration::from_secs(120),
            upload_max_attempts: 3,
            upload_backoff_base: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            poll_interval: Duration::from_millis(1500),
            poll_request_timeout: Duration::from_secs(10),
            poll_max_duration: Duration::from_secs(30 * 60),
            settle_delay: Duration::from_millis(500),
            first_chunk_timeout: Duration::from_secs(15),
            inter_segment_gap: Duration::from_millis(50),
            error_flag_duration: Duration::from_secs(3),
            platform: PlatformCaps::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration for the given backend, applying
    /// `VELLUM_BASE_URL` / `VELLUM_AUTH_TOKEN` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("VELLUM_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(token) = std::env::var("VELLUM_AUTH_TOKEN") {
            if !token.trim().is_empty() {
                config.auth_token = Some(token);
            }
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let url: String = base_url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn with_platform(mut self, platform: PlatformCaps) -> Self {
        self.platform = platform;
        self
    }

    /// Watchdog threshold: no event for this long forces a reconnect.
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = PipelineConfig::default();
        assert_eq!(config.chunk_interval, Duration::from_secs(10));
        assert_eq!(config.upload_max_attempts, 3);
        assert_eq!(config.poll_max_duration, Duration::from_secs(1800));
        assert_eq!(config.stale_threshold(), Duration::from_secs(45));
    }

    #[test]
    fn test_builder_trims_trailing_slash() {
        let config = PipelineConfig::default().with_base_url("https://api.example.com/");
        assert_eq!(config.base_url, "https://api.example.com");
    }

    #[test]
    fn test_platform_caps() {
        let desktop = PlatformCaps::desktop();
        assert!(!desktop.needs_silent_audio_for_media_session);
        assert_eq!(desktop.profile_switch_delay, Duration::ZERO);

        let mobile = PlatformCaps::mobile();
        assert!(mobile.avoid_concurrent_playback_during_capture);
        assert_eq!(mobile.profile_switch_delay, Duration::from_millis(300));
    }
}
