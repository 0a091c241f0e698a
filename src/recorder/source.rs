use crate::error::{VellumError, VellumResult};
use crate::recorder::webm::WebmWriter;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Device;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

/// An input device available for recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Enumerate input devices for microphone selection.
pub fn list_input_devices() -> VellumResult<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device();
    let input_devices = host
        .input_devices()
        .map_err(|e| VellumError::DeviceUnavailable(e.to_string()))?;

    for (idx, device) in input_devices.enumerate() {
        if let Ok(name) = device.name() {
            let is_default = default_input
                .as_ref()
                .and_then(|d| d.name().ok())
                .map(|d| d == name)
                .unwrap_or(false);

            devices.push(AudioDevice {
                id: format!("input_{}", idx),
                name,
                is_default,
            });
        }
    }

    Ok(devices)
}

fn device_by_id(device_id: &str) -> VellumResult<Device> {
    let host = cpal::default_host();
    let idx: usize = device_id
        .strip_prefix("input_")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VellumError::DeviceUnavailable(format!("Invalid device id: {}", device_id)))?;

    host.input_devices()
        .map_err(|e| VellumError::DeviceUnavailable(e.to_string()))?
        .nth(idx)
        .ok_or_else(|| VellumError::DeviceUnavailable(format!("Device not found: {}", device_id)))
}

/// A continuous producer of container-encoded media bytes. The platform
/// recorder handle of the pipeline: the chunked recorder slices whatever
/// this emits, it never inspects codec internals beyond the init-segment
/// boundary.
#[async_trait]
pub trait MediaSource: Send {
    /// Begin capture. Encoded bytes flow on the returned channel; the
    /// channel closing is the terminal delivery after [`stop`](Self::stop).
    async fn start(&mut self) -> VellumResult<mpsc::Receiver<Vec<u8>>>;

    /// Suspend byte production without releasing the device.
    fn pause(&mut self);

    fn resume(&mut self);

    /// Stop capture and release the device. Remaining buffered audio is
    /// delivered before the byte channel closes.
    async fn stop(&mut self);

    fn mime_type(&self) -> &str;
}

/// Cluster granularity for the mic muxer. Emitted buffers always start on a
/// cluster boundary so timeslice cuts stay self-decodable.
const CLUSTER_DURATION_MS: u32 = 100;

enum SourceCommand {
    Stop,
}

/// Microphone capture on a dedicated thread (cpal streams are not Send on
/// macOS), muxed to WebM/PCM before leaving the thread.
pub struct CpalMicSource {
    device_id: Option<String>,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    command_tx: Option<std_mpsc::Sender<SourceCommand>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CpalMicSource {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            paused: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            command_tx: None,
            thread_handle: None,
        }
    }

    fn acquire_device(&self) -> VellumResult<Device> {
        match &self.device_id {
            Some(id) => device_by_id(id),
            None => cpal::default_host().default_input_device().ok_or_else(|| {
                VellumError::DeviceUnavailable("No default input device".to_string())
            }),
        }
    }
}

#[async_trait]
impl MediaSource for CpalMicSource {
    async fn start(&mut self) -> VellumResult<mpsc::Receiver<Vec<u8>>> {
        let device = self.acquire_device()?;
        let config = device
            .default_input_config()
            .map_err(|e| VellumError::DeviceUnavailable(format!("No input config: {}", e)))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        tracing::info!(
            sample_rate,
            channels,
            format = ?config.sample_format(),
            "Microphone acquired"
        );

        let (byte_tx, byte_rx) = mpsc::channel::<Vec<u8>>(32);
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<SourceCommand>();

        self.paused.store(false, Ordering::Release);
        self.stop_flag.store(false, Ordering::Release);
        let paused = self.paused.clone();
        let stop_flag = self.stop_flag.clone();
        let stream_config: cpal::StreamConfig = config.into();

        let thread_handle = thread::spawn(move || {
            let mut muxer = WebmWriter::new(sample_rate, 1);
            if byte_tx.blocking_send(muxer.init_segment()).is_err() {
                tracing::warn!("Byte receiver dropped before capture started");
                return;
            }

            let pending: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));
            let pending_for_callback = pending.clone();
            let stop_for_callback = stop_flag.clone();
            let paused_for_callback = paused.clone();

            let last_level_log = Arc::new(Mutex::new(std::time::Instant::now()));
            let level_log_for_callback = last_level_log.clone();

            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if stop_for_callback.load(Ordering::Acquire)
                        || paused_for_callback.load(Ordering::Acquire)
                    {
                        return;
                    }

                    // Average channels to mono
                    let mono: Vec<f32> = if channels == 1 {
                        data.to_vec()
                    } else {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    };

                    // Warn periodically about silent input
                    let rms = if mono.is_empty() {
                        0.0
                    } else {
                        (mono.iter().map(|&s| s * s).sum::<f32>() / mono.len() as f32).sqrt()
                    };
                    if let Ok(mut last_log) = level_log_for_callback.lock() {
                        if last_log.elapsed().as_secs() >= 15 {
                            if rms < 0.001 {
                                tracing::warn!(
                                    "Audio input silent. Check microphone selection/mute/volume"
                                );
                            } else {
                                tracing::debug!(db = 20.0 * rms.log10(), "Audio level");
                            }
                            *last_log = std::time::Instant::now();
                        }
                    }

                    let mut buf = match pending_for_callback.lock() {
                        Ok(buf) => buf,
                        Err(_) => return,
                    };
                    buf.extend(
                        mono.iter()
                            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16),
                    );
                },
                move |err| {
                    tracing::error!("Audio stream error: {}", err);
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to build input stream: {}", e);
                    return;
                }
            };
            if let Err(e) = stream.play() {
                tracing::error!("Failed to start input stream: {}", e);
                return;
            }

            let cluster_samples = (sample_rate * CLUSTER_DURATION_MS / 1000) as usize;
            loop {
                let stop = match cmd_rx.recv_timeout(std::time::Duration::from_millis(50)) {
                    Ok(SourceCommand::Stop) => true,
                    Err(std_mpsc::RecvTimeoutError::Timeout) => false,
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => true,
                };

                // Mux whole clusters off the callback buffer
                loop {
                    let samples = {
                        let mut buf = match pending.lock() {
                            Ok(buf) => buf,
                            Err(_) => break,
                        };
                        if buf.len() < cluster_samples {
                            break;
                        }
                        buf.drain(..cluster_samples).collect::<Vec<i16>>()
                    };
                    if byte_tx.blocking_send(muxer.cluster(&samples)).is_err() {
                        tracing::debug!("Byte receiver closed (normal during teardown)");
                        return;
                    }
                }

                if stop {
                    break;
                }
            }

            // Terminal delivery: whatever is left becomes the last cluster
            drop(stream);
            let remainder = pending.lock().map(|mut b| b.split_off(0)).unwrap_or_default();
            if !remainder.is_empty() {
                let _ = byte_tx.blocking_send(muxer.cluster(&remainder));
            }
            tracing::info!("Microphone capture thread shut down");
        });

        self.command_tx = Some(cmd_tx);
        self.thread_handle = Some(thread_handle);
        Ok(byte_rx)
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Release);
    }

    async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(cmd_tx) = self.command_tx.take() {
            let _ = cmd_tx.send(SourceCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    fn mime_type(&self) -> &str {
        "audio/webm"
    }
}
