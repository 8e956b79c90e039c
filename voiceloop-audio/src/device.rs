//
// cpal-backed microphone and speaker.
//
// cpal streams are not `Send` on every host, so each stream lives on its own
// worker thread and talks to the blocking `read`/`write` side over channels.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use voiceloop_engine::traits::{AudioDevices, AudioSink, AudioSource, DeviceError};

use crate::pcm::{downmix_to_mono, f32_to_s16le, s16le_to_f32};
use crate::resample::MonoResampler;

const WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
// Captured chunks kept while nobody reads (e.g. capture paused).
const INPUT_CHUNK_BACKLOG: usize = 64;
// `write` blocks while more than this much audio is queued for the speaker.
const OUTPUT_HIGH_WATER: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

fn unavailable(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Unavailable(e.to_string())
}

/// Picks the device named `wanted`, falling back to the host default.
fn select_device(direction: Direction, wanted: Option<&str>) -> Result<Device, DeviceError> {
    let host = cpal::default_host();

    if let Some(needle) = wanted.map(str::trim).filter(|s| !s.is_empty()) {
        let devices = match direction {
            Direction::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
            Direction::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
        };
        if let Ok(devices) = devices {
            for dev in devices {
                if dev.name().is_ok_and(|name| name == needle) {
                    log::info!("Using {} device: {needle}", direction.label());
                    return Ok(dev);
                }
            }
        }
        log::warn!(
            "Preferred {} device not found, falling back to default: {needle}",
            direction.label()
        );
    }

    let dev = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    dev.ok_or_else(|| unavailable(format!("no {} device found", direction.label())))
}

pub fn list_device_names(input: bool) -> Result<Vec<String>, DeviceError> {
    let host = cpal::default_host();
    let devices: Vec<Device> = if input {
        host.input_devices().map_err(unavailable)?.collect()
    } else {
        host.output_devices().map_err(unavailable)?.collect()
    };
    let mut out: Vec<String> = devices.iter().filter_map(|d| d.name().ok()).collect();
    out.sort();
    out.dedup();
    Ok(out)
}

/// Owns the thread a stream lives on. Dropping it stops the stream.
struct StreamWorker {
    shutdown: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Builds the stream on a fresh thread and waits until it plays.
    fn spawn<F>(build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();

        let handle = std::thread::spawn(move || {
            let stream = match build() {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(format!("play stream: {e}")));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Park until closed (or the owner is dropped).
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(WORKER_STARTUP_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                shutdown,
                handle: Some(handle),
            }),
            Ok(Err(e)) => Err(DeviceError::Unavailable(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(unavailable("audio worker startup timed out"))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(unavailable("audio worker exited during startup"))
            }
        }
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

type StreamFailure = Arc<Mutex<Option<String>>>;

fn record_failure(slot: &StreamFailure, err: impl std::fmt::Display) {
    log::error!("Audio stream error: {err}");
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.is_none() {
        *guard = Some(err.to_string());
    }
}

fn take_failure(slot: &StreamFailure) -> Option<String> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Microphone producing mono s16le frames at the session send rate.
pub struct CpalInput {
    chunks: mpsc::Receiver<Vec<f32>>,
    resampler: MonoResampler,
    pending: VecDeque<f32>,
    failure: StreamFailure,
    worker: Option<StreamWorker>,
}

impl CpalInput {
    pub fn open(device_name: Option<&str>, target_rate_hz: u32) -> Result<Self, DeviceError> {
        let device = select_device(Direction::Input, device_name)?;
        let default_cfg = device.default_input_config().map_err(unavailable)?;
        let device_rate_hz = default_cfg.sample_rate().0;
        let channels = default_cfg.channels() as usize;
        let sample_format = default_cfg.sample_format();
        let config: StreamConfig = default_cfg.into();

        let (tx, chunks) = mpsc::sync_channel::<Vec<f32>>(INPUT_CHUNK_BACKLOG);
        let failure: StreamFailure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);

        let worker = StreamWorker::spawn(move || {
            let stream = match sample_format {
                SampleFormat::I16 => build_input::<i16>(&device, &config, channels, tx, worker_failure),
                SampleFormat::U16 => build_input::<u16>(&device, &config, channels, tx, worker_failure),
                SampleFormat::I32 => build_input::<i32>(&device, &config, channels, tx, worker_failure),
                SampleFormat::F64 => build_input::<f64>(&device, &config, channels, tx, worker_failure),
                _ => build_input::<f32>(&device, &config, channels, tx, worker_failure),
            };
            stream.map_err(|e| format!("build input stream: {e}"))
        })?;

        let resampler = MonoResampler::new(device_rate_hz, target_rate_hz, device_rate_hz as usize / 100)
            .map_err(|e| unavailable(format!("{e:#}")))?;
        log::info!("Microphone open ({device_rate_hz} Hz, {channels} ch)");

        Ok(Self {
            chunks,
            resampler,
            pending: VecDeque::new(),
            failure,
            worker: Some(worker),
        })
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    tx: mpsc::SyncSender<Vec<f32>>,
    failure: StreamFailure,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
            // Drop audio rather than block the callback when nobody reads.
            let _ = tx.try_send(downmix_to_mono(&scratch, channels));
        },
        move |err| record_failure(&failure, err),
        None,
    )
}

impl AudioSource for CpalInput {
    fn read(&mut self, frame_samples: usize) -> Result<Vec<u8>, DeviceError> {
        while self.pending.len() < frame_samples {
            if let Some(err) = take_failure(&self.failure) {
                return Err(DeviceError::Io(err));
            }
            let chunk = self.chunks.recv_timeout(READ_TIMEOUT).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => DeviceError::Io("no audio from microphone".into()),
                mpsc::RecvTimeoutError::Disconnected => {
                    DeviceError::Io("microphone stream stopped".into())
                }
            })?;
            let resampled = self
                .resampler
                .push(&chunk)
                .map_err(|e| DeviceError::Io(format!("{e:#}")))?;
            self.pending.extend(resampled);
        }

        let frame: Vec<f32> = self.pending.drain(..frame_samples).collect();
        Ok(f32_to_s16le(&frame))
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            log::info!("Microphone closed");
        }
    }
}

/// Speaker playing mono s16le audio at the session receive rate.
pub struct CpalOutput {
    queue: Arc<Mutex<VecDeque<f32>>>,
    resampler: MonoResampler,
    high_water: usize,
    failure: StreamFailure,
    worker: Option<StreamWorker>,
}

impl CpalOutput {
    pub fn open(device_name: Option<&str>, source_rate_hz: u32) -> Result<Self, DeviceError> {
        let device = select_device(Direction::Output, device_name)?;
        let default_cfg = device.default_output_config().map_err(unavailable)?;
        let device_rate_hz = default_cfg.sample_rate().0;
        let channels = default_cfg.channels() as usize;
        let sample_format = default_cfg.sample_format();
        let config: StreamConfig = default_cfg.into();

        let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let failure: StreamFailure = Arc::new(Mutex::new(None));
        let worker_queue = Arc::clone(&queue);
        let worker_failure = Arc::clone(&failure);

        let worker = StreamWorker::spawn(move || {
            let stream = match sample_format {
                SampleFormat::I16 => build_output::<i16>(&device, &config, channels, worker_queue, worker_failure),
                SampleFormat::U16 => build_output::<u16>(&device, &config, channels, worker_queue, worker_failure),
                SampleFormat::I32 => build_output::<i32>(&device, &config, channels, worker_queue, worker_failure),
                SampleFormat::F64 => build_output::<f64>(&device, &config, channels, worker_queue, worker_failure),
                _ => build_output::<f32>(&device, &config, channels, worker_queue, worker_failure),
            };
            stream.map_err(|e| format!("build output stream: {e}"))
        })?;

        let resampler = MonoResampler::new(source_rate_hz, device_rate_hz, source_rate_hz as usize / 100)
            .map_err(|e| unavailable(format!("{e:#}")))?;
        let high_water = (device_rate_hz as u128 * OUTPUT_HIGH_WATER.as_millis() / 1000) as usize;
        log::info!("Speaker open ({device_rate_hz} Hz, {channels} ch)");

        Ok(Self {
            queue,
            resampler,
            high_water,
            failure,
            worker: Some(worker),
        })
    }

    fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    queue: Arc<Mutex<VecDeque<f32>>>,
    failure: StreamFailure,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = channels.max(1);
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            for frame in data.chunks_mut(channels) {
                let s = queue.pop_front().unwrap_or(0.0);
                for out in frame.iter_mut() {
                    *out = T::from_sample(s);
                }
            }
        },
        move |err| record_failure(&failure, err),
        None,
    )
}

impl AudioSink for CpalOutput {
    fn write(&mut self, pcm_s16le: &[u8]) -> Result<(), DeviceError> {
        if let Some(err) = take_failure(&self.failure) {
            return Err(DeviceError::Io(err));
        }

        let samples = self
            .resampler
            .push(&s16le_to_f32(pcm_s16le))
            .map_err(|e| DeviceError::Io(format!("{e:#}")))?;
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(samples);

        // Block like a hardware write would, so the caller paces playback.
        while self.queued() > self.high_water {
            if self.worker.is_none() {
                return Err(DeviceError::Io("speaker closed".into()));
            }
            if let Some(err) = take_failure(&self.failure) {
                return Err(DeviceError::Io(err));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            log::info!("Speaker closed");
        }
    }
}

/// Opens the configured (or default) host devices for each session.
#[derive(Debug, Clone, Default)]
pub struct CpalDevices {
    pub input_name: Option<String>,
    pub output_name: Option<String>,
    pub send_rate_hz: u32,
    pub receive_rate_hz: u32,
}

impl AudioDevices for CpalDevices {
    fn open_input(&self) -> Result<Box<dyn AudioSource>, DeviceError> {
        Ok(Box::new(CpalInput::open(
            self.input_name.as_deref(),
            self.send_rate_hz,
        )?))
    }

    fn open_output(&self) -> Result<Box<dyn AudioSink>, DeviceError> {
        Ok(Box::new(CpalOutput::open(
            self.output_name.as_deref(),
            self.receive_rate_hz,
        )?))
    }
}
