//! Output device playback through cpal
//!
//! The destination node pushes interleaved samples into an `rtrb` ring; the
//! cpal stream drains it on the device thread. The stream is built and kept
//! alive on its own thread since cpal streams are not `Send` everywhere.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no default output device")]
    NoDevice,
    #[error("failed to query device config: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("unsupported sample format {0:?}")]
    Format(SampleFormat),
    #[error("stream thread exited before the stream started")]
    Thread,
}

/// A running output stream fed from a sample ring.
pub struct CpalOutput {
    sample_rate: u32,
    channels: usize,
    samples_consumed: Arc<AtomicUsize>,
    underruns: Arc<AtomicU64>,
}

impl CpalOutput {
    /// Open the default output device. Returns the stream handle and the
    /// producer end that the graph's destination should write into.
    pub fn open_default() -> Result<(Self, Producer<f32>), DeviceError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(DeviceError::NoDevice)?;
        let config = device.default_output_config()?;
        let sample_format = config.sample_format();
        let stream_config: StreamConfig = config.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        // ~100ms of audio to ride out scheduling jitter
        let buffer_samples = ((sample_rate as f32 * 0.1) as usize) * channels;
        let (producer, consumer) = RingBuffer::<f32>::new(buffer_samples.next_power_of_two().max(8192));

        let samples_consumed = Arc::new(AtomicUsize::new(0));
        let underruns = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let consumed = samples_consumed.clone();
        let missed = underruns.clone();
        std::thread::Builder::new()
            .name("patchbay-output".into())
            .spawn(move || {
                let stream = build_stream(&device, sample_format, &stream_config, consumer, consumed, missed)
                    .and_then(|stream| stream.play().map(|_| stream).map_err(DeviceError::from));
                match stream {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // The stream lives as long as this thread
                        loop {
                            std::thread::park();
                        }
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })
            .map_err(|_| DeviceError::Thread)?;

        ready_rx.recv().map_err(|_| DeviceError::Thread)??;
        tracing::info!(sample_rate, channels, "output device started");

        Ok((
            Self {
                sample_rate,
                channels,
                samples_consumed,
                underruns,
            },
            producer,
        ))
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples the device has played so far.
    #[inline]
    pub fn samples_consumed(&self) -> usize {
        self.samples_consumed.load(Ordering::Relaxed)
    }

    /// Device callbacks that found the ring short of samples.
    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &StreamConfig,
    mut consumer: Consumer<f32>,
    samples_consumed: Arc<AtomicUsize>,
    underruns: Arc<AtomicU64>,
) -> Result<cpal::Stream, DeviceError> {
    let on_error = |err: cpal::StreamError| tracing::error!(%err, "output stream error");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            stream_config,
            move |data: &mut [f32], _| {
                drain(&mut consumer, data, &samples_consumed, &underruns, |s| s)
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_output_stream(
            stream_config,
            move |data: &mut [i16], _| {
                drain(&mut consumer, data, &samples_consumed, &underruns, |s| {
                    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                })
            },
            on_error,
            None,
        )?,
        SampleFormat::U16 => device.build_output_stream(
            stream_config,
            move |data: &mut [u16], _| {
                drain(&mut consumer, data, &samples_consumed, &underruns, |s| {
                    ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16
                })
            },
            on_error,
            None,
        )?,
        other => return Err(DeviceError::Format(other)),
    };
    Ok(stream)
}

#[inline]
fn drain<T>(
    consumer: &mut Consumer<f32>,
    data: &mut [T],
    samples_consumed: &AtomicUsize,
    underruns: &AtomicU64,
    convert: impl Fn(f32) -> T,
) {
    let mut underrun = false;
    for sample in data.iter_mut() {
        *sample = convert(consumer.pop().unwrap_or_else(|_| {
            underrun = true;
            0.0
        }));
    }
    if underrun {
        underruns.fetch_add(1, Ordering::Relaxed);
    }
    samples_consumed.fetch_add(data.len(), Ordering::Relaxed);
}
