//! FFT analyser primitive
//!
//! Passes audio through unchanged while keeping the most recent `fft_size`
//! samples. Snapshots come in the four shapes renderers ask for: waveform or
//! spectrum, as floats or as bytes.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::PatchError;

pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32768;
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Captures audio and produces time/frequency domain snapshots.
pub struct Analyser {
    fft_size: usize,
    /// Circular capture of the last `fft_size` samples
    capture: Vec<f32>,
    write_pos: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    /// Smoothed magnitudes carried between frequency snapshots
    smoothed: Vec<f32>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl Analyser {
    pub fn new(fft_size: usize) -> Result<Self, PatchError> {
        check_size(fft_size)?;
        let mut planner = FftPlanner::new();
        Ok(Self {
            fft_size,
            capture: vec![0.0; fft_size],
            write_pos: 0,
            fft: planner.plan_fft_forward(fft_size),
            window: blackman(fft_size),
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            smoothed: vec![0.0; fft_size / 2],
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        })
    }

    #[inline]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    #[inline]
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Change the FFT size, discarding captured audio.
    pub fn set_fft_size(&mut self, fft_size: usize) -> Result<(), PatchError> {
        if fft_size == self.fft_size {
            return Ok(());
        }
        *self = Self {
            smoothing: self.smoothing,
            min_db: self.min_db,
            max_db: self.max_db,
            ..Self::new(fft_size)?
        };
        Ok(())
    }

    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 1.0);
    }

    /// Append samples to the capture ring.
    pub fn capture(&mut self, samples: &[f32]) {
        for &s in samples {
            self.capture[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// Most recent samples, oldest first. Fills at most `fft_size` values.
    pub fn float_time_domain(&self, out: &mut [f32]) {
        let n = out.len().min(self.fft_size);
        let start = (self.write_pos + self.fft_size - n) % self.fft_size;
        for (i, o) in out.iter_mut().take(n).enumerate() {
            *o = self.capture[(start + i) % self.fft_size];
        }
    }

    /// Waveform as unsigned bytes, 128 being silence.
    pub fn byte_time_domain(&self, out: &mut [u8]) {
        let n = out.len().min(self.fft_size);
        let start = (self.write_pos + self.fft_size - n) % self.fft_size;
        for (i, o) in out.iter_mut().take(n).enumerate() {
            let s = self.capture[(start + i) % self.fft_size];
            *o = (128.0 * (1.0 + s)).clamp(0.0, 255.0) as u8;
        }
    }

    /// Smoothed spectrum in decibels, one value per bin.
    pub fn float_frequency(&mut self, out: &mut [f32]) {
        self.analyse();
        for (o, &mag) in out.iter_mut().zip(&self.smoothed) {
            *o = 20.0 * mag.max(1e-10).log10();
        }
    }

    /// Spectrum scaled into bytes between `min_db` and `max_db`.
    pub fn byte_frequency(&mut self, out: &mut [u8]) {
        self.analyse();
        let range = self.max_db - self.min_db;
        for (o, &mag) in out.iter_mut().zip(&self.smoothed) {
            let db = 20.0 * mag.max(1e-10).log10();
            let scaled = 255.0 * (db - self.min_db) / range;
            *o = scaled.clamp(0.0, 255.0) as u8;
        }
    }

    fn analyse(&mut self) {
        let n = self.fft_size;
        for i in 0..n {
            let s = self.capture[(self.write_pos + i) % n];
            self.scratch[i] = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let scale = 1.0 / n as f32;
        let tau = self.smoothing;
        for (smoothed, c) in self.smoothed.iter_mut().zip(&self.scratch) {
            let mag = c.norm() * scale;
            *smoothed = tau * *smoothed + (1.0 - tau) * mag;
        }
    }
}

fn check_size(fft_size: usize) -> Result<(), PatchError> {
    if fft_size.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
        Ok(())
    } else {
        Err(PatchError::InvalidParamValue {
            param: "fftSize",
            value: fft_size as f32,
            reason: "must be a power of two between 32 and 32768",
        })
    }
}

fn blackman(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let x = 2.0 * PI * i as f32 / n as f32;
            0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
        })
        .collect()
}
