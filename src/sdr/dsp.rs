use num_complex::Complex;
use std::f32::consts::PI;

/// One raw I/Q sample as delivered by the dongle: two unsigned bytes
/// centered on 127.5.
#[repr(C)]
pub struct Iq {
    pub i: u8,
    pub q: u8,
}

impl Iq {
    pub fn to_complex(&self) -> Complex<f32> {
        Complex::new(
            (self.i as f32 - 127.5) / 127.5,
            (self.q as f32 - 127.5) / 127.5,
        )
    }
}

impl From<&[u8; 2]> for Iq {
    fn from(item: &[u8; 2]) -> Self {
        Iq {
            i: item[0],
            q: item[1],
        }
    }
}

/// Quadrature FM discriminator.
///
/// Output is the phase advance between consecutive samples in radians,
/// which is proportional to instantaneous frequency. A constant offset in
/// the output is a carrier frequency error; `to_hz` converts it.
pub struct Discriminator {
    prev: Complex<f32>,
    sample_rate: f32,
}

impl Discriminator {
    pub fn new(sample_rate: u32) -> Discriminator {
        Discriminator {
            prev: Complex::new(1.0, 0.0),
            sample_rate: sample_rate as f32,
        }
    }

    pub fn demod(&mut self, sample: Complex<f32>) -> f32 {
        let d = sample * self.prev.conj();
        self.prev = sample;
        d.im.atan2(d.re)
    }

    /// Radians-per-sample to Hz.
    pub fn to_hz(&self, rad_per_sample: f32) -> f32 {
        rad_per_sample * self.sample_rate / (2.0 * PI)
    }
}

/// Single-pole DC blocker.
///
/// Tracks a slow running average of the input and subtracts it. For an FM
/// discriminator feeding an FSK slicer the tracked average is exactly the
/// carrier frequency error, so the blocker doubles as the tuning-error
/// estimator.
pub struct DcBlocker {
    avg: f32,
    alpha: f32,
}

impl DcBlocker {
    pub fn new(alpha: f32) -> DcBlocker {
        DcBlocker { avg: 0.0, alpha }
    }

    pub fn filter(&mut self, input: f32) -> f32 {
        self.avg += self.alpha * (input - self.avg);
        input - self.avg
    }

    /// The DC offset currently being removed.
    pub fn offset(&self) -> f32 {
        self.avg
    }

    pub fn reset(&mut self) {
        self.avg = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq_hz: f32, sample_rate: f32, n: usize) -> Vec<Complex<f32>> {
        (0..n)
            .map(|i| Complex::from_polar(1.0, 2.0 * PI * freq_hz * i as f32 / sample_rate))
            .collect()
    }

    #[test]
    fn discriminator_measures_tone_offset() {
        let fs = 268_800.0;
        let mut disc = Discriminator::new(fs as u32);
        let samples = tone(4_000.0, fs, 512);
        let out: Vec<f32> = samples.iter().map(|&s| disc.demod(s)).collect();
        // skip the first output; prev is seeded at 1+0j
        let mean = out[1..].iter().sum::<f32>() / (out.len() - 1) as f32;
        let hz = disc.to_hz(mean);
        assert!((hz - 4_000.0).abs() < 10.0, "estimated {} Hz", hz);
    }

    #[test]
    fn discriminator_sign_follows_offset() {
        let fs = 268_800.0;
        let mut disc = Discriminator::new(fs as u32);
        let sum: f32 = tone(-9_600.0, fs, 256).iter().map(|&s| disc.demod(s)).sum();
        assert!(sum < 0.0);
    }

    #[test]
    fn dc_blocker_removes_offset() {
        let mut dc = DcBlocker::new(0.05);
        let mut out = 0.0;
        for i in 0..2048 {
            let square = if i % 2 == 0 { 1.0 } else { -1.0 };
            out = dc.filter(3.0 + square);
        }
        assert!((dc.offset() - 3.0).abs() < 0.1, "offset {}", dc.offset());
        assert!(out.abs() < 2.0);
    }

    #[test]
    fn iq_midscale_is_zero() {
        let s = Iq { i: 128, q: 127 };
        let c = s.to_complex();
        assert!(c.norm() < 0.01);
    }
}
