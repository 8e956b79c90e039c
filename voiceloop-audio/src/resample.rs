use anyhow::Context;
use rubato::Resampler;

// Short filter keeps per-block latency low.
fn sinc_params() -> rubato::SincInterpolationParameters {
    rubato::SincInterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: rubato::WindowFunction::BlackmanHarris2,
    }
}

/// Streaming mono resampler for device audio.
///
/// Input arrives in arbitrary sizes; it is processed in fixed blocks, so up to
/// one block of input may be held back between calls.
pub struct MonoResampler {
    inner: Option<rubato::SincFixedIn<f32>>,
    block: usize,
    pending: Vec<f32>,
}

impl MonoResampler {
    pub fn new(
        input_sample_rate_hz: u32,
        target_sample_rate_hz: u32,
        block: usize,
    ) -> anyhow::Result<Self> {
        let block = block.max(1);
        let inner = if input_sample_rate_hz == target_sample_rate_hz {
            None
        } else {
            log::debug!("resampling {input_sample_rate_hz} Hz -> {target_sample_rate_hz} Hz");
            Some(
                rubato::SincFixedIn::<f32>::new(
                    target_sample_rate_hz as f64 / input_sample_rate_hz as f64,
                    2.0,
                    sinc_params(),
                    block,
                    1,
                )
                .context("create streaming resampler")?,
            )
        };
        Ok(Self {
            inner,
            block,
            pending: Vec::with_capacity(block * 2),
        })
    }

    pub fn push(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);
        let mut out = Vec::new();
        while self.pending.len() >= self.block {
            let block: Vec<f32> = self.pending.drain(..self.block).collect();
            let processed = resampler
                .process(std::slice::from_ref(&block), None)
                .context("resample block")?;
            if let Some(channel) = processed.into_iter().next() {
                out.extend(channel);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn passthrough_streamer_returns_input() {
        let mut r = MonoResampler::new(16_000, 16_000, 512).unwrap();
        assert_eq!(r.push(&[0.1, 0.2]).unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn streamer_holds_partial_blocks() {
        let mut r = MonoResampler::new(48_000, 16_000, 480).unwrap();
        assert!(r.push(&[0.0; 100]).unwrap().is_empty());
        assert!(!r.push(&[0.0; 380]).unwrap().is_empty());
    }

    #[test]
    fn streamer_downsamples_by_rate_ratio() {
        let mut r = MonoResampler::new(48_000, 16_000, 480).unwrap();
        let mut out = Vec::new();
        for _ in 0..20 {
            out.extend(r.push(&vec![0.5f32; 480]).unwrap());
        }
        // 9600 samples at 48 kHz is 200 ms, i.e. 3200 samples at 16 kHz.
        assert!((3180..=3220).contains(&out.len()), "got {}", out.len());
        // Past the filter delay a DC input comes out at the same level.
        for &s in &out[out.len() - 200..] {
            assert_abs_diff_eq!(s, 0.5, epsilon = 0.05);
        }
    }
}
