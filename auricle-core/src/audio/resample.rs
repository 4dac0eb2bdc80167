//! Sample-rate adaptation between the capture device and the pipeline.
//!
//! Input devices negotiate their own rate (44.1 or 48 kHz on most hardware)
//! while the classifier and the speech backend are locked to the configured
//! pipeline rate. `RateAdapter` sits between the two on the capture-loop
//! thread and appends converted samples into a caller-owned buffer, so the
//! frame cutter never has to copy them a second time.
//!
//! rubato's `FastFixedIn` consumes fixed-size input blocks. Incoming slices
//! rarely align with the block size, so a small carry buffer holds the
//! partial tail between calls; whole blocks are fed straight from the input
//! slice without staging. When the two rates already match the adapter is a
//! plain append.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{info, warn};

use crate::error::{AuricleError, Result};

pub struct RateAdapter {
    mode: Mode,
}

enum Mode {
    /// Capture rate equals the pipeline rate; samples pass through.
    Unity,
    Convert {
        inner: FastFixedIn<f32>,
        /// Input samples consumed per resampler call.
        block: usize,
        /// Partial block carried over to the next `feed`.
        carry: Vec<f32>,
    },
}

impl RateAdapter {
    /// # Errors
    /// Returns `AuricleError::AudioDevice` when rubato rejects the rate pair.
    pub fn new(capture_rate: u32, pipeline_rate: u32, block: usize) -> Result<Self> {
        if capture_rate == pipeline_rate {
            return Ok(Self { mode: Mode::Unity });
        }

        let inner = FastFixedIn::<f32>::new(
            f64::from(pipeline_rate) / f64::from(capture_rate),
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| {
            AuricleError::AudioDevice(format!(
                "cannot convert {capture_rate} Hz to {pipeline_rate} Hz: {e}"
            ))
        })?;

        info!(capture_rate, pipeline_rate, block, "sample-rate conversion active");

        Ok(Self {
            mode: Mode::Convert {
                inner,
                block,
                carry: Vec::with_capacity(block),
            },
        })
    }

    /// True when no conversion happens.
    pub fn is_unity(&self) -> bool {
        matches!(self.mode, Mode::Unity)
    }

    /// Convert `samples` and append the result to `out`. Input that does not
    /// fill a whole resampler block is held until the next call, so `out`
    /// may receive nothing for short pushes.
    pub fn feed(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Mode::Convert { inner, block, carry } = &mut self.mode else {
            out.extend_from_slice(samples);
            return;
        };
        let block = *block;
        let mut rest = samples;

        // Finish a previously started block first.
        if !carry.is_empty() {
            let take = (block - carry.len()).min(rest.len());
            carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if carry.len() < block {
                return;
            }
            run_block(inner, carry, out);
            carry.clear();
        }

        // Whole blocks go straight from the input slice.
        let whole = rest.len() - rest.len() % block;
        for exact in rest[..whole].chunks_exact(block) {
            run_block(inner, exact, out);
        }

        carry.extend_from_slice(&rest[whole..]);
    }
}

fn run_block(inner: &mut FastFixedIn<f32>, block: &[f32], out: &mut Vec<f32>) {
    match inner.process(&[block], None) {
        Ok(mut channels) => {
            if let Some(mono) = channels.pop() {
                out.extend_from_slice(&mono);
            }
        }
        Err(e) => warn!("dropping resampler block: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_appends_input_untouched() {
        let mut adapter = RateAdapter::new(16_000, 16_000, 960).unwrap();
        assert!(adapter.is_unity());

        let mut out = vec![7.0f32];
        adapter.feed(&[0.25, -0.25], &mut out);
        adapter.feed(&[0.5], &mut out);
        // Appended after existing content, both pushes in order.
        assert_eq!(out, vec![7.0, 0.25, -0.25, 0.5]);
    }

    #[test]
    fn downsampling_yields_one_third_of_the_input() {
        let mut adapter = RateAdapter::new(48_000, 16_000, 960).unwrap();
        assert!(!adapter.is_unity());

        let mut out = Vec::new();
        for _ in 0..10 {
            adapter.feed(&vec![0.0f32; 960], &mut out);
        }

        // 9600 samples at 48 kHz cover 200 ms, i.e. ~3200 at 16 kHz. The
        // polynomial filter is allowed a little settle-in slack.
        let expected = 3_200isize;
        let got = out.len() as isize;
        assert!(
            (got - expected).abs() <= 64,
            "expected ≈{expected} samples, got {got}"
        );
    }

    #[test]
    fn short_pushes_carry_until_a_block_fills() {
        let mut adapter = RateAdapter::new(48_000, 16_000, 960).unwrap();

        let mut out = Vec::new();
        adapter.feed(&vec![0.0f32; 400], &mut out);
        assert!(out.is_empty(), "400 carried samples are below one block");
        adapter.feed(&vec![0.0f32; 400], &mut out);
        assert!(out.is_empty(), "800 carried samples still below one block");

        // 1000 total: one block processed, 40 samples carried again.
        adapter.feed(&vec![0.0f32; 200], &mut out);
        assert!(!out.is_empty(), "a full block must produce output");
    }

    #[test]
    fn non_integer_ratio_stays_proportional() {
        let mut adapter = RateAdapter::new(44_100, 16_000, 960).unwrap();

        let mut out = Vec::new();
        let pushed = 44_100; // one second of capture
        let mut remaining = pushed;
        while remaining > 0 {
            let n = remaining.min(960);
            adapter.feed(&vec![0.0f32; n], &mut out);
            remaining -= n;
        }

        // One second in should be about one second out at the pipeline rate.
        let got = out.len() as f64;
        assert!(
            (got - 16_000.0).abs() / 16_000.0 < 0.05,
            "expected ≈16000 samples, got {got}"
        );
    }
}
