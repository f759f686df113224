// audio/buffer.rs
//
// Mono f32 samples plus their rate. Times are seconds from the start of the
// input file.

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples between two times, clamped to the buffer
    pub fn slice(&self, start: f64, end: f64) -> &[f32] {
        let from = self.sample_index(start);
        let to = self.sample_index(end).max(from);
        &self.samples[from..to]
    }

    fn sample_index(&self, seconds: f64) -> usize {
        let index = (seconds.max(0.0) * self.sample_rate as f64).round() as usize;
        index.min(self.samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_and_slice() {
        let buffer = AudioBuffer::new((0..16000 * 3).map(|i| i as f32).collect(), 16000);
        assert!((buffer.duration_seconds() - 3.0).abs() < 1e-9);

        let window = buffer.slice(1.0, 2.0);
        assert_eq!(window.len(), 16000);
        assert_eq!(window[0], 16000.0);

        // Clamped past the end
        assert_eq!(buffer.slice(2.5, 10.0).len(), 8000);
        assert!(buffer.slice(5.0, 6.0).is_empty());
    }
}
