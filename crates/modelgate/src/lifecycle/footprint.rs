/// Memory a model needs once loaded: file size scaled by `factor` plus a
/// fixed overhead for context buffers and the engine itself.
#[derive(Debug, Clone, Copy)]
pub struct FootprintEstimator {
    pub factor: f64,
    pub overhead_bytes: u64,
}

impl FootprintEstimator {
    pub fn new(factor: f64, overhead_mb: u64) -> Self {
        Self {
            factor: factor.max(1.0),
            overhead_bytes: overhead_mb * 1024 * 1024,
        }
    }

    pub fn estimate(&self, file_size: u64) -> u64 {
        (file_size as f64 * self.factor).ceil() as u64 + self.overhead_bytes
    }
}

impl Default for FootprintEstimator {
    fn default() -> Self {
        Self::new(1.2, 512)
    }
}
