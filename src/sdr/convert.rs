//! Raw sample unit → normalized float conversion
//!
//! RTL-SDR outputs 8-bit unsigned interleaved I/Q bytes. Each byte maps to
//! one float through `raw / scale - bias`.

/// Scaling convention for raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// `raw / 127.5 - 1.0`, full scale maps onto [-1.0, 1.0]
    #[default]
    Corrected,
    /// `raw / 127.0 - 127.0`, bit-for-bit with the historical plugin.
    ///
    /// Subtracts 127 where 1.0 was clearly intended, so every output lands in
    /// roughly [-127.0, -125.0]. Only for hosts that were tuned against it.
    Legacy,
}

impl Normalization {
    pub fn scale(self) -> f32 {
        match self {
            Normalization::Corrected => 127.5,
            Normalization::Legacy => 127.0,
        }
    }

    pub fn bias(self) -> f32 {
        match self {
            Normalization::Corrected => 1.0,
            Normalization::Legacy => 127.0,
        }
    }
}

/// Pre-computed lookup table for raw byte → float conversion
pub struct SampleConverter {
    table: [f32; 256],
    normalization: Normalization,
}

impl SampleConverter {
    pub fn new(normalization: Normalization) -> Self {
        let scale = normalization.scale();
        let bias = normalization.bias();
        let mut table = [0f32; 256];
        for (raw, slot) in table.iter_mut().enumerate() {
            *slot = raw as f32 / scale - bias;
        }
        Self {
            table,
            normalization,
        }
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    #[inline(always)]
    pub fn value(&self, raw: u8) -> f32 {
        self.table[raw as usize]
    }

    /// Convert `raw` into the front of `output`.
    ///
    /// Returns the number of values written, which is the shorter of the two
    /// lengths. Never allocates.
    pub fn convert(&self, raw: &[u8], output: &mut [f32]) -> usize {
        let n = raw.len().min(output.len());
        for (out, &byte) in output[..n].iter_mut().zip(&raw[..n]) {
            *out = self.table[byte as usize];
        }
        n
    }
}

impl Default for SampleConverter {
    fn default() -> Self {
        Self::new(Normalization::default())
    }
}
