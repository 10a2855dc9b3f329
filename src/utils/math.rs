//! Math utility functions

/// Largest absolute value, 0 for an empty slice
pub fn abs_max(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
}

/// Largest absolute element-wise difference between two vectors
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

/// Symmetric int8 scale for values in `[-amax, amax]`
pub fn int8_scale(amax: f32) -> f32 {
    if amax > 0.0 && amax.is_finite() {
        amax / 127.0
    } else {
        1.0
    }
}

/// Quantize to int8 with the given scale and back, in place
pub fn fake_quantize_i8(v: &mut [f32], scale: f32) {
    for x in v.iter_mut() {
        *x = (*x / scale).round().clamp(-127.0, 127.0) * scale;
    }
}

/// Deterministic pseudo-random values in [-1, 1] (xorshift32)
pub fn deterministic_signal(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}
