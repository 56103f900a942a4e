//! Synthetic inputs for registration scenarios.

/// A 2-D Gaussian blob of the given amplitude on a faint constant floor,
/// returned as a flat x-fastest sample buffer.
pub fn gaussian_blob(
    shape: [usize; 2],
    centre: [f64; 2],
    sigma: f64,
    amplitude: f64,
) -> Vec<f64> {
    let mut samples = Vec::with_capacity(shape[0] * shape[1]);

    for y in 0..shape[1] {
        for x in 0..shape[0] {
            let dx = x as f64 - centre[0];
            let dy = y as f64 - centre[1];
            let r2 = dx * dx + dy * dy;
            samples.push(0.01 + amplitude * (-r2 / (2.0 * sigma * sigma)).exp());
        }
    }

    samples
}
