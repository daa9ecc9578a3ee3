use anyhow::{Result, ensure};

const CUBIC_A: f32 = -0.75;

fn cubic_near(x: f32) -> f32 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

fn cubic_far(x: f32) -> f32 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

/// Source index and the four tap weights for one output coordinate (`align_corners = false`).
fn taps(dst: usize, in_len: usize, out_len: usize) -> (isize, [f32; 4]) {
    let scale = in_len as f32 / out_len as f32;
    let src = (dst as f32 + 0.5) * scale - 0.5;
    let x0 = src.floor();
    let t = src - x0;
    let weights = [
        cubic_far(t + 1.0),
        cubic_near(t),
        cubic_near(1.0 - t),
        cubic_far(2.0 - t),
    ];
    (x0 as isize, weights)
}

fn clamp_index(idx: isize, len: usize) -> usize {
    idx.clamp(0, len as isize - 1) as usize
}

/// Bicubic resize of a row-major `[in_h, in_w, dim]` lattice to `[out_h, out_w, dim]`.
///
/// Separable: rows first, then columns. Out-of-range taps read the nearest edge sample. Matching
/// sizes return the input unchanged.
pub fn bicubic_resize(
    values: &[f32],
    (in_h, in_w): (usize, usize),
    (out_h, out_w): (usize, usize),
    dim: usize,
) -> Result<Vec<f32>> {
    ensure!(
        values.len() == in_h * in_w * dim,
        "lattice holds {} values, expected {in_h}x{in_w}x{dim}",
        values.len()
    );
    ensure!(
        in_h > 0 && in_w > 0 && out_h > 0 && out_w > 0,
        "bicubic resize needs non-empty grids ({in_h}x{in_w} -> {out_h}x{out_w})"
    );
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(values.to_vec());
    }

    let mut rows = vec![0f32; out_h * in_w * dim];
    for oy in 0..out_h {
        let (y0, weights) = taps(oy, in_h, out_h);
        for (k, weight) in weights.iter().enumerate() {
            let sy = clamp_index(y0 - 1 + k as isize, in_h);
            let src = &values[sy * in_w * dim..(sy + 1) * in_w * dim];
            let dst = &mut rows[oy * in_w * dim..(oy + 1) * in_w * dim];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += weight * s;
            }
        }
    }

    let mut out = vec![0f32; out_h * out_w * dim];
    for ox in 0..out_w {
        let (x0, weights) = taps(ox, in_w, out_w);
        for (k, weight) in weights.iter().enumerate() {
            let sx = clamp_index(x0 - 1 + k as isize, in_w);
            for oy in 0..out_h {
                let src = &rows[(oy * in_w + sx) * dim..(oy * in_w + sx + 1) * dim];
                let dst = &mut out[(oy * out_w + ox) * dim..(oy * out_w + ox + 1) * dim];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += weight * s;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        for t in [0.0f32, 0.25, 0.5, 0.9] {
            let sum = cubic_far(t + 1.0) + cubic_near(t) + cubic_near(1.0 - t) + cubic_far(2.0 - t);
            assert!((sum - 1.0).abs() < 1e-5, "t={t} sum={sum}");
        }
    }

    #[test]
    fn same_size_is_identity() -> Result<()> {
        let values: Vec<f32> = (0..2 * 3 * 4).map(|v| v as f32).collect();
        assert_eq!(bicubic_resize(&values, (2, 3), (2, 3), 4)?, values);
        Ok(())
    }

    #[test]
    fn constant_lattice_stays_constant() -> Result<()> {
        let values = vec![0.75f32; 4 * 4 * 2];
        let resized = bicubic_resize(&values, (4, 4), (7, 3), 2)?;
        assert_eq!(resized.len(), 7 * 3 * 2);
        assert!(resized.iter().all(|v| (v - 0.75).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn mirrored_input_gives_mirrored_output() -> Result<()> {
        let values = vec![0.0f32, 1.0, 4.0, 2.0, 3.0];
        let reversed: Vec<f32> = values.iter().rev().copied().collect();
        let forward = bicubic_resize(&values, (1, 5), (1, 8), 1)?;
        let mut backward = bicubic_resize(&reversed, (1, 5), (1, 8), 1)?;
        backward.reverse();
        for (a, b) in forward.iter().zip(&backward) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(bicubic_resize(&[0.0; 5], (2, 2), (3, 3), 1).is_err());
    }
}
