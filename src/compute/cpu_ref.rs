//! Pure-Rust CPU reference implementations of the four kernel math
//! operations the compute façade dispatches on the device (`spec.md` §8's
//! numeric invariants — RMS ≈ 1.0, softmax rows sum to 1 — need something to
//! check them against without a GPU present).
//!
//! `original_source/` has no equivalent CPU path of its own (the reference
//! only ever runs these as device kernels); these functions exist solely so
//! this crate's tests can validate kernel *math* on the host. They are not
//! used by [`super::gemm`]/[`super::attention_decode`]/[`super::rmsnorm`]
//! at runtime.

/// Row-wise RMS normalization: `y_i = x_i / rms(x) * weight_i`, `rms(x) =
/// sqrt(mean(x_i^2) + eps)`.
pub fn rmsnorm(x: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
    assert_eq!(x.len(), weight.len());
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let rms = (mean_sq + eps).sqrt();
    x.iter().zip(weight).map(|(v, w)| (v / rms) * w).collect()
}

/// Numerically stable softmax over a single row.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|v| v / sum).collect()
}

/// `SiLU(x) = x * sigmoid(x)`.
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Rotary position embedding applied to one head's `[head_dim]` vector,
/// rotating adjacent `(2i, 2i+1)` pairs by `pos * base^(-2i/head_dim)`.
pub fn rope(v: &[f32], pos: usize, base: f32) -> Vec<f32> {
    let head_dim = v.len();
    let mut out = vec![0f32; head_dim];
    for i in (0..head_dim).step_by(2) {
        let freq = 1.0 / base.powf(i as f32 / head_dim as f32);
        let angle = pos as f32 * freq;
        let (sin, cos) = angle.sin_cos();
        let a = v[i];
        let b = if i + 1 < head_dim { v[i + 1] } else { 0.0 };
        out[i] = a * cos - b * sin;
        if i + 1 < head_dim {
            out[i + 1] = a * sin + b * cos;
        }
    }
    out
}

/// Naive row-major `[m, k] x [k, n] = [m, n]` matrix multiply, `b` optionally
/// transposed (the weight layout the loaders store tensors in).
pub fn gemm(a: &[f32], b: &[f32], m: usize, n: usize, k: usize, transpose_b: bool) -> Vec<f32> {
    assert_eq!(a.len(), m * k);
    assert_eq!(b.len(), k * n);
    let mut out = vec![0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0f32;
            for inner in 0..k {
                let b_val = if transpose_b { b[col * k + inner] } else { b[inner * n + col] };
                acc += a[row * k + inner] * b_val;
            }
            out[row * n + col] = acc;
        }
    }
    out
}

/// Causal scaled dot-product attention for one head over `seq_len` cached
/// positions: `softmax(Q K^T * scale, causal) V`.
pub fn attention(q: &[f32], k: &[f32], v: &[f32], seq_len: usize, head_dim: usize, query_pos: usize, scale: f32) -> Vec<f32> {
    assert_eq!(q.len(), head_dim);
    assert_eq!(k.len(), seq_len * head_dim);
    assert_eq!(v.len(), seq_len * head_dim);

    let visible = query_pos + 1;
    let mut scores = vec![f32::NEG_INFINITY; seq_len];
    for pos in 0..visible.min(seq_len) {
        let mut dot = 0f32;
        for d in 0..head_dim {
            dot += q[d] * k[pos * head_dim + d];
        }
        scores[pos] = dot * scale;
    }
    let weights = softmax(&scores[..visible.min(seq_len)]);

    let mut out = vec![0f32; head_dim];
    for (pos, w) in weights.iter().enumerate() {
        for d in 0..head_dim {
            out[d] += w * v[pos * head_dim + d];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmsnorm_row_rms_is_approximately_one_after_unit_weight() {
        let x = vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.5];
        let weight = vec![1.0; x.len()];
        let y = rmsnorm(&x, &weight, 1e-5);
        let rms: f32 = (y.iter().map(|v| v * v).sum::<f32>() / y.len() as f32).sqrt();
        assert!((rms - 1.0).abs() <= 5e-2, "rms={rms}");
    }

    #[test]
    fn softmax_row_sums_to_one() {
        let logits = vec![1.0, 2.0, -1.0, 0.5, 3.0];
        let probs = softmax(&logits);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "sum={sum}");
        assert!(probs.iter().all(|p| *p >= 0.0));
    }

    #[test]
    fn softmax_is_invariant_to_a_constant_shift() {
        let logits = vec![1.0, 2.0, 3.0];
        let shifted: Vec<f32> = logits.iter().map(|v| v + 100.0).collect();
        let a = softmax(&logits);
        let b = softmax(&shifted);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn silu_at_zero_is_zero() {
        assert_eq!(silu(0.0), 0.0);
    }

    #[test]
    fn rope_rotation_preserves_pair_norm() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        let rotated = rope(&v, 5, 10000.0);
        let norm_before: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_after: f32 = rotated.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm_before - norm_after).abs() < 1e-4);
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        let rotated = rope(&v, 0, 10000.0);
        for (a, b) in v.iter().zip(rotated.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn gemm_identity_matrix_is_passthrough() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let identity = vec![1.0, 0.0, 0.0, 1.0];
        let out = gemm(&a, &identity, 2, 2, 2, false);
        assert_eq!(out, a);
    }

    #[test]
    fn attention_with_one_visible_position_returns_that_position_value() {
        let head_dim = 4;
        let q = vec![1.0; head_dim];
        let k = vec![1.0; head_dim];
        let v = vec![7.0, 8.0, 9.0, 10.0];
        let out = attention(&q, &k, &v, 1, head_dim, 0, 1.0);
        assert_eq!(out, v);
    }

    #[test]
    fn attention_ignores_positions_after_query_pos() {
        let head_dim = 2;
        let q = vec![1.0, 0.0];
        let k = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let v = vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let scale = 1.0 / (head_dim as f32).sqrt();
        let out = attention(&q, &k, &v, 3, head_dim, 1, scale);
        // With query_pos=1 only positions 0 and 1 are visible; position 2's
        // value (3.0) must not influence the output.
        assert!(out[0] < 2.5 && out[1] < 2.5);
    }
}
