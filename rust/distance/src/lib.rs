pub mod distance;
pub mod distance_avx;
pub mod distance_avx512;
pub mod distance_neon;
pub mod distance_sse;

pub use distance::l2_sqr_scalar;

/// Squared Euclidean distance `Σ (aᵢ - bᵢ)²`.
///
/// The implementation is picked once at build time from the widest SIMD
/// width the target enables; unused widths compile out entirely, so the
/// hot loops pay no dispatch cost. Results match the scalar reference up
/// to floating-point associativity.
#[allow(unreachable_code)]
#[inline]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(all(target_arch = "x86_64", target_feature = "avx512f"))]
    return unsafe { distance_avx512::l2_sqr_avx512(a, b) };

    #[cfg(all(
        target_arch = "x86_64",
        target_feature = "avx",
        target_feature = "fma",
        not(target_feature = "avx512f")
    ))]
    return unsafe { distance_avx::l2_sqr_avx(a, b) };

    #[cfg(all(
        target_arch = "x86_64",
        target_feature = "sse",
        not(all(target_feature = "avx", target_feature = "fma")),
        not(target_feature = "avx512f")
    ))]
    return unsafe { distance_sse::l2_sqr_sse(a, b) };

    #[cfg(all(target_arch = "aarch64", target_feature = "neon"))]
    return unsafe { distance_neon::l2_sqr_neon(a, b) };

    distance::l2_sqr_scalar(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_matches_scalar() {
        for len in [0, 1, 3, 4, 7, 8, 16, 31, 64, 100, 128] {
            let a: Vec<f32> = (0..len).map(|i| (i as f32) * 0.25 - 3.0).collect();
            let b: Vec<f32> = (0..len).map(|i| (i as f32) * -0.5 + 1.0).collect();
            let fast = l2_sqr(&a, &b);
            let reference = l2_sqr_scalar(&a, &b);
            let tolerance = (reference.abs() * 1e-4).max(1e-5);
            assert!(
                (fast - reference).abs() < tolerance,
                "len={}: dispatched={}, scalar={}",
                len,
                fast,
                reference
            );
        }
    }

    #[test]
    fn test_zero_distance() {
        let a = vec![1.5f32; 37];
        assert_eq!(l2_sqr(&a, &a), 0.0);
    }
}
