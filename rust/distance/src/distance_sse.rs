#![allow(clippy::missing_safety_doc)]

#[cfg(target_arch = "x86_64")]
#[allow(unused_imports)]
use std::arch::x86_64::*;

#[cfg(all(target_arch = "x86_64", target_feature = "sse"))]
pub unsafe fn hsum_ps_sse(x: __m128) -> f32 {
    let x64: __m128 = _mm_add_ps(x, _mm_movehl_ps(x, x));
    let x32: __m128 = _mm_add_ss(x64, _mm_shuffle_ps(x64, x64, 0x55));
    _mm_cvtss_f32(x32)
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse"))]
pub unsafe fn l2_sqr_sse(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let m = n - (n % 16);
    let mut ptr1: *const f32 = a.as_ptr();
    let mut ptr2: *const f32 = b.as_ptr();
    let mut sum128_1: __m128 = _mm_setzero_ps();
    let mut sum128_2: __m128 = _mm_setzero_ps();
    let mut sum128_3: __m128 = _mm_setzero_ps();
    let mut sum128_4: __m128 = _mm_setzero_ps();
    let mut i: usize = 0;
    while i < m {
        let sub128_1 = _mm_sub_ps(_mm_loadu_ps(ptr1), _mm_loadu_ps(ptr2));
        sum128_1 = _mm_add_ps(sum128_1, _mm_mul_ps(sub128_1, sub128_1));

        let sub128_2 = _mm_sub_ps(_mm_loadu_ps(ptr1.add(4)), _mm_loadu_ps(ptr2.add(4)));
        sum128_2 = _mm_add_ps(sum128_2, _mm_mul_ps(sub128_2, sub128_2));

        let sub128_3 = _mm_sub_ps(_mm_loadu_ps(ptr1.add(8)), _mm_loadu_ps(ptr2.add(8)));
        sum128_3 = _mm_add_ps(sum128_3, _mm_mul_ps(sub128_3, sub128_3));

        let sub128_4 = _mm_sub_ps(_mm_loadu_ps(ptr1.add(12)), _mm_loadu_ps(ptr2.add(12)));
        sum128_4 = _mm_add_ps(sum128_4, _mm_mul_ps(sub128_4, sub128_4));

        ptr1 = ptr1.add(16);
        ptr2 = ptr2.add(16);
        i += 16;
    }

    let mut result = hsum_ps_sse(sum128_1)
        + hsum_ps_sse(sum128_2)
        + hsum_ps_sse(sum128_3)
        + hsum_ps_sse(sum128_4);

    for i in 0..n - m {
        result += (*ptr1.add(i) - *ptr2.add(i)).powi(2);
    }
    result
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;
    #[allow(unused_imports)]
    use crate::distance::l2_sqr_scalar;
    use rand::Rng;

    #[allow(dead_code)]
    fn generate_random_vector(size: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..size).map(|_| rng.gen_range(-10.0..10.0)).collect()
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", target_feature = "sse"))]
    fn test_sse_sizes() {
        for size in [1, 4, 15, 16, 17, 31, 64, 100, 128, 1024] {
            let v1 = generate_random_vector(size);
            let v2 = generate_random_vector(size);
            let simd = unsafe { l2_sqr_sse(&v1, &v2) };
            let scalar = l2_sqr_scalar(&v1, &v2);
            let tolerance = (scalar.abs() * 1e-4).max(1e-5);
            assert!(
                (simd - scalar).abs() < tolerance,
                "size={}: SIMD={}, Scalar={}",
                size,
                simd,
                scalar
            );
        }
    }
}
