#![allow(clippy::missing_safety_doc)]

#[cfg(target_arch = "aarch64")]
#[allow(unused_imports)]
use std::arch::aarch64::*;

#[cfg(all(target_arch = "aarch64", target_feature = "neon"))]
pub unsafe fn l2_sqr_neon(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let m = n - (n % 16);
    let mut ptr1: *const f32 = a.as_ptr();
    let mut ptr2: *const f32 = b.as_ptr();
    let mut sum128_1: float32x4_t = vdupq_n_f32(0.0);
    let mut sum128_2: float32x4_t = vdupq_n_f32(0.0);
    let mut sum128_3: float32x4_t = vdupq_n_f32(0.0);
    let mut sum128_4: float32x4_t = vdupq_n_f32(0.0);
    let mut i: usize = 0;
    while i < m {
        let sub128_1 = vsubq_f32(vld1q_f32(ptr1), vld1q_f32(ptr2));
        sum128_1 = vfmaq_f32(sum128_1, sub128_1, sub128_1);

        let sub128_2 = vsubq_f32(vld1q_f32(ptr1.add(4)), vld1q_f32(ptr2.add(4)));
        sum128_2 = vfmaq_f32(sum128_2, sub128_2, sub128_2);

        let sub128_3 = vsubq_f32(vld1q_f32(ptr1.add(8)), vld1q_f32(ptr2.add(8)));
        sum128_3 = vfmaq_f32(sum128_3, sub128_3, sub128_3);

        let sub128_4 = vsubq_f32(vld1q_f32(ptr1.add(12)), vld1q_f32(ptr2.add(12)));
        sum128_4 = vfmaq_f32(sum128_4, sub128_4, sub128_4);

        ptr1 = ptr1.add(16);
        ptr2 = ptr2.add(16);
        i += 16;
    }

    let mut result = vaddvq_f32(sum128_1)
        + vaddvq_f32(sum128_2)
        + vaddvq_f32(sum128_3)
        + vaddvq_f32(sum128_4);
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
    #[cfg(all(target_arch = "aarch64", target_feature = "neon"))]
    fn test_neon_sizes() {
        for size in [1, 4, 15, 16, 17, 31, 64, 100, 128, 1024] {
            let v1 = generate_random_vector(size);
            let v2 = generate_random_vector(size);
            let simd = unsafe { l2_sqr_neon(&v1, &v2) };
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
