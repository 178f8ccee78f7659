#![allow(clippy::missing_safety_doc)]

#[cfg(target_arch = "x86_64")]
#[allow(unused_imports)]
use std::arch::x86_64::*;

#[cfg(all(target_arch = "x86_64", target_feature = "avx512f"))]
pub unsafe fn l2_sqr_avx512(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let m = n - (n % 32);
    let mut ptr1: *const f32 = a.as_ptr();
    let mut ptr2: *const f32 = b.as_ptr();
    let mut sum512_1: __m512 = _mm512_setzero_ps();
    let mut sum512_2: __m512 = _mm512_setzero_ps();
    let mut i: usize = 0;
    while i < m {
        let sub512_1: __m512 =
            _mm512_sub_ps(_mm512_loadu_ps(ptr1.add(0)), _mm512_loadu_ps(ptr2.add(0)));
        sum512_1 = _mm512_fmadd_ps(sub512_1, sub512_1, sum512_1);

        let sub512_2: __m512 =
            _mm512_sub_ps(_mm512_loadu_ps(ptr1.add(16)), _mm512_loadu_ps(ptr2.add(16)));
        sum512_2 = _mm512_fmadd_ps(sub512_2, sub512_2, sum512_2);

        ptr1 = ptr1.add(32);
        ptr2 = ptr2.add(32);
        i += 32;
    }

    let mut result = _mm512_reduce_add_ps(sum512_1) + _mm512_reduce_add_ps(sum512_2);
    for i in 0..n - m {
        result += (*ptr1.add(i) - *ptr2.add(i)).powi(2);
    }
    result
}
