use ndarray::{ArrayView1, ArrayViewMut1};

/// Dot product: u · v
///
/// If the CPU supports AVX instructions, the dot product is
/// SIMD-vectorized.
pub fn dot(u: ArrayView1<f32>, v: ArrayView1<f32>) -> f32 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if is_x86_feature_detected!("avx") {
            if is_x86_feature_detected!("fma") {
                return unsafe { avx_fma::dot(u, v) };
            }

            return unsafe { avx::dot(u, v) };
        }
    }

    dot_unvectorized(
        u.as_slice().expect("Cannot use vector u as slice"),
        v.as_slice().expect("Cannot use vector v as slice"),
    )
}

/// Scaled addition: *u = u + av*
pub fn scaled_add(mut u: ArrayViewMut1<f32>, v: ArrayView1<f32>, a: f32) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if is_x86_feature_detected!("avx") {
            return unsafe { avx::scaled_add(u, v, a) };
        }
    }

    scaled_add_unvectorized(
        u.as_slice_mut().expect("Cannot use vector u as slice"),
        v.as_slice().expect("Cannot use vector v as slice"),
        a,
    )
}

/// Elementwise maximum: *u_i = max(u_i, v_i)*
///
/// This is the reduction used to pool the hidden states of an idiom
/// span into a single vector.
pub fn max_assign(mut u: ArrayViewMut1<f32>, v: ArrayView1<f32>) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if is_x86_feature_detected!("avx") {
            return unsafe { avx::max_assign(u, v) };
        }
    }

    max_assign_unvectorized(
        u.as_slice_mut().expect("Cannot use vector u as slice"),
        v.as_slice().expect("Cannot use vector v as slice"),
    )
}

/// Normalize a vector by its l2 norm.
///
/// The l2 norm is returned. Zero vectors are left untouched.
pub fn l2_normalize(mut v: ArrayViewMut1<f32>) -> f32 {
    let norm = dot(v.view(), v.view()).sqrt();
    if norm > 0. {
        v.mapv_inplace(|c| c / norm);
    }
    norm
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod avx {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;

    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    use ndarray::{ArrayView1, ArrayViewMut1};

    use super::{dot_unvectorized, max_assign_unvectorized, scaled_add_unvectorized};

    #[target_feature(enable = "avx")]
    pub unsafe fn dot(u: ArrayView1<f32>, v: ArrayView1<f32>) -> f32 {
        assert_eq!(u.len(), v.len());

        let mut u = u
            .as_slice()
            .expect("Cannot apply SIMD instructions on non-contiguous data.");
        let mut v = &v
            .as_slice()
            .expect("Cannot apply SIMD instructions on non-contiguous data.")[..u.len()];

        let mut sums = _mm256_setzero_ps();
        while u.len() >= 8 {
            let ux8 = _mm256_loadu_ps(u.as_ptr());
            let vx8 = _mm256_loadu_ps(v.as_ptr());
            sums = _mm256_add_ps(_mm256_mul_ps(ux8, vx8), sums);
            u = &u[8..];
            v = &v[8..];
        }

        horizontal_sum(sums) + dot_unvectorized(u, v)
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn scaled_add(mut u: ArrayViewMut1<f32>, v: ArrayView1<f32>, a: f32) {
        assert_eq!(u.len(), v.len());

        let mut u = u
            .as_slice_mut()
            .expect("Cannot apply SIMD instructions on non-contiguous data.");
        let mut v = &v
            .as_slice()
            .expect("Cannot apply SIMD instructions on non-contiguous data.")[..u.len()];

        let ax8 = _mm256_set1_ps(a);
        while u.len() >= 8 {
            let ux8 = _mm256_loadu_ps(u.as_ptr());
            let vx8 = _mm256_loadu_ps(v.as_ptr());
            _mm256_storeu_ps(u.as_mut_ptr(), _mm256_add_ps(ux8, _mm256_mul_ps(vx8, ax8)));
            u = &mut { u }[8..];
            v = &v[8..];
        }

        scaled_add_unvectorized(u, v, a);
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn max_assign(mut u: ArrayViewMut1<f32>, v: ArrayView1<f32>) {
        assert_eq!(u.len(), v.len());

        let mut u = u
            .as_slice_mut()
            .expect("Cannot apply SIMD instructions on non-contiguous data.");
        let mut v = &v
            .as_slice()
            .expect("Cannot apply SIMD instructions on non-contiguous data.")[..u.len()];

        while u.len() >= 8 {
            let ux8 = _mm256_loadu_ps(u.as_ptr());
            let vx8 = _mm256_loadu_ps(v.as_ptr());
            _mm256_storeu_ps(u.as_mut_ptr(), _mm256_max_ps(ux8, vx8));
            u = &mut { u }[8..];
            v = &v[8..];
        }

        max_assign_unvectorized(u, v);
    }

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn horizontal_sum(sums: __m256) -> f32 {
        let sums = _mm256_hadd_ps(sums, sums);
        let sums = _mm256_hadd_ps(sums, sums);

        // Sum sums[0..4] and sums[4..8].
        let sums = _mm_add_ps(_mm256_castps256_ps128(sums), _mm256_extractf128_ps(sums, 1));
        _mm_cvtss_f32(sums)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod avx_fma {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;

    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    use ndarray::ArrayView1;

    use super::avx::horizontal_sum;
    use super::dot_unvectorized;

    #[target_feature(enable = "avx", enable = "fma")]
    pub unsafe fn dot(u: ArrayView1<f32>, v: ArrayView1<f32>) -> f32 {
        assert_eq!(u.len(), v.len());

        let mut u = u
            .as_slice()
            .expect("Cannot apply SIMD instructions on non-contiguous data.");
        let mut v = &v
            .as_slice()
            .expect("Cannot apply SIMD instructions on non-contiguous data.")[..u.len()];

        let mut sums = _mm256_setzero_ps();
        while u.len() >= 8 {
            let ux8 = _mm256_loadu_ps(u.as_ptr());
            let vx8 = _mm256_loadu_ps(v.as_ptr());
            sums = _mm256_fmadd_ps(ux8, vx8, sums);
            u = &u[8..];
            v = &v[8..];
        }

        horizontal_sum(sums) + dot_unvectorized(u, v)
    }
}

pub fn dot_unvectorized(u: &[f32], v: &[f32]) -> f32 {
    assert_eq!(u.len(), v.len());
    u.iter().zip(v).map(|(&a, &b)| a * b).sum()
}

pub fn scaled_add_unvectorized(u: &mut [f32], v: &[f32], a: f32) {
    assert_eq!(u.len(), v.len());
    for (uc, &vc) in u.iter_mut().zip(v) {
        *uc += vc * a;
    }
}

pub fn max_assign_unvectorized(u: &mut [f32], v: &[f32]) {
    assert_eq!(u.len(), v.len());
    for (uc, &vc) in u.iter_mut().zip(v) {
        if vc > *uc {
            *uc = vc;
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    use crate::util::{all_close, array_all_close, close};

    use super::{
        dot, dot_unvectorized, l2_normalize, max_assign, max_assign_unvectorized, scaled_add,
        scaled_add_unvectorized,
    };

    #[test]
    fn dot_unvectorized_test() {
        let u = [1f32, -2f32, -3f32];
        let v = [2f32, 4f32, -2f32];
        let w = [-1f32, 3f32, 2.5f32];

        assert!(close(dot_unvectorized(&u, &v), 0f32, 1e-5));
        assert!(close(dot_unvectorized(&u, &w), -14.5f32, 1e-5));
        assert!(close(dot_unvectorized(&v, &w), 5f32, 1e-5));
    }

    #[test]
    fn dot_matches_unvectorized() {
        let u = Array1::random((102,), Uniform::new_inclusive(-1.0, 1.0));
        let v = Array1::random((102,), Uniform::new_inclusive(-1.0, 1.0));
        assert!(close(
            dot(u.view(), v.view()),
            dot_unvectorized(u.as_slice().unwrap(), v.as_slice().unwrap()),
            1e-4
        ));
    }

    #[test]
    fn scaled_add_unvectorized_test() {
        let u = &mut [1., 2., 3., 4., 5.];
        let v = &[5., 3., 3., 2., 1.];
        scaled_add_unvectorized(u, v, 0.5);
        assert!(all_close(u, &[3.5, 3.5, 4.5, 5.0, 5.5], 1e-5));
    }

    #[test]
    fn scaled_add_matches_unvectorized() {
        let mut u = Array1::random((102,), Uniform::new_inclusive(-1.0, 1.0));
        let v = Array1::random((102,), Uniform::new_inclusive(-1.0, 1.0));
        let mut check = u.clone();
        scaled_add_unvectorized(check.as_slice_mut().unwrap(), v.as_slice().unwrap(), 2.5);
        scaled_add(u.view_mut(), v.view(), 2.5);
        assert!(array_all_close(check.view(), u.view(), 1e-5));
    }

    #[test]
    fn max_assign_unvectorized_test() {
        let u = &mut [1., -2., 3., 0.5];
        max_assign_unvectorized(u, &[0., -1., 4., 0.5]);
        assert!(all_close(u, &[1., -1., 4., 0.5], 1e-6));
    }

    #[test]
    fn max_assign_matches_unvectorized() {
        let mut u = Array1::random((37,), Uniform::new_inclusive(-1.0, 1.0));
        let v = Array1::random((37,), Uniform::new_inclusive(-1.0, 1.0));
        let mut check = u.clone();
        max_assign_unvectorized(check.as_slice_mut().unwrap(), v.as_slice().unwrap());
        max_assign(u.view_mut(), v.view());
        assert!(array_all_close(check.view(), u.view(), 0.));
    }

    #[test]
    fn l2_normalize_test() {
        let mut u = Array1::from(vec![1., -2., -1., 3., -3., 1.]);
        assert!(close(l2_normalize(u.view_mut()), 5., 1e-5));
        assert!(all_close(
            &[0.2, -0.4, -0.2, 0.6, -0.6, 0.2],
            u.as_slice().unwrap(),
            1e-5
        ));

        let mut zero = Array1::<f32>::zeros((4,));
        assert!(close(l2_normalize(zero.view_mut()), 0., 1e-8));
        assert!(all_close(zero.as_slice().unwrap(), &[0.; 4], 0.));
    }
}
