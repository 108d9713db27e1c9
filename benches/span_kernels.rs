use criterion::{black_box, criterion_group, criterion_main, Criterion};
use idiomcloze::vec_simd;
use ndarray::{Array1, Array3};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

const HIDDEN_SIZE: usize = 768;

fn random_array(n: usize) -> Array1<f32> {
    Array1::random((n,), Normal::new(0.0, 0.5).unwrap())
}

fn dot_simd(c: &mut Criterion) {
    let u = random_array(HIDDEN_SIZE);
    let v = random_array(HIDDEN_SIZE);
    c.bench_function("dot_simd", move |b| {
        b.iter(|| black_box(vec_simd::dot(u.view(), v.view())))
    });
}

fn dot_unvectorized(c: &mut Criterion) {
    let u = random_array(HIDDEN_SIZE);
    let v = random_array(HIDDEN_SIZE);
    c.bench_function("dot_unvectorized", move |b| {
        b.iter(|| {
            black_box(vec_simd::dot_unvectorized(
                u.as_slice().unwrap(),
                v.as_slice().unwrap(),
            ))
        });
    });
}

fn max_assign_simd(c: &mut Criterion) {
    let mut u = random_array(HIDDEN_SIZE);
    let v = random_array(HIDDEN_SIZE);
    c.bench_function("max_assign_simd", move |b| {
        b.iter(|| vec_simd::max_assign(black_box(u.view_mut()), v.view()))
    });
}

fn max_assign_unvectorized(c: &mut Criterion) {
    let mut u = random_array(HIDDEN_SIZE);
    let v = random_array(HIDDEN_SIZE);
    c.bench_function("max_assign_unvectorized", move |b| {
        b.iter(|| {
            vec_simd::max_assign_unvectorized(
                black_box(u.as_slice_mut().unwrap()),
                v.as_slice().unwrap(),
            )
        })
    });
}

fn span_max_pool(c: &mut Criterion) {
    let hidden = Array3::random((32, 128, HIDDEN_SIZE), Normal::new(0.0, 0.5).unwrap());
    let gather_index = idiomcloze::gather_index(&vec![(17, 4); 32]);
    c.bench_function("span_max_pool", move |b| {
        b.iter(|| black_box(idiomcloze::model::span_max_pool(hidden.view(), gather_index.view())))
    });
}

criterion_group!(
    benches,
    dot_simd,
    dot_unvectorized,
    max_assign_simd,
    max_assign_unvectorized,
    span_max_pool
);
criterion_main!(benches);
