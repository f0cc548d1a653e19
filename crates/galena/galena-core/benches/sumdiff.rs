use criterion::{Criterion, black_box, criterion_group, criterion_main};
use gabbro_blocks::XGeom;
use gabbro_mmap::AlignedBuf;
use galena_core::sum_diff;

/// One writer stride (32 baselines) over the default full-size geometry,
/// with and without channel summing.
fn bench_sum_diff(c: &mut Criterion) {
    let geom = XGeom::default();
    let n_bl = 32;

    let mut block = AlignedBuf::<i32>::zeroed(geom.block_words());
    for (i, w) in block.iter_mut().enumerate() {
        *w = fastrand::i32(..).wrapping_add(i as i32);
    }

    for chan_sum in [1usize, 4] {
        let out_words = n_bl * (geom.n_chan_total / chan_sum) * geom.n_stokes * 2;
        let mut sum = AlignedBuf::<i32>::zeroed(out_words);
        let mut diff = AlignedBuf::<i32>::zeroed(out_words);

        c.bench_function(&format!("sum_diff/32bl/chan_sum={chan_sum}"), |b| {
            b.iter(|| {
                sum_diff(
                    &geom,
                    chan_sum,
                    black_box(&block),
                    0,
                    n_bl,
                    &mut sum,
                    &mut diff,
                );
                black_box(sum[0]);
            })
        });
    }
}

criterion_group!(benches, bench_sum_diff);
criterion_main!(benches);
