//! Even/odd sum and difference over assembled visibility blocks.
//!
//! For each baseline the block holds two contiguous spectra, one per time
//! parity.  The kernel emits `sum = even + odd` and `diff = even − odd`
//! per output channel, optionally accumulating `chan_sum` adjacent input
//! channels first.  Lanes are 32-bit integers with wrap-around; the
//! invariants `sum + diff == 2·even` and `sum − diff == 2·odd` hold
//! lane-wise (mod 2³²).
//!
//! With four Stokes products one channel is exactly one 256-bit vector
//! (4 stokes × re/im × 32 bits), so on x86-64 with AVX2 the kernel runs on
//! aligned 256-bit adds; otherwise a scalar path produces bit-identical
//! results.  The kernel is pure: no allocation, no I/O.

use gabbro_blocks::XGeom;

/// Compute sum/diff for `n_bl` baselines starting at `first_bl`.
///
/// `block` is the assembled block as 32-bit words; `out_sum`/`out_diff`
/// receive `n_bl × (n_chan_total / chan_sum) × n_stokes × 2` words each.
///
/// # Panics
/// Panics if `chan_sum` does not divide the channel count or the output
/// slices are too short — both are configuration errors checked once by
/// the caller at startup.
pub fn sum_diff(
    geom: &XGeom,
    chan_sum: usize,
    block: &[i32],
    first_bl: usize,
    n_bl: usize,
    out_sum: &mut [i32],
    out_diff: &mut [i32],
) {
    assert!(chan_sum > 0 && geom.n_chan_total % chan_sum == 0);
    let lanes = geom.n_stokes * 2;
    let n_proc = geom.n_chan_total / chan_sum;
    let out_words = n_bl * n_proc * lanes;
    assert!(out_sum.len() >= out_words && out_diff.len() >= out_words);
    assert!(first_bl + n_bl <= geom.baselines_per_block);

    #[cfg(target_arch = "x86_64")]
    {
        let aligned = block.as_ptr() as usize % 32 == 0
            && out_sum.as_ptr() as usize % 32 == 0
            && out_diff.as_ptr() as usize % 32 == 0;
        if lanes == 8 && aligned && std::arch::is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 checked; one channel is one 32-byte vector and
            // every parity slice starts 32-byte aligned (payload layout).
            unsafe {
                sum_diff_avx2(geom, chan_sum, block, first_bl, n_bl, out_sum, out_diff);
            }
            return;
        }
    }

    sum_diff_scalar(geom, chan_sum, block, first_bl, n_bl, out_sum, out_diff);
}

fn sum_diff_scalar(
    geom: &XGeom,
    chan_sum: usize,
    block: &[i32],
    first_bl: usize,
    n_bl: usize,
    out_sum: &mut [i32],
    out_diff: &mut [i32],
) {
    let lanes = geom.n_stokes * 2;
    let n_proc = geom.n_chan_total / chan_sum;
    let parity_words = geom.words_per_parity();

    for bl in 0..n_bl {
        let even = &block[geom.bcnt_idx32(first_bl + bl, 0)..][..parity_words];
        let odd = &block[geom.bcnt_idx32(first_bl + bl, 1)..][..parity_words];
        let out_base = bl * n_proc * lanes;

        for oc in 0..n_proc {
            for lane in 0..lanes {
                let mut se = 0i32;
                let mut so = 0i32;
                for c in 0..chan_sum {
                    let idx = (oc * chan_sum + c) * lanes + lane;
                    se = se.wrapping_add(even[idx]);
                    so = so.wrapping_add(odd[idx]);
                }
                out_sum[out_base + oc * lanes + lane] = se.wrapping_add(so);
                out_diff[out_base + oc * lanes + lane] = se.wrapping_sub(so);
            }
        }
    }
}

/// # Safety
/// Requires AVX2, `n_stokes == 4` (one channel per 256-bit vector), and
/// 32-byte alignment of `block`, `out_sum`, and `out_diff`.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn sum_diff_avx2(
    geom: &XGeom,
    chan_sum: usize,
    block: &[i32],
    first_bl: usize,
    n_bl: usize,
    out_sum: &mut [i32],
    out_diff: &mut [i32],
) {
    use std::arch::x86_64::{
        __m256i, _mm256_add_epi32, _mm256_load_si256, _mm256_store_si256, _mm256_sub_epi32,
    };

    let n_proc = geom.n_chan_total / chan_sum;

    unsafe {
        for bl in 0..n_bl {
            let even = block.as_ptr().add(geom.bcnt_idx32(first_bl + bl, 0)) as *const __m256i;
            let odd = block.as_ptr().add(geom.bcnt_idx32(first_bl + bl, 1)) as *const __m256i;
            let sum_out = out_sum.as_mut_ptr().add(bl * n_proc * 8) as *mut __m256i;
            let diff_out = out_diff.as_mut_ptr().add(bl * n_proc * 8) as *mut __m256i;

            for oc in 0..n_proc {
                let mut acc_e = _mm256_load_si256(even.add(oc * chan_sum));
                let mut acc_o = _mm256_load_si256(odd.add(oc * chan_sum));
                for c in 1..chan_sum {
                    acc_e = _mm256_add_epi32(acc_e, _mm256_load_si256(even.add(oc * chan_sum + c)));
                    acc_o = _mm256_add_epi32(acc_o, _mm256_load_si256(odd.add(oc * chan_sum + c)));
                }
                _mm256_store_si256(sum_out.add(oc), _mm256_add_epi32(acc_e, acc_o));
                _mm256_store_si256(diff_out.add(oc), _mm256_sub_epi32(acc_e, acc_o));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gabbro_mmap::AlignedBuf;

    fn geom() -> XGeom {
        XGeom {
            baselines_per_block: 4,
            time_demux: 2,
            n_xeng_per_time: 2,
            n_chan_total: 16,
            chan_per_packet: 4,
            n_stokes: 4,
        }
    }

    /// Build an aligned block with `f(bl, parity, word)` in every lane.
    fn make_block(g: &XGeom, f: impl Fn(usize, usize, usize) -> i32) -> AlignedBuf<i32> {
        let mut buf = AlignedBuf::<i32>::zeroed(g.block_words());
        for bl in 0..g.baselines_per_block {
            for parity in 0..2 {
                let base = g.bcnt_idx32(bl, parity);
                for w in 0..g.words_per_parity() {
                    buf[base + w] = f(bl, parity, w);
                }
            }
        }
        buf
    }

    fn out_bufs(g: &XGeom, chan_sum: usize, n_bl: usize) -> (AlignedBuf<i32>, AlignedBuf<i32>) {
        let words = n_bl * (g.n_chan_total / chan_sum) * g.n_stokes * 2;
        (AlignedBuf::zeroed(words), AlignedBuf::zeroed(words))
    }

    /// §-style ramp: even counts up, odd counts down; sum is constant and
    /// diff is antisymmetric.
    #[test]
    fn ramp_gives_constant_sum_and_antisymmetric_diff() {
        let g = geom();
        let n = g.words_per_parity() as i32;
        let block = make_block(&g, |_, parity, w| {
            if parity == 0 { w as i32 + 1 } else { n - w as i32 }
        });
        let (mut sum, mut diff) = out_bufs(&g, 1, g.baselines_per_block);
        sum_diff(&g, 1, &block, 0, g.baselines_per_block, &mut sum, &mut diff);

        assert!(sum.iter().all(|&v| v == n + 1));
        for w in 0..g.words_per_parity() as i32 {
            assert_eq!(diff[w as usize], 2 * (w + 1) - (n + 1));
        }
    }

    /// sum + diff == 2·even and sum − diff == 2·odd, lane-wise.
    #[test]
    fn identity_recovers_both_parities() {
        let g = geom();
        let block = make_block(&g, |bl, parity, w| {
            (bl as i32 * 7919).wrapping_add(w as i32 * 31).wrapping_sub(parity as i32 * 1013)
        });
        let (mut sum, mut diff) = out_bufs(&g, 1, g.baselines_per_block);
        sum_diff(&g, 1, &block, 0, g.baselines_per_block, &mut sum, &mut diff);

        let lanes = g.n_stokes * 2;
        for bl in 0..g.baselines_per_block {
            for w in 0..g.words_per_parity() {
                let even = block[g.bcnt_idx32(bl, 0) + w];
                let odd = block[g.bcnt_idx32(bl, 1) + w];
                let s = sum[bl * g.n_chan_total * lanes + w];
                let d = diff[bl * g.n_chan_total * lanes + w];
                assert_eq!(s.wrapping_add(d), even.wrapping_mul(2));
                assert_eq!(s.wrapping_sub(d), odd.wrapping_mul(2));
            }
        }
    }

    #[test]
    fn chan_sum_accumulates_adjacent_channels() {
        let g = geom();
        let chan_sum = 4;
        // every lane of channel c holds c+1, so a 4-channel group sums to
        // 4c+10 per parity and 8c+20 across parities
        let lanes = g.n_stokes * 2;
        let block = make_block(&g, |_, _, w| (w / lanes) as i32 + 1);
        let (mut sum, mut diff) = out_bufs(&g, chan_sum, 1);
        sum_diff(&g, chan_sum, &block, 0, 1, &mut sum, &mut diff);

        let n_proc = g.n_chan_total / chan_sum;
        for oc in 0..n_proc {
            let group_first = (oc * chan_sum) as i32 + 1;
            let per_parity = chan_sum as i32 * group_first + (0..chan_sum as i32).sum::<i32>();
            for lane in 0..lanes {
                assert_eq!(sum[oc * lanes + lane], 2 * per_parity);
                assert_eq!(diff[oc * lanes + lane], 0);
            }
        }
    }

    #[test]
    fn overflow_wraps() {
        let g = geom();
        let block = make_block(&g, |_, _, _| i32::MAX);
        let (mut sum, mut diff) = out_bufs(&g, 1, 1);
        sum_diff(&g, 1, &block, 0, 1, &mut sum, &mut diff);
        assert!(sum.iter().all(|&v| v == -2)); // MAX + MAX wraps
        assert!(diff.iter().all(|&v| v == 0));
    }

    /// The vector and scalar paths must agree bit-for-bit.
    #[test]
    fn scalar_path_matches_dispatch() {
        let g = geom();
        let block = make_block(&g, |bl, parity, w| {
            (w as i32)
                .wrapping_mul(2_654_435_761u32 as i32)
                .wrapping_add(bl as i32 * 97 + parity as i32)
        });
        let (mut sum_a, mut diff_a) = out_bufs(&g, 2, g.baselines_per_block);
        let (mut sum_b, mut diff_b) = out_bufs(&g, 2, g.baselines_per_block);
        sum_diff(&g, 2, &block, 0, g.baselines_per_block, &mut sum_a, &mut diff_a);
        sum_diff_scalar(&g, 2, &block, 0, g.baselines_per_block, &mut sum_b, &mut diff_b);
        assert_eq!(&sum_a[..], &sum_b[..]);
        assert_eq!(&diff_a[..], &diff_b[..]);
    }
}
