//! Cache-bypassing payload copy.
//!
//! Reassembly writes every payload byte exactly once and nothing on this
//! core reads it back; pulling those lines through L2/L3 would only evict
//! hot state.  On x86-64 with AVX2 the copy therefore uses non-temporal
//! (streaming) loads and stores.  Anywhere else, or for slices that do not
//! meet the 32-byte alignment contract, it degrades to `copy_from_slice`.

/// Copy `src` into `dst` (equal lengths), bypassing the cache when the
/// platform and alignment allow.
#[inline]
pub fn copy_stream(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len(), "copy_stream length mismatch");

    #[cfg(target_arch = "x86_64")]
    {
        let aligned = dst.as_ptr() as usize % 32 == 0
            && src.as_ptr() as usize % 32 == 0
            && dst.len() % 32 == 0;
        if aligned && !dst.is_empty() && std::arch::is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 presence checked; both slices 32-byte aligned
            // and a whole number of 32-byte lanes long.
            unsafe { copy_nt_avx2(dst, src) };
            return;
        }
    }

    dst.copy_from_slice(src);
}

/// # Safety
/// Requires AVX2, 32-byte-aligned `dst`/`src`, and `len % 32 == 0`.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn copy_nt_avx2(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::{
        __m256i, _mm_sfence, _mm256_stream_load_si256, _mm256_stream_si256,
    };

    let lanes = dst.len() / 32;
    let mut d = dst.as_mut_ptr() as *mut __m256i;
    let mut s = src.as_ptr() as *const __m256i;
    unsafe {
        for _ in 0..lanes {
            _mm256_stream_si256(d, _mm256_stream_load_si256(s));
            d = d.add(1);
            s = s.add(1);
        }
        // Streaming stores are weakly ordered; fence before the slot state
        // word is released so consumers observe complete payloads.
        _mm_sfence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gabbro_mmap::AlignedBuf;

    #[test]
    fn aligned_copy_matches_source() {
        let mut src = AlignedBuf::<i32>::zeroed(1024);
        for (i, v) in src.iter_mut().enumerate() {
            *v = i as i32 - 512;
        }
        let mut dst = AlignedBuf::<i32>::zeroed(1024);

        let src_bytes =
            unsafe { std::slice::from_raw_parts(src.as_ptr() as *const u8, 1024 * 4) };
        let dst_bytes =
            unsafe { std::slice::from_raw_parts_mut(dst.as_mut_ptr() as *mut u8, 1024 * 4) };
        copy_stream(dst_bytes, src_bytes);

        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn unaligned_copy_falls_back() {
        let src: Vec<u8> = (0..97).map(|i| i as u8).collect();
        let mut dst = vec![0u8; 97];
        copy_stream(&mut dst[..], &src[..]);
        assert_eq!(dst, src);
    }
}
