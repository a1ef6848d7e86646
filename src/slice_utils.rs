/// Writes `bytes` into `slice` at `offset`, without re-checking bounds.
///
/// # Safety
///
/// Caller must ensure `offset + N <= slice.len()`.
pub unsafe fn write_to_offset_unchecked<const N: usize>(
    slice: &mut [u8],
    offset: usize,
    bytes: [u8; N],
) {
    debug_assert!(offset + N <= slice.len());

    let (_front, rest) = unsafe { slice.split_at_mut_unchecked(offset) };
    let (target, _rest) = unsafe { rest.split_at_mut_unchecked(N) };
    target.copy_from_slice(&bytes)
}
