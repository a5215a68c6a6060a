use bytemuck::Pod;
use tilepipe_runtime::{CoreContext, DeviceResult, Element, Int4x2, LocalTensor};

/// `dst[i] = func(src[i])` over the shorter of the two tensors.
pub fn vec_map<S: Pod, D: Pod>(
    ctx: &mut CoreContext<'_>,
    dst: LocalTensor<D>,
    src: LocalTensor<S>,
    func: impl Fn(S) -> D,
) -> DeviceResult {
    let len = dst.len().min(src.len());
    let input = ctx.resource().slice(src.slice(0, len))?.to_vec();
    let output = ctx.resource_mut().slice_mut(dst.slice(0, len))?;

    for (out, value) in output.iter_mut().zip(input) {
        *out = func(value);
    }
    ctx.stats_mut().vector_ops += 1;
    Ok(())
}

/// `dst[i] = func(lhs[i], rhs[i])`. `dst` may alias either input.
pub fn vec_zip<L: Pod, R: Pod, D: Pod>(
    ctx: &mut CoreContext<'_>,
    dst: LocalTensor<D>,
    lhs: LocalTensor<L>,
    rhs: LocalTensor<R>,
    func: impl Fn(L, R) -> D,
) -> DeviceResult {
    let len = dst.len().min(lhs.len()).min(rhs.len());
    let left = ctx.resource().slice(lhs.slice(0, len))?.to_vec();
    let right = ctx.resource().slice(rhs.slice(0, len))?.to_vec();
    let output = ctx.resource_mut().slice_mut(dst.slice(0, len))?;

    for ((out, l), r) in output.iter_mut().zip(left).zip(right) {
        *out = func(l, r);
    }
    ctx.stats_mut().vector_ops += 1;
    Ok(())
}

pub fn vec_cast<S: Element, D: Element>(
    ctx: &mut CoreContext<'_>,
    dst: LocalTensor<D>,
    src: LocalTensor<S>,
) -> DeviceResult {
    vec_map(ctx, dst, src, |value| value.cast::<D>())
}

pub fn vec_dup<E: Pod>(ctx: &mut CoreContext<'_>, dst: LocalTensor<E>, value: E) -> DeviceResult {
    ctx.resource_mut().slice_mut(dst)?.fill(value);
    ctx.stats_mut().vector_ops += 1;
    Ok(())
}

/// Expands packed int4 values to int8. `first` is the nibble index of `src` the first output
/// element comes from, so odd starting positions are supported.
pub fn vec_unpack_int4(
    ctx: &mut CoreContext<'_>,
    dst: LocalTensor<i8>,
    src: LocalTensor<Int4x2>,
    first: usize,
) -> DeviceResult {
    let packed = ctx.resource().slice(src)?.to_vec();
    let output = ctx.resource_mut().slice_mut(dst)?;
    let available = (packed.len() * 2).saturating_sub(first);

    for (i, out) in output.iter_mut().take(available).enumerate() {
        let nibble = first + i;
        let byte = packed[nibble / 2];
        *out = if nibble % 2 == 0 { byte.even() } else { byte.odd() };
    }
    ctx.stats_mut().vector_ops += 1;
    Ok(())
}
