//! Shared MSL preamble emitted into every synthesised kernel: the 8x8
//! register-tile thread layout, precision casts, row reductions over tile
//! rows, and the async-copy event wrapper.

/// Preamble text. Every helper is METAL_FUNC so the compiler inlines it;
/// the tile layout documented on `tile_origin` is the contract the
/// per-element code in the attention kernels relies on.
pub(crate) const PREAMBLE: &str = r#"#include <metal_stdlib>
using namespace metal;

// An 8x8 simdgroup tile distributes two horizontally adjacent elements to
// each of the 32 lanes. For a lane, origin.x is the column of its first
// element and origin.y its row:
//   row    = (quad / 4) * 4 + (lane / 2) % 4
//   column = (quad & 2) * 2 + (lane % 2) * 2        (quad = lane / 4)
// Lanes sharing a row differ only in lane bits 3 and 0, which is what the
// row reductions below shuffle over.
METAL_FUNC ushort2 tile_origin(ushort lane) {
  ushort quad = lane / 4;
  ushort row = (quad / 4) * 4 + (lane / 2) % 4;
  ushort column = (quad & 2) * 2 + (lane % 2) * 2;
  return ushort2(column, row);
}

template <typename T, typename U>
METAL_FUNC simdgroup_matrix<U, 8, 8>
tile_cast(thread const simdgroup_matrix<T, 8, 8> &src) {
  simdgroup_matrix<U, 8, 8> dst;
  dst.thread_elements()[0] = U(src.thread_elements()[0]);
  dst.thread_elements()[1] = U(src.thread_elements()[1]);
  return dst;
}

template <typename T>
METAL_FUNC float2 tile_elements(thread const simdgroup_matrix<T, 8, 8> &m) {
  return float2(float(m.thread_elements()[0]),
                float(m.thread_elements()[1]));
}

// Reduce the two in-thread elements and the four lanes sharing a tile row.
// The result is broadcast to every lane of the row.
METAL_FUNC float tile_row_max(float2 e) {
  float m = max(e[0], e[1]);
  m = max(m, simd_shuffle_xor(m, ushort(1)));
  m = max(m, simd_shuffle_xor(m, ushort(8)));
  return m;
}

METAL_FUNC float tile_row_sum(float2 e) {
  float s = e[0] + e[1];
  s += simd_shuffle_xor(s, ushort(1));
  s += simd_shuffle_xor(s, ushort(8));
  return s;
}

// Bulk 2D transfer between device and threadgroup memory with a
// completion event. One lane issues the copy. Inbound copies name the
// full destination slab and the clamped source window; the hardware
// zero-fills the remainder, so edge tiles never contribute stale data.
// Tile extents are (columns, rows).
struct block_event {
  __metal_simdgroup_event_t handle;

  template <typename T>
  METAL_FUNC void
  copy_device_to_threadgroup(threadgroup T *dst, ushort dst_stride,
                             ushort2 dst_tile, const device T *src,
                             uint src_stride, ushort2 src_tile) {
    handle = __metal_simdgroup_async_copy_2d(
        sizeof(T), alignof(T), reinterpret_cast<threadgroup void *>(dst),
        ulong(dst_stride), 1, ulong2(dst_tile),
        reinterpret_cast<const device void *>(src), ulong(src_stride), 1,
        ulong2(src_tile), long2(0), 1);
  }

  template <typename T>
  METAL_FUNC void
  copy_threadgroup_to_device(device T *dst, uint dst_stride,
                             ushort2 dst_tile, const threadgroup T *src,
                             ushort src_stride, ushort2 src_tile) {
    handle = __metal_simdgroup_async_copy_2d(
        sizeof(T), alignof(T), reinterpret_cast<device void *>(dst),
        ulong(dst_stride), 1, ulong2(dst_tile),
        reinterpret_cast<const threadgroup void *>(src), ulong(src_stride),
        1, ulong2(src_tile), long2(0), 0);
  }

  METAL_FUNC static void wait(int count, thread block_event *events) {
    __metal_wait_simdgroup_events(
        count,
        reinterpret_cast<thread __metal_simdgroup_event_t *>(events));
  }
};
"#;
