use tracing::trace;

use super::{GemmDescriptor, GemmOperand, GemmOperands};
use crate::{
    device::DeviceProperties, error::DescriptorError, precision::Precision,
    shader,
};

/// A synthesised GEMM kernel: every descriptor field resolved, the derived
/// layout metadata, and the emitted shader source. Immutable once
/// constructed and safe to share across threads.
#[derive(Debug, Clone)]
pub struct GemmKernel {
    pub matrix_dimensions: (u32, u32, u32),
    pub memory_precisions: GemmOperands<Precision>,
    pub register_precisions: GemmOperands<Precision>,
    pub transpose_state: (bool, bool),
    pub block_dimensions: (u16, u16, u16),
    pub leading_block_dimensions: GemmOperands<u16>,
    pub leading_dimensions: GemmOperands<u32>,
    pub splits: (u16, u16),
    /// Rows of C covered by one SIMD group: `Mb / splits.0`.
    pub register_m: u16,
    /// Columns of C covered by one SIMD group: `Nb / splits.1`.
    pub register_n: u16,
    pub threadgroup_size: u32,
    pub threadgroup_memory_allocation: u32,
    pub prefer_async_load: bool,
    pub prefer_async_store: bool,
    pub load_previous_c: bool,
    pub source: String,
}

impl GemmKernel {
    pub fn new(
        descriptor: &GemmDescriptor,
        device: &DeviceProperties,
    ) -> Result<Self, DescriptorError> {
        let (m, n, k) = descriptor.matrix_dimensions;
        if m == 0 || n == 0 || k == 0 {
            return Err(DescriptorError::ZeroDimension);
        }

        let memory = descriptor.memory_precisions;
        let register = resolve_register_precisions(descriptor)?;

        let block = descriptor
            .block_dimensions
            .unwrap_or_else(|| default_block_dimensions(&memory, device));
        let splits = descriptor.splits.unwrap_or((2, 2));
        let (mb, nb, kb) = block;
        let (splits_m, splits_n) = splits;
        if splits_m == 0
            || splits_n == 0
            || u32::from(mb) % (8 * u32::from(splits_m)) != 0
            || u32::from(nb) % (8 * u32::from(splits_n)) != 0
            || kb % 8 != 0
        {
            return Err(DescriptorError::MisalignedBlockDimensions {
                block,
                splits,
            });
        }

        let leading_block =
            resolve_leading_block_dimensions(descriptor, block)?;
        let leading = resolve_leading_dimensions(descriptor)?;

        let register_m = mb / splits_m;
        let register_n = nb / splits_n;
        let threadgroup_size = 32 * u32::from(splits_m) * u32::from(splits_n);
        if threadgroup_size > device.max_threads_per_threadgroup {
            return Err(DescriptorError::ThreadgroupSizeExceeded {
                threads: threadgroup_size,
                limit: device.max_threads_per_threadgroup,
            });
        }

        let (ta, tb) = descriptor.transpose_state;
        let a_block_bytes =
            block_bytes(leading_block.a, if ta { kb } else { mb }, memory.a);
        let b_block_bytes =
            block_bytes(leading_block.b, if tb { nb } else { kb }, memory.b);
        let c_block_bytes = block_bytes(leading_block.c, mb, memory.c);
        let threadgroup_memory_allocation =
            (a_block_bytes + b_block_bytes).max(c_block_bytes);
        if threadgroup_memory_allocation > device.threadgroup_memory_limit {
            return Err(DescriptorError::ThreadgroupMemoryExceeded {
                required: threadgroup_memory_allocation,
                limit: device.threadgroup_memory_limit,
            });
        }

        let mut kernel = Self {
            matrix_dimensions: descriptor.matrix_dimensions,
            memory_precisions: memory,
            register_precisions: register,
            transpose_state: descriptor.transpose_state,
            block_dimensions: block,
            leading_block_dimensions: leading_block,
            leading_dimensions: leading,
            splits,
            register_m,
            register_n,
            threadgroup_size,
            threadgroup_memory_allocation,
            prefer_async_load: descriptor.prefer_async_load,
            prefer_async_store: descriptor.prefer_async_store,
            load_previous_c: descriptor.load_previous_c,
            source: String::new(),
        };
        kernel.source = kernel.emit_source(descriptor, a_block_bytes);
        trace!(
            m,
            n,
            k,
            block_m = mb,
            block_n = nb,
            block_k = kb,
            threadgroup_size,
            threadgroup_memory_allocation,
            "synthesised gemm kernel"
        );
        Ok(kernel)
    }

    /// Tiles of C held per SIMD group along M: `register_m / 8`.
    fn tiles_m(&self) -> u16 {
        self.register_m / 8
    }

    fn tiles_n(&self) -> u16 {
        self.register_n / 8
    }

    fn emit_source(
        &self,
        descriptor: &GemmDescriptor,
        a_block_bytes: u32,
    ) -> String {
        let mut source = String::from(shader::PREAMBLE);
        source.push('\n');
        source.push_str(&self.emit_constants(descriptor));
        source.push('\n');
        source.push_str(&self.emit_kernel(a_block_bytes));
        source
    }

    fn emit_constants(&self, descriptor: &GemmDescriptor) -> String {
        let (mb, nb, kb) = self.block_dimensions;
        let (ta, tb) = self.transpose_state;
        // Device leading dimensions default to the packed extents implied
        // by the function constants; overrides bake as literals.
        let leading_a = match descriptor.leading_dimensions {
            Some(leading) => leading.a.to_string(),
            None => String::from(if ta { "M" } else { "K" }),
        };
        let leading_b = match descriptor.leading_dimensions {
            Some(leading) => leading.b.to_string(),
            None => String::from(if tb { "K" } else { "N" }),
        };
        let leading_c = match descriptor.leading_dimensions {
            Some(leading) => leading.c.to_string(),
            None => String::from("N"),
        };
        format!(
            "constant uint M [[function_constant(0)]];\n\
             constant uint N [[function_constant(1)]];\n\
             constant uint K [[function_constant(2)]];\n\
             \n\
             constant ushort BLOCK_M = {mb};\n\
             constant ushort BLOCK_N = {nb};\n\
             constant ushort BLOCK_K = {kb};\n\
             constant ushort LEADING_BLOCK_A = {lba};\n\
             constant ushort LEADING_BLOCK_B = {lbb};\n\
             constant ushort LEADING_BLOCK_C = {lbc};\n\
             \n\
             constant uint LEADING_A = {leading_a};\n\
             constant uint LEADING_B = {leading_b};\n\
             constant uint LEADING_C = {leading_c};\n\
             \n\
             // Residue of the trailing edge block along each axis.\n\
             constant uint M_SHIFT = \
             (M % BLOCK_M == 0) ? 0 : BLOCK_M - M % BLOCK_M;\n\
             constant uint N_SHIFT = \
             (N % BLOCK_N == 0) ? 0 : BLOCK_N - N % BLOCK_N;\n",
            lba = self.leading_block_dimensions.a,
            lbb = self.leading_block_dimensions.b,
            lbc = self.leading_block_dimensions.c,
        )
    }

    fn emit_kernel(&self, a_block_bytes: u32) -> String {
        let mem_a = self.memory_precisions.a.shader_name();
        let mem_b = self.memory_precisions.b.shader_name();
        let mem_c = self.memory_precisions.c.shader_name();
        let reg_c = self.register_precisions.c.shader_name();
        let rm = self.tiles_m();
        let rn = self.tiles_n();
        let splits_n = self.splits.1;

        let pull_back = if self.load_previous_c {
            // Overlapped blocks would race on the accumulate
            // read-modify-write, so edge blocks keep their origin and the
            // store path clips the copy window instead.
            String::new()
        } else {
            "  // Trailing-edge blocks shift back by the residue so the\n\
             \x20 // store covers a full block; overlapped rows are\n\
             \x20 // recomputed identically.\n\
             \x20 if (m0 + BLOCK_M > M && M >= BLOCK_M) {\n\
             \x20   m0 -= M_SHIFT;\n\
             \x20 }\n\
             \x20 if (n0 + BLOCK_N > N && N >= BLOCK_N) {\n\
             \x20   n0 -= N_SHIFT;\n\
             \x20 }\n"
                .to_string()
        };

        let direct_c = if self.prefer_async_store {
            "false".to_string()
        } else {
            "(m0 + BLOCK_M <= M) && (n0 + BLOCK_N <= N)".to_string()
        };

        let init_c = if self.load_previous_c {
            self.emit_load_previous_c()
        } else {
            format!(
                "  #pragma clang loop unroll(full)\n\
                 \x20 for (ushort i = 0; i < {rm}; ++i) {{\n\
                 \x20   #pragma clang loop unroll(full)\n\
                 \x20   for (ushort j = 0; j < {rn}; ++j) {{\n\
                 \x20     c_frags[i][j] = \
                 make_filled_simdgroup_matrix<{reg_c}, 8, 8>(0);\n\
                 \x20   }}\n\
                 \x20 }}\n"
            )
        };

        let k_loop = self.emit_k_loop();
        let store_c = self.emit_store_c();

        format!(
            "kernel void gemm(device {mem_a} *A [[buffer(0)]],\n\
             \x20                device {mem_b} *B [[buffer(1)]],\n\
             \x20                device {mem_c} *C [[buffer(2)]],\n\
             \x20                threadgroup uchar *block_memory \
             [[threadgroup(0)]],\n\
             \x20                uint2 group_id \
             [[threadgroup_position_in_grid]],\n\
             \x20                ushort simd_id \
             [[simdgroup_index_in_threadgroup]],\n\
             \x20                ushort lane_id \
             [[thread_index_in_simdgroup]]) {{\n\
             \x20 threadgroup {mem_a} *block_a = \
             (threadgroup {mem_a} *)block_memory;\n\
             \x20 threadgroup {mem_b} *block_b =\n\
             \x20     (threadgroup {mem_b} *)(block_memory + \
             {a_block_bytes});\n\
             \x20 threadgroup {mem_c} *block_c = \
             (threadgroup {mem_c} *)block_memory;\n\
             \n\
             \x20 uint m0 = group_id.y * BLOCK_M;\n\
             \x20 uint n0 = group_id.x * BLOCK_N;\n\
             \x20 if (m0 >= M || n0 >= N) {{\n\
             \x20   return;\n\
             \x20 }}\n\
             {pull_back}\
             \x20 ushort sid_m = simd_id / {splits_n};\n\
             \x20 ushort sid_n = simd_id % {splits_n};\n\
             \x20 ushort offset_m = sid_m * {register_m};\n\
             \x20 ushort offset_n = sid_n * {register_n};\n\
             \n\
             \x20 bool direct_c = {direct_c};\n\
             \n\
             \x20 simdgroup_matrix<{reg_c}, 8, 8> c_frags[{rm}][{rn}];\n\
             {init_c}\
             \n\
             \x20 for (uint k0 = 0; k0 < K; k0 += BLOCK_K) {{\n\
             {k_loop}\
             \x20 }}\n\
             \n\
             {store_c}\
             }}\n",
            register_m = self.register_m,
            register_n = self.register_n,
        )
    }

    fn emit_load_previous_c(&self) -> String {
        let rm = self.tiles_m();
        let rn = self.tiles_n();
        let direct_tile = self.load_c_tile_statement(
            "C + (m0 + offset_m + i * 8) * LEADING_C + n0 + offset_n + j * 8",
            "LEADING_C",
            "      ",
        );
        let staged_tile = self.load_c_tile_statement(
            "block_c + (offset_m + i * 8) * LEADING_BLOCK_C + offset_n + \
             j * 8",
            "LEADING_BLOCK_C",
            "      ",
        );
        format!(
            "  if (direct_c) {{\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort i = 0; i < {rm}; ++i) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort j = 0; j < {rn}; ++j) {{\n\
             {direct_tile}\
             \x20     }}\n\
             \x20   }}\n\
             \x20 }} else {{\n\
             \x20   // Stage the valid window of C; the copy zero-fills the\n\
             \x20   // remainder, and clipped rows are never stored back.\n\
             \x20   if (simd_id == 0 && lane_id == 0) {{\n\
             \x20     uint valid_m = min(uint(BLOCK_M), M - m0);\n\
             \x20     uint valid_n = min(uint(BLOCK_N), N - n0);\n\
             \x20     block_event event;\n\
             \x20     event.copy_device_to_threadgroup(\n\
             \x20         block_c, LEADING_BLOCK_C, \
             ushort2(BLOCK_N, BLOCK_M),\n\
             \x20         C + m0 * LEADING_C + n0, LEADING_C,\n\
             \x20         ushort2(valid_n, valid_m));\n\
             \x20     block_event::wait(1, &event);\n\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort i = 0; i < {rm}; ++i) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort j = 0; j < {rn}; ++j) {{\n\
             {staged_tile}\
             \x20     }}\n\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20 }}\n"
        )
    }

    fn load_c_tile_statement(
        &self,
        pointer: &str,
        stride: &str,
        indent: &str,
    ) -> String {
        let mem_c = self.memory_precisions.c.shader_name();
        let reg_c = self.register_precisions.c.shader_name();
        if self.memory_precisions.c == self.register_precisions.c {
            format!(
                "{indent}simdgroup_load(c_frags[i][j],\n\
                 {indent}               {pointer},\n\
                 {indent}               {stride});\n"
            )
        } else {
            format!(
                "{indent}simdgroup_matrix<{mem_c}, 8, 8> c_raw;\n\
                 {indent}simdgroup_load(c_raw,\n\
                 {indent}               {pointer},\n\
                 {indent}               {stride});\n\
                 {indent}c_frags[i][j] = tile_cast<{mem_c}, {reg_c}>(c_raw);\n"
            )
        }
    }

    fn emit_k_loop(&self) -> String {
        let staged = self.emit_staged_iteration();
        if self.prefer_async_load {
            return staged;
        }
        let direct = self.emit_multiply(true, "      ");
        format!(
            "    if (m0 + BLOCK_M <= M && n0 + BLOCK_N <= N &&\n\
             \x20       k0 + BLOCK_K <= K) {{\n\
             {direct}\
             \x20   }} else {{\n\
             {staged}\
             \x20   }}\n"
        )
    }

    fn emit_staged_iteration(&self) -> String {
        let (ta, tb) = self.transpose_state;
        let (a_offset, a_cols, a_rows) = if ta {
            (
                "A + k0 * LEADING_A + m0",
                "min(uint(BLOCK_M), M - m0)",
                "min(uint(BLOCK_K), K - k0)",
            )
        } else {
            (
                "A + m0 * LEADING_A + k0",
                "min(uint(BLOCK_K), K - k0)",
                "min(uint(BLOCK_M), M - m0)",
            )
        };
        let (b_offset, b_cols, b_rows) = if tb {
            (
                "B + n0 * LEADING_B + k0",
                "min(uint(BLOCK_K), K - k0)",
                "min(uint(BLOCK_N), N - n0)",
            )
        } else {
            (
                "B + k0 * LEADING_B + n0",
                "min(uint(BLOCK_N), N - n0)",
                "min(uint(BLOCK_K), K - k0)",
            )
        };
        let (a_slab_cols, a_slab_rows) = if ta {
            ("BLOCK_M", "BLOCK_K")
        } else {
            ("BLOCK_K", "BLOCK_M")
        };
        let (b_slab_cols, b_slab_rows) = if tb {
            ("BLOCK_K", "BLOCK_N")
        } else {
            ("BLOCK_N", "BLOCK_K")
        };
        let multiply = self.emit_multiply(false, "      ");
        format!(
            "      if (simd_id == 0 && lane_id == 0) {{\n\
             \x20       block_event events[2];\n\
             \x20       events[0].copy_device_to_threadgroup(\n\
             \x20           block_a, LEADING_BLOCK_A,\n\
             \x20           ushort2({a_slab_cols}, {a_slab_rows}),\n\
             \x20           {a_offset}, LEADING_A,\n\
             \x20           ushort2({a_cols}, {a_rows}));\n\
             \x20       events[1].copy_device_to_threadgroup(\n\
             \x20           block_b, LEADING_BLOCK_B,\n\
             \x20           ushort2({b_slab_cols}, {b_slab_rows}),\n\
             \x20           {b_offset}, LEADING_B,\n\
             \x20           ushort2({b_cols}, {b_rows}));\n\
             \x20       block_event::wait(2, events);\n\
             \x20     }}\n\
             \x20     threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             {multiply}\
             \x20     threadgroup_barrier(mem_flags::mem_threadgroup);\n"
        )
    }

    fn emit_multiply(&self, from_device: bool, indent: &str) -> String {
        let rm = self.tiles_m();
        let rn = self.tiles_n();
        let reg_a = self.register_precisions.a;
        let reg_b = self.register_precisions.b;
        let (ta, tb) = self.transpose_state;

        let a_load = if from_device {
            if ta {
                operand_load_statement(
                    "a_frags[i]",
                    "A + (k0 + kk) * LEADING_A + m0 + offset_m + i * 8",
                    "LEADING_A",
                    true,
                    self.memory_precisions.a,
                    reg_a,
                    "a_raw",
                    &format!("{indent}    "),
                )
            } else {
                operand_load_statement(
                    "a_frags[i]",
                    "A + (m0 + offset_m + i * 8) * LEADING_A + k0 + kk",
                    "LEADING_A",
                    false,
                    self.memory_precisions.a,
                    reg_a,
                    "a_raw",
                    &format!("{indent}    "),
                )
            }
        } else if ta {
            operand_load_statement(
                "a_frags[i]",
                "block_a + kk * LEADING_BLOCK_A + offset_m + i * 8",
                "LEADING_BLOCK_A",
                true,
                self.memory_precisions.a,
                reg_a,
                "a_raw",
                &format!("{indent}    "),
            )
        } else {
            operand_load_statement(
                "a_frags[i]",
                "block_a + (offset_m + i * 8) * LEADING_BLOCK_A + kk",
                "LEADING_BLOCK_A",
                false,
                self.memory_precisions.a,
                reg_a,
                "a_raw",
                &format!("{indent}    "),
            )
        };

        let b_load = if from_device {
            if tb {
                operand_load_statement(
                    "b_frags[j]",
                    "B + (n0 + offset_n + j * 8) * LEADING_B + k0 + kk",
                    "LEADING_B",
                    true,
                    self.memory_precisions.b,
                    reg_b,
                    "b_raw",
                    &format!("{indent}    "),
                )
            } else {
                operand_load_statement(
                    "b_frags[j]",
                    "B + (k0 + kk) * LEADING_B + n0 + offset_n + j * 8",
                    "LEADING_B",
                    false,
                    self.memory_precisions.b,
                    reg_b,
                    "b_raw",
                    &format!("{indent}    "),
                )
            }
        } else if tb {
            operand_load_statement(
                "b_frags[j]",
                "block_b + (offset_n + j * 8) * LEADING_BLOCK_B + kk",
                "LEADING_BLOCK_B",
                true,
                self.memory_precisions.b,
                reg_b,
                "b_raw",
                &format!("{indent}    "),
            )
        } else {
            operand_load_statement(
                "b_frags[j]",
                "block_b + kk * LEADING_BLOCK_B + offset_n + j * 8",
                "LEADING_BLOCK_B",
                false,
                self.memory_precisions.b,
                reg_b,
                "b_raw",
                &format!("{indent}    "),
            )
        };

        format!(
            "{indent}#pragma clang loop unroll(full)\n\
             {indent}for (ushort kk = 0; kk < BLOCK_K; kk += 8) {{\n\
             {indent}  simdgroup_matrix<{reg_a}, 8, 8> a_frags[{rm}];\n\
             {indent}  #pragma clang loop unroll(full)\n\
             {indent}  for (ushort i = 0; i < {rm}; ++i) {{\n\
             {a_load}\
             {indent}  }}\n\
             {indent}  simdgroup_matrix<{reg_b}, 8, 8> b_frags[{rn}];\n\
             {indent}  #pragma clang loop unroll(full)\n\
             {indent}  for (ushort j = 0; j < {rn}; ++j) {{\n\
             {b_load}\
             {indent}  }}\n\
             {indent}  #pragma clang loop unroll(full)\n\
             {indent}  for (ushort i = 0; i < {rm}; ++i) {{\n\
             {indent}    #pragma clang loop unroll(full)\n\
             {indent}    for (ushort j = 0; j < {rn}; ++j) {{\n\
             {indent}      simdgroup_multiply_accumulate(\n\
             {indent}          c_frags[i][j], a_frags[i], b_frags[j],\n\
             {indent}          c_frags[i][j]);\n\
             {indent}    }}\n\
             {indent}  }}\n\
             {indent}}}\n",
            reg_a = reg_a.shader_name(),
            reg_b = reg_b.shader_name(),
        )
    }

    fn emit_store_c(&self) -> String {
        let rm = self.tiles_m();
        let rn = self.tiles_n();
        let mem_c = self.memory_precisions.c;
        let reg_c = self.register_precisions.c;
        let tile = if mem_c == reg_c {
            "c_frags[i][j]".to_string()
        } else {
            format!(
                "tile_cast<{}, {}>(c_frags[i][j])",
                reg_c.shader_name(),
                mem_c.shader_name()
            )
        };
        format!(
            "  if (direct_c) {{\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort i = 0; i < {rm}; ++i) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort j = 0; j < {rn}; ++j) {{\n\
             \x20       simdgroup_store(\n\
             \x20           {tile},\n\
             \x20           C + (m0 + offset_m + i * 8) * LEADING_C + n0 +\n\
             \x20               offset_n + j * 8,\n\
             \x20           LEADING_C);\n\
             \x20     }}\n\
             \x20   }}\n\
             \x20 }} else {{\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort i = 0; i < {rm}; ++i) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort j = 0; j < {rn}; ++j) {{\n\
             \x20       simdgroup_store(\n\
             \x20           {tile},\n\
             \x20           block_c + (offset_m + i * 8) * LEADING_BLOCK_C +\n\
             \x20               offset_n + j * 8,\n\
             \x20           LEADING_BLOCK_C);\n\
             \x20     }}\n\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   if (simd_id == 0 && lane_id == 0) {{\n\
             \x20     uint valid_m = min(uint(BLOCK_M), M - m0);\n\
             \x20     uint valid_n = min(uint(BLOCK_N), N - n0);\n\
             \x20     block_event event;\n\
             \x20     event.copy_threadgroup_to_device(\n\
             \x20         C + m0 * LEADING_C + n0, LEADING_C,\n\
             \x20         ushort2(valid_n, valid_m),\n\
             \x20         block_c, LEADING_BLOCK_C, \
             ushort2(valid_n, valid_m));\n\
             \x20     block_event::wait(1, &event);\n\
             \x20   }}\n\
             \x20 }}\n"
        )
    }
}

/// Emits one register-tile load, converting at the threadgroup-to-register
/// boundary when the register precision widens the memory precision.
#[allow(clippy::too_many_arguments)]
fn operand_load_statement(
    target: &str,
    pointer: &str,
    stride: &str,
    transpose: bool,
    memory: Precision,
    register: Precision,
    raw_name: &str,
    indent: &str,
) -> String {
    let tail = if transpose {
        ", ulong2(0, 0), true"
    } else {
        ""
    };
    if memory == register {
        format!(
            "{indent}simdgroup_load({target},\n\
             {indent}               {pointer},\n\
             {indent}               {stride}{tail});\n"
        )
    } else {
        format!(
            "{indent}simdgroup_matrix<{mem}, 8, 8> {raw_name};\n\
             {indent}simdgroup_load({raw_name},\n\
             {indent}               {pointer},\n\
             {indent}               {stride}{tail});\n\
             {indent}{target} = tile_cast<{mem}, {reg}>({raw_name});\n",
            mem = memory.shader_name(),
            reg = register.shader_name(),
        )
    }
}

fn block_bytes(leading: u16, trailing: u16, precision: Precision) -> u32 {
    u32::from(leading)
        * u32::from(trailing)
        * precision.size_in_bytes() as u32
}

fn resolve_register_precisions(
    descriptor: &GemmDescriptor,
) -> Result<GemmOperands<Precision>, DescriptorError> {
    let memory = descriptor.memory_precisions;
    let register = descriptor.register_precisions.unwrap_or(GemmOperands {
        a: memory.a.default_register(),
        b: memory.b.default_register(),
        c: memory.c.default_register(),
    });
    for operand in [GemmOperand::A, GemmOperand::B, GemmOperand::C] {
        let memory = memory.get(operand);
        let register = register.get(operand);
        if !memory.supports_register(register) {
            return Err(DescriptorError::IncompatibleRegisterPrecision {
                operand,
                memory,
                register,
            });
        }
    }
    if register.c == Precision::BF16 {
        return Err(DescriptorError::Bf16Accumulator);
    }
    Ok(register)
}

/// Expected leading block dimension per operand: the untransposed-column
/// extent, or the untransposed-row extent once transposed. Overrides must
/// cover the expected extent.
fn resolve_leading_block_dimensions(
    descriptor: &GemmDescriptor,
    block: (u16, u16, u16),
) -> Result<GemmOperands<u16>, DescriptorError> {
    let (mb, nb, kb) = block;
    let (ta, tb) = descriptor.transpose_state;
    let expected = GemmOperands {
        a: if ta { mb } else { kb },
        b: if tb { kb } else { nb },
        c: nb,
    };
    let Some(provided) = descriptor.leading_block_dimensions else {
        return Ok(expected);
    };
    for operand in [GemmOperand::A, GemmOperand::B, GemmOperand::C] {
        let provided = provided.get(operand);
        let expected = expected.get(operand);
        if provided < expected {
            return Err(DescriptorError::LeadingBlockDimensionTooSmall {
                operand,
                provided,
                expected,
            });
        }
    }
    Ok(provided)
}

fn resolve_leading_dimensions(
    descriptor: &GemmDescriptor,
) -> Result<GemmOperands<u32>, DescriptorError> {
    let (m, n, k) = descriptor.matrix_dimensions;
    let (ta, tb) = descriptor.transpose_state;
    let expected = GemmOperands {
        a: if ta { m } else { k },
        b: if tb { k } else { n },
        c: n,
    };
    let Some(provided) = descriptor.leading_dimensions else {
        return Ok(expected);
    };
    for operand in [GemmOperand::A, GemmOperand::B, GemmOperand::C] {
        let provided = provided.get(operand);
        let expected = expected.get(operand);
        if provided < expected {
            return Err(DescriptorError::LeadingDimensionTooSmall {
                operand,
                provided,
                expected,
            });
        }
    }
    Ok(provided)
}

/// Rule table for the default tile, keyed by the memory precisions and the
/// device class. Pure-F32 operands run register limited and take a short
/// depth; mixed precision fills a larger tile.
fn default_block_dimensions(
    memory: &GemmOperands<Precision>,
    device: &DeviceProperties,
) -> (u16, u16, u16) {
    let all_f32 = memory.a == Precision::F32
        && memory.b == Precision::F32
        && memory.c == Precision::F32;
    if all_f32 {
        (32, 32, 8)
    } else if device.class.is_high_performance() {
        (48, 48, 32)
    } else {
        (32, 32, 32)
    }
}
