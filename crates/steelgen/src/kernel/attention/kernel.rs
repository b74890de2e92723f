use tracing::trace;

use super::{AttentionDescriptor, AttentionKernelType};
use crate::{
    device::DeviceProperties,
    dispatch::ceil_to_multiple,
    error::DescriptorError,
    kernel::attention::AttentionOperands,
    precision::Precision,
    shader,
};

/// Bytes of the dS^T scratch element and the derivative outputs. The
/// scratch is BF16 to halve bandwidth; dS is a bounded small quantity, so
/// the precision suffices. Derivatives and row statistics accumulate and
/// land in F32.
const DERIVATIVE_ST_PRECISION: Precision = Precision::BF16;

/// A synthesised attention kernel. The three kernel types share the
/// streaming-softmax skeleton: forward and backward-query parallelise over
/// rows of the score matrix and stream its columns; backward-key-value
/// parallelises over columns and streams rows, consuming the L and D row
/// statistics the first two produce.
#[derive(Debug, Clone)]
pub struct AttentionKernel {
    pub kernel_type: AttentionKernelType,
    pub matrix_dimensions: (u32, u32, u16),
    pub memory_precisions: AttentionOperands<Precision>,
    pub transpose_state: AttentionOperands<bool>,
    /// (Rb, Cb) blocking of the score matrix.
    pub block_dimensions: (u16, u16),
    pub threadgroup_size: u32,
    pub threadgroup_memory_allocation: u32,
    /// Row stride of the dS^T scratch: C rounded up to a whole number of
    /// column blocks, so every block boundary is aligned. Always >= C;
    /// the padded tail of each scratch row is garbage and must not be
    /// read back.
    pub leading_dimension_derivative_st: u32,
    pub source: String,
}

impl AttentionKernel {
    pub fn new(
        descriptor: &AttentionDescriptor,
        device: &DeviceProperties,
    ) -> Result<Self, DescriptorError> {
        let (r, c, d) = descriptor.matrix_dimensions;
        if r == 0 || c == 0 || d == 0 {
            return Err(DescriptorError::ZeroDimension);
        }

        let (block, allocation) =
            select_block_dimensions(descriptor, device)?;
        let (block_r, block_c) = block;
        let parallel_block = match descriptor.kernel_type {
            AttentionKernelType::BackwardKeyValue { .. } => block_c,
            _ => block_r,
        };
        let threadgroup_size = 32 * u32::from(parallel_block / 8);
        if threadgroup_size > device.max_threads_per_threadgroup {
            return Err(DescriptorError::ThreadgroupSizeExceeded {
                threads: threadgroup_size,
                limit: device.max_threads_per_threadgroup,
            });
        }
        let leading_dimension_derivative_st = ceil_to_multiple(c, block_c);

        let mut kernel = Self {
            kernel_type: descriptor.kernel_type,
            matrix_dimensions: descriptor.matrix_dimensions,
            memory_precisions: descriptor.memory_precisions,
            transpose_state: descriptor.transpose_state,
            block_dimensions: block,
            threadgroup_size,
            threadgroup_memory_allocation: allocation,
            leading_dimension_derivative_st,
            source: String::new(),
        };
        kernel.source = kernel.emit_source();
        trace!(
            r,
            c,
            d,
            kernel_type = ?descriptor.kernel_type,
            block_r,
            block_c,
            threadgroup_size,
            allocation,
            "synthesised attention kernel"
        );
        Ok(kernel)
    }

    fn head_block(&self) -> u16 {
        ceil_to_multiple(u32::from(self.matrix_dimensions.2), 8) as u16
    }

    fn head_tiles(&self) -> u16 {
        self.head_block() / 8
    }

    fn emit_source(&self) -> String {
        let mut source = String::from(shader::PREAMBLE);
        source.push('\n');
        source.push_str(&self.emit_constants());
        source.push('\n');
        match self.kernel_type {
            AttentionKernelType::Forward { store_logsumexp } => {
                source.push_str(&self.emit_forward(store_logsumexp));
            }
            AttentionKernelType::BackwardQuery {
                store_derivative_st,
            } => {
                source
                    .push_str(&self.emit_backward_query(store_derivative_st));
            }
            AttentionKernelType::BackwardKeyValue {
                store_derivative_st,
            } => {
                source.push_str(
                    &self.emit_backward_key_value(store_derivative_st),
                );
            }
        }
        source
    }

    fn emit_constants(&self) -> String {
        let (block_r, block_c) = self.block_dimensions;
        let head_block = self.head_block();
        let leading_q = leading_expression(self.transpose_state.q, "R");
        let leading_k = leading_expression(self.transpose_state.k, "C");
        let leading_v = leading_expression(self.transpose_state.v, "C");
        let leading_o = leading_expression(self.transpose_state.o, "R");
        let scratch = if self.stores_derivative_st() {
            format!(
                "constant uint LEADING_DST = {};\n",
                self.leading_dimension_derivative_st
            )
        } else {
            String::new()
        };
        format!(
            "constant uint R [[function_constant(0)]];\n\
             constant uint C [[function_constant(1)]];\n\
             constant ushort D [[function_constant(2)]];\n\
             \n\
             constant ushort BLOCK_R = {block_r};\n\
             constant ushort BLOCK_C = {block_c};\n\
             constant ushort HEAD_BLOCK = {head_block};\n\
             \n\
             constant uint LEADING_Q = {leading_q};\n\
             constant uint LEADING_K = {leading_k};\n\
             constant uint LEADING_V = {leading_v};\n\
             constant uint LEADING_O = {leading_o};\n\
             {scratch}"
        )
    }

    fn stores_derivative_st(&self) -> bool {
        matches!(
            self.kernel_type,
            AttentionKernelType::BackwardQuery {
                store_derivative_st: true,
            } | AttentionKernelType::BackwardKeyValue {
                store_derivative_st: true,
            }
        )
    }

    fn layout(&self) -> MemoryLayout {
        MemoryLayout::new(self)
    }

    // Forward: one threadgroup owns BLOCK_R rows, streams the columns with
    // an online softmax, and writes O and optionally L.
    fn emit_forward(&self, store_logsumexp: bool) -> String {
        let layout = self.layout();
        let dtiles = self.head_tiles();
        let ctiles = self.block_dimensions.1 / 8;
        let mem = self.memory_precisions;
        let state = self.transpose_state;

        let l_buffer = if store_logsumexp {
            "                      device float *L_terms [[buffer(4)]],\n"
        } else {
            ""
        };

        let stage_q = stage_slab(
            "event",
            "block_q",
            "Q",
            "LEADING_Q",
            state.q,
            "r0",
            "BLOCK_R",
            "R",
            "    ",
        );
        let load_q = tile_load(
            "q_frags[d]",
            "block_q",
            state.q,
            false,
            "simd_id * 8",
            "d * 8",
            "BLOCK_R",
            mem.q,
            "q_raw",
            "    ",
        );
        let stage_kv = self.emit_kv_staging("    ");
        let load_kt = tile_load(
            "k_frag",
            "block_k",
            state.k,
            true,
            "c * 8",
            "d * 8",
            "BLOCK_C",
            mem.k,
            "k_raw",
            "        ",
        );
        let load_v = tile_load(
            "v_frag",
            "block_v",
            state.v,
            false,
            "c * 8",
            "d * 8",
            "BLOCK_C",
            mem.v,
            "v_raw",
            "        ",
        );
        let store_o = self.emit_row_output_store(
            "O",
            "LEADING_O",
            "o_frags",
            mem.o,
            state.o,
            "block_o",
        );
        let write_l = if store_logsumexp {
            "  if (origin.x == 0 && row < R) {\n\
             \x20   L_terms[row] = m_running + log2(l_running);\n\
             \x20 }\n"
        } else {
            ""
        };

        format!(
            "kernel void attention(device {q} *Q [[buffer(0)]],\n\
             \x20                     device {k} *K [[buffer(1)]],\n\
             \x20                     device {v} *V [[buffer(2)]],\n\
             \x20                     device {o} *O [[buffer(3)]],\n\
             {l_buffer}\
             \x20                     threadgroup uchar *block_memory \
             [[threadgroup(0)]],\n\
             \x20                     uint2 group_id \
             [[threadgroup_position_in_grid]],\n\
             \x20                     ushort simd_id \
             [[simdgroup_index_in_threadgroup]],\n\
             \x20                     ushort lane_id \
             [[thread_index_in_simdgroup]]) {{\n\
             \x20 uint r0 = group_id.x * BLOCK_R;\n\
             \x20 if (r0 >= R) {{\n\
             \x20   return;\n\
             \x20 }}\n\
             \x20 ushort2 origin = tile_origin(lane_id);\n\
             \x20 uint row = r0 + simd_id * 8 + origin.y;\n\
             \n\
             \x20 // Scores fold rsqrt(D) and log2(e) so the streaming\n\
             \x20 // softmax evaluates exp2 directly; L comes out in units\n\
             \x20 // of 1/ln 2.\n\
             \x20 float score_scale = rsqrt(float(D)) * M_LOG2E_F;\n\
             \n\
             {pointers}\
             \n\
             \x20 // Stage the Q row slab once and keep it in registers.\n\
             {stage_q}\
             \x20 simdgroup_matrix<float, 8, 8> q_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {load_q}\
             \x20   q_frags[d].thread_elements()[0] *= score_scale;\n\
             \x20   q_frags[d].thread_elements()[1] *= score_scale;\n\
             \x20 }}\n\
             \x20 threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \n\
             \x20 float m_running = -1e30f;\n\
             \x20 float l_running = 0.0f;\n\
             \x20 simdgroup_matrix<float, 8, 8> o_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20   o_frags[d] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20 }}\n\
             \n\
             \x20 for (uint c0 = 0; c0 < C; c0 += BLOCK_C) {{\n\
             {stage_kv}\
             \n\
             \x20   simdgroup_matrix<float, 8, 8> s_frags[{ctiles}];\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     s_frags[c] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> k_frag;\n\
             {load_kt}\
             \x20       simdgroup_multiply_accumulate(s_frags[c], \
             q_frags[d],\n\
             \x20                                     k_frag, s_frags[c]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \x20   if (c0 + BLOCK_C > C) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20       if (c0 + c * 8 + origin.x >= C) {{\n\
             \x20         s_frags[c].thread_elements()[0] = -1e30f;\n\
             \x20       }}\n\
             \x20       if (c0 + c * 8 + origin.x + 1 >= C) {{\n\
             \x20         s_frags[c].thread_elements()[1] = -1e30f;\n\
             \x20       }}\n\
             \x20     }}\n\
             \x20   }}\n\
             \n\
             \x20   float m_block = m_running;\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     m_block = max(m_block, \
             tile_row_max(tile_elements(s_frags[c])));\n\
             \x20   }}\n\
             \x20   float correction = exp2(m_running - m_block);\n\
             \x20   m_running = m_block;\n\
             \n\
             \x20   float block_sum = 0.0f;\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     float2 p = exp2(tile_elements(s_frags[c]) - m_block);\n\
             \x20     s_frags[c].thread_elements()[0] = p[0];\n\
             \x20     s_frags[c].thread_elements()[1] = p[1];\n\
             \x20     block_sum += tile_row_sum(p);\n\
             \x20   }}\n\
             \x20   l_running = l_running * correction + block_sum;\n\
             \n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20     o_frags[d].thread_elements()[0] *= correction;\n\
             \x20     o_frags[d].thread_elements()[1] *= correction;\n\
             \x20   }}\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> v_frag;\n\
             {load_v}\
             \x20       simdgroup_multiply_accumulate(o_frags[d], \
             s_frags[c],\n\
             \x20                                     v_frag, o_frags[d]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20 }}\n\
             \n\
             \x20 float l_inverse = 1.0f / l_running;\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20   o_frags[d].thread_elements()[0] *= l_inverse;\n\
             \x20   o_frags[d].thread_elements()[1] *= l_inverse;\n\
             \x20 }}\n\
             \n\
             {store_o}\
             {write_l}\
             }}\n",
            q = mem.q.shader_name(),
            k = mem.k.shader_name(),
            v = mem.v.shader_name(),
            o = mem.o.shader_name(),
            pointers = layout.forward_pointers(&mem),
        )
    }

    // Backward-query: recomputes the scores for its row slab, turns the
    // saved L into softmax weights, forms dS in registers, and accumulates
    // dQ. Also produces the D row statistic the backward-key-value kernel
    // consumes.
    fn emit_backward_query(&self, store_derivative_st: bool) -> String {
        let layout = self.layout();
        let dtiles = self.head_tiles();
        let ctiles = self.block_dimensions.1 / 8;
        let mem = self.memory_precisions;
        let state = self.transpose_state;

        let scratch_buffer = if store_derivative_st {
            "                      device bfloat *dST [[buffer(8)]],\n"
        } else {
            ""
        };

        let stage_q = stage_slab(
            "event", "block_q", "Q", "LEADING_Q", state.q, "r0", "BLOCK_R",
            "R", "    ",
        );
        let load_q = tile_load(
            "q_frags[d]",
            "block_q",
            state.q,
            false,
            "simd_id * 8",
            "d * 8",
            "BLOCK_R",
            mem.q,
            "q_raw",
            "    ",
        );
        let stage_o = stage_slab(
            "event", "block_o", "O", "LEADING_O", state.o, "r0", "BLOCK_R",
            "R", "    ",
        );
        let load_o = tile_load(
            "o_tmp[d]",
            "block_o",
            state.o,
            false,
            "simd_id * 8",
            "d * 8",
            "BLOCK_R",
            mem.o,
            "o_raw",
            "    ",
        );
        let stage_do = stage_slab(
            "event", "block_do", "dO", "LEADING_O", state.o, "r0",
            "BLOCK_R", "R", "    ",
        );
        let load_do = tile_load(
            "do_frags[d]",
            "block_do",
            state.o,
            false,
            "simd_id * 8",
            "d * 8",
            "BLOCK_R",
            mem.o,
            "do_raw",
            "    ",
        );
        let stage_kv = self.emit_kv_staging("    ");
        let load_kt = tile_load(
            "k_frag",
            "block_k",
            state.k,
            true,
            "c * 8",
            "d * 8",
            "BLOCK_C",
            mem.k,
            "k_raw",
            "        ",
        );
        let load_k = tile_load(
            "k_frag",
            "block_k",
            state.k,
            false,
            "c * 8",
            "d * 8",
            "BLOCK_C",
            mem.k,
            "k_raw",
            "        ",
        );
        let load_vt = tile_load(
            "vt_frag",
            "block_v",
            state.v,
            true,
            "c * 8",
            "d * 8",
            "BLOCK_C",
            mem.v,
            "v_raw",
            "        ",
        );
        let spill_ds = if store_derivative_st {
            self.emit_derivative_spill("s_frags[c]", true, ctiles, "    ")
        } else {
            String::new()
        };
        let store_dq = self.emit_row_output_store(
            "dQ",
            "LEADING_Q",
            "dq_frags",
            Precision::F32,
            state.q,
            "block_dq",
        );

        format!(
            "kernel void attention(device {q} *Q [[buffer(0)]],\n\
             \x20                     device {k} *K [[buffer(1)]],\n\
             \x20                     device {v} *V [[buffer(2)]],\n\
             \x20                     device {o} *O [[buffer(3)]],\n\
             \x20                     device float *L_terms [[buffer(4)]],\n\
             \x20                     device {o} *dO [[buffer(5)]],\n\
             \x20                     device float *D_terms [[buffer(6)]],\n\
             {scratch_buffer}\
             \x20                     device float *dQ [[buffer(9)]],\n\
             \x20                     threadgroup uchar *block_memory \
             [[threadgroup(0)]],\n\
             \x20                     uint2 group_id \
             [[threadgroup_position_in_grid]],\n\
             \x20                     ushort simd_id \
             [[simdgroup_index_in_threadgroup]],\n\
             \x20                     ushort lane_id \
             [[thread_index_in_simdgroup]]) {{\n\
             \x20 uint r0 = group_id.x * BLOCK_R;\n\
             \x20 if (r0 >= R) {{\n\
             \x20   return;\n\
             \x20 }}\n\
             \x20 ushort2 origin = tile_origin(lane_id);\n\
             \x20 uint row = r0 + simd_id * 8 + origin.y;\n\
             \n\
             \x20 float score_scale = rsqrt(float(D)) * M_LOG2E_F;\n\
             \x20 float inv_sqrt_d = rsqrt(float(D));\n\
             \n\
             {pointers}\
             \n\
             \x20 // Stage the row slabs this block owns: Q for the score\n\
             \x20 // recompute, then O and dO for the D row statistic.\n\
             {stage_q}\
             \x20 simdgroup_matrix<float, 8, 8> q_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {load_q}\
             \x20   q_frags[d].thread_elements()[0] *= score_scale;\n\
             \x20   q_frags[d].thread_elements()[1] *= score_scale;\n\
             \x20 }}\n\
             \x20 threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             {stage_o}\
             \x20 simdgroup_matrix<float, 8, 8> o_tmp[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {load_o}\
             \x20 }}\n\
             \x20 threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             {stage_do}\
             \x20 simdgroup_matrix<float, 8, 8> do_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {load_do}\
             \x20 }}\n\
             \x20 threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \n\
             \x20 // D[r] = sum(dO . O) scaled by rsqrt(D); the caller\n\
             \x20 // divides the factor back out.\n\
             \x20 float d_term = 0.0f;\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20   float2 grad = tile_elements(do_frags[d]);\n\
             \x20   float2 out = tile_elements(o_tmp[d]);\n\
             \x20   d_term += grad[0] * out[0] + grad[1] * out[1];\n\
             \x20 }}\n\
             \x20 d_term += simd_shuffle_xor(d_term, ushort(1));\n\
             \x20 d_term += simd_shuffle_xor(d_term, ushort(8));\n\
             \x20 d_term *= inv_sqrt_d;\n\
             \x20 if (origin.x == 0 && row < R) {{\n\
             \x20   D_terms[row] = d_term;\n\
             \x20 }}\n\
             \x20 float l_term = (row < R) ? L_terms[row] : 0.0f;\n\
             \n\
             \x20 simdgroup_matrix<float, 8, 8> dq_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20   dq_frags[d] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20 }}\n\
             \n\
             \x20 for (uint c0 = 0; c0 < C; c0 += BLOCK_C) {{\n\
             {stage_kv}\
             \n\
             \x20   simdgroup_matrix<float, 8, 8> s_frags[{ctiles}];\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     s_frags[c] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> k_frag;\n\
             {load_kt}\
             \x20       simdgroup_multiply_accumulate(s_frags[c], \
             q_frags[d],\n\
             \x20                                     k_frag, s_frags[c]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \n\
             \x20   // P from the saved statistic; masked columns underflow\n\
             \x20   // to zero.\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     float2 score = tile_elements(s_frags[c]);\n\
             \x20     float2 weight = exp2(score - l_term);\n\
             \x20     if (c0 + c * 8 + origin.x >= C) {{\n\
             \x20       weight[0] = 0.0f;\n\
             \x20     }}\n\
             \x20     if (c0 + c * 8 + origin.x + 1 >= C) {{\n\
             \x20       weight[1] = 0.0f;\n\
             \x20     }}\n\
             \x20     s_frags[c].thread_elements()[0] = weight[0];\n\
             \x20     s_frags[c].thread_elements()[1] = weight[1];\n\
             \x20   }}\n\
             \n\
             \x20   // dP = dO . V^T\n\
             \x20   simdgroup_matrix<float, 8, 8> dp_frags[{ctiles}];\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     dp_frags[c] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> vt_frag;\n\
             {load_vt}\
             \x20       simdgroup_multiply_accumulate(dp_frags[c], \
             do_frags[d],\n\
             \x20                                     vt_frag, \
             dp_frags[c]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \n\
             \x20   // dS = P . (dP * rsqrt(D) - D[r]); the rsqrt(D) fold\n\
             \x20   // lets the dK and dQ products run unscaled.\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20     float2 weight = tile_elements(s_frags[c]);\n\
             \x20     float2 grad = tile_elements(dp_frags[c]);\n\
             \x20     s_frags[c].thread_elements()[0] =\n\
             \x20         weight[0] * (grad[0] * inv_sqrt_d - d_term);\n\
             \x20     s_frags[c].thread_elements()[1] =\n\
             \x20         weight[1] * (grad[1] * inv_sqrt_d - d_term);\n\
             \x20   }}\n\
             {spill_ds}\
             \n\
             \x20   // dQ += dS . K\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort c = 0; c < {ctiles}; ++c) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> k_frag;\n\
             {load_k}\
             \x20       simdgroup_multiply_accumulate(dq_frags[d], \
             s_frags[c],\n\
             \x20                                     k_frag, \
             dq_frags[d]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20 }}\n\
             \n\
             {store_dq}\
             }}\n",
            q = mem.q.shader_name(),
            k = mem.k.shader_name(),
            v = mem.v.shader_name(),
            o = mem.o.shader_name(),
            pointers = layout.backward_query_pointers(&mem),
        )
    }

    // Backward-key-value: one threadgroup owns BLOCK_C columns, streams
    // the rows, accumulates dV, and materialises dS^T for the downstream
    // dK/dQ GEMMs.
    fn emit_backward_key_value(&self, store_derivative_st: bool) -> String {
        let layout = self.layout();
        let dtiles = self.head_tiles();
        let rtiles = self.block_dimensions.0 / 8;
        let mem = self.memory_precisions;
        let state = self.transpose_state;

        let scratch_buffer = if store_derivative_st {
            "                      device bfloat *dST [[buffer(8)]],\n"
        } else {
            ""
        };

        let stage_kv = self.emit_kv_staging("  ");
        let load_k = tile_load(
            "k_frags[d]",
            "block_k",
            state.k,
            false,
            "simd_id * 8",
            "d * 8",
            "BLOCK_C",
            mem.k,
            "k_raw",
            "    ",
        );
        let load_v = tile_load(
            "v_frags[d]",
            "block_v",
            state.v,
            false,
            "simd_id * 8",
            "d * 8",
            "BLOCK_C",
            mem.v,
            "v_raw",
            "    ",
        );
        let stage_q_do = self.emit_q_do_staging("    ");
        let load_qt = tile_load(
            "qt_frag",
            "block_q",
            state.q,
            true,
            "rt * 8",
            "d * 8",
            "BLOCK_R",
            mem.q,
            "q_raw",
            "        ",
        );
        let load_do = tile_load(
            "do_frag",
            "block_do",
            state.o,
            false,
            "rt * 8",
            "d * 8",
            "BLOCK_R",
            mem.o,
            "do_raw",
            "        ",
        );
        let load_dot = tile_load(
            "dot_frag",
            "block_do",
            state.o,
            true,
            "rt * 8",
            "d * 8",
            "BLOCK_R",
            mem.o,
            "do_raw",
            "        ",
        );
        let spill_ds = if store_derivative_st {
            self.emit_derivative_spill(
                "st_frags[rt]",
                false,
                rtiles,
                "    ",
            )
        } else {
            String::new()
        };
        let store_dv = self.emit_column_output_store(
            "dV", "LEADING_V", "dv_frags", state.v, "block_dv",
        );

        format!(
            "kernel void attention(device {q} *Q [[buffer(0)]],\n\
             \x20                     device {k} *K [[buffer(1)]],\n\
             \x20                     device {v} *V [[buffer(2)]],\n\
             \x20                     device float *L_terms [[buffer(4)]],\n\
             \x20                     device {o} *dO [[buffer(5)]],\n\
             \x20                     device float *D_terms [[buffer(6)]],\n\
             \x20                     device float *dV [[buffer(7)]],\n\
             {scratch_buffer}\
             \x20                     threadgroup uchar *block_memory \
             [[threadgroup(0)]],\n\
             \x20                     uint2 group_id \
             [[threadgroup_position_in_grid]],\n\
             \x20                     ushort simd_id \
             [[simdgroup_index_in_threadgroup]],\n\
             \x20                     ushort lane_id \
             [[thread_index_in_simdgroup]]) {{\n\
             \x20 uint c0 = group_id.x * BLOCK_C;\n\
             \x20 if (c0 >= C) {{\n\
             \x20   return;\n\
             \x20 }}\n\
             \x20 ushort2 origin = tile_origin(lane_id);\n\
             \x20 uint column = c0 + simd_id * 8 + origin.y;\n\
             \n\
             \x20 float score_scale = rsqrt(float(D)) * M_LOG2E_F;\n\
             \x20 float inv_sqrt_d = rsqrt(float(D));\n\
             \n\
             {pointers}\
             \n\
             \x20 // K and V column slabs persist for the whole pass; K is\n\
             \x20 // pre-scaled so the streamed scores evaluate exp2\n\
             \x20 // directly.\n\
             {stage_kv}\
             \x20 simdgroup_matrix<float, 8, 8> k_frags[{dtiles}];\n\
             \x20 simdgroup_matrix<float, 8, 8> v_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {load_k}\
             \x20   k_frags[d].thread_elements()[0] *= score_scale;\n\
             \x20   k_frags[d].thread_elements()[1] *= score_scale;\n\
             {load_v}\
             \x20 }}\n\
             \n\
             \x20 simdgroup_matrix<float, 8, 8> dv_frags[{dtiles}];\n\
             \x20 #pragma clang loop unroll(full)\n\
             \x20 for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20   dv_frags[d] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20 }}\n\
             \n\
             \x20 for (uint r0 = 0; r0 < R; r0 += BLOCK_R) {{\n\
             {stage_q_do}\
             \n\
             \x20   // S^T for this row block\n\
             \x20   simdgroup_matrix<float, 8, 8> st_frags[{rtiles}];\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort rt = 0; rt < {rtiles}; ++rt) {{\n\
             \x20     st_frags[rt] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> qt_frag;\n\
             {load_qt}\
             \x20       simdgroup_multiply_accumulate(st_frags[rt], \
             k_frags[d],\n\
             \x20                                     qt_frag, \
             st_frags[rt]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \n\
             \x20   // P^T from the saved statistics, masked at both edges\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort rt = 0; rt < {rtiles}; ++rt) {{\n\
             \x20     uint r_element = r0 + rt * 8 + origin.x;\n\
             \x20     float2 score = tile_elements(st_frags[rt]);\n\
             \x20     float2 weight = float2(0.0f);\n\
             \x20     if (column < C && r_element < R) {{\n\
             \x20       weight[0] = exp2(score[0] - L_terms[r_element]);\n\
             \x20     }}\n\
             \x20     if (column < C && r_element + 1 < R) {{\n\
             \x20       weight[1] = exp2(score[1] - \
             L_terms[r_element + 1]);\n\
             \x20     }}\n\
             \x20     st_frags[rt].thread_elements()[0] = weight[0];\n\
             \x20     st_frags[rt].thread_elements()[1] = weight[1];\n\
             \x20   }}\n\
             \n\
             \x20   // dV += P^T . dO\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort rt = 0; rt < {rtiles}; ++rt) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> do_frag;\n\
             {load_do}\
             \x20       simdgroup_multiply_accumulate(dv_frags[d], \
             st_frags[rt],\n\
             \x20                                     do_frag, \
             dv_frags[d]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \n\
             \x20   // dP^T = V . dO^T\n\
             \x20   simdgroup_matrix<float, 8, 8> dp_frags[{rtiles}];\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort rt = 0; rt < {rtiles}; ++rt) {{\n\
             \x20     dp_frags[rt] = make_filled_simdgroup_matrix<float, 8, \
             8>(0);\n\
             \x20     #pragma clang loop unroll(full)\n\
             \x20     for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             \x20       simdgroup_matrix<float, 8, 8> dot_frag;\n\
             {load_dot}\
             \x20       simdgroup_multiply_accumulate(dp_frags[rt], \
             v_frags[d],\n\
             \x20                                     dot_frag, \
             dp_frags[rt]);\n\
             \x20     }}\n\
             \x20   }}\n\
             \n\
             \x20   // dS^T = P^T . (dP^T * rsqrt(D) - D[r])\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort rt = 0; rt < {rtiles}; ++rt) {{\n\
             \x20     uint r_element = r0 + rt * 8 + origin.x;\n\
             \x20     float d0 = (r_element < R) ? D_terms[r_element] : \
             0.0f;\n\
             \x20     float d1 = (r_element + 1 < R) ? \
             D_terms[r_element + 1] : 0.0f;\n\
             \x20     float2 weight = tile_elements(st_frags[rt]);\n\
             \x20     float2 grad = tile_elements(dp_frags[rt]);\n\
             \x20     st_frags[rt].thread_elements()[0] =\n\
             \x20         weight[0] * (grad[0] * inv_sqrt_d - d0);\n\
             \x20     st_frags[rt].thread_elements()[1] =\n\
             \x20         weight[1] * (grad[1] * inv_sqrt_d - d1);\n\
             \x20   }}\n\
             {spill_ds}\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20 }}\n\
             \n\
             {store_dv}\
             }}\n",
            q = mem.q.shader_name(),
            k = mem.k.shader_name(),
            v = mem.v.shader_name(),
            o = mem.o.shader_name(),
            pointers = layout.backward_key_value_pointers(&mem),
        )
    }

    /// K and V tile staging inside the streaming loop of the forward and
    /// backward-query kernels.
    fn emit_kv_staging(&self, indent: &str) -> String {
        let copy_k = slab_copy(
            "events[0]",
            "block_k",
            "K",
            "LEADING_K",
            self.transpose_state.k,
            "c0",
            "BLOCK_C",
            "C",
            &format!("{indent}  "),
        );
        let copy_v = slab_copy(
            "events[1]",
            "block_v",
            "V",
            "LEADING_V",
            self.transpose_state.v,
            "c0",
            "BLOCK_C",
            "C",
            &format!("{indent}  "),
        );
        format!(
            "{indent}if (simd_id == 0 && lane_id == 0) {{\n\
             {indent}  block_event events[2];\n\
             {copy_k}\
             {copy_v}\
             {indent}  block_event::wait(2, events);\n\
             {indent}}}\n\
             {indent}threadgroup_barrier(mem_flags::mem_threadgroup);\n"
        )
    }

    /// Q and dO tile staging inside the row stream of the backward
    /// key-value kernel.
    fn emit_q_do_staging(&self, indent: &str) -> String {
        let copy_q = slab_copy(
            "events[0]",
            "block_q",
            "Q",
            "LEADING_Q",
            self.transpose_state.q,
            "r0",
            "BLOCK_R",
            "R",
            &format!("{indent}  "),
        );
        let copy_do = slab_copy(
            "events[1]",
            "block_do",
            "dO",
            "LEADING_O",
            self.transpose_state.o,
            "r0",
            "BLOCK_R",
            "R",
            &format!("{indent}  "),
        );
        format!(
            "{indent}if (simd_id == 0 && lane_id == 0) {{\n\
             {indent}  block_event events[2];\n\
             {copy_q}\
             {copy_do}\
             {indent}  block_event::wait(2, events);\n\
             {indent}}}\n\
             {indent}threadgroup_barrier(mem_flags::mem_threadgroup);\n"
        )
    }

    /// Spills the register-resident derivative tiles to the BF16 dS^T
    /// scratch through a threadgroup slab, so clipped edge tiles never
    /// touch device memory. The scratch keeps one padded row per score
    /// column; backward-query holds dS row-major and stores transposed,
    /// backward-key-value already holds dS^T and stores straight.
    fn emit_derivative_spill(
        &self,
        tile: &str,
        transpose: bool,
        tiles: u16,
        indent: &str,
    ) -> String {
        let loop_var = if transpose { "c" } else { "rt" };
        let store = if transpose {
            format!(
                "{indent}    simdgroup_store(\n\
                 {indent}        tile_cast<float, bfloat>({tile}),\n\
                 {indent}        block_ds + ({loop_var} * 8) * BLOCK_R + \
                 simd_id * 8,\n\
                 {indent}        BLOCK_R, ulong2(0, 0), true);\n"
            )
        } else {
            format!(
                "{indent}    simdgroup_store(\n\
                 {indent}        tile_cast<float, bfloat>({tile}),\n\
                 {indent}        block_ds + (simd_id * 8) * BLOCK_R + \
                 {loop_var} * 8,\n\
                 {indent}        BLOCK_R);\n"
            )
        };
        format!(
            "\n\
             {indent}// Spill dS^T through threadgroup memory; the copy\n\
             {indent}// clips past the matrix edges while the padded tail\n\
             {indent}// of each scratch row stays garbage by contract.\n\
             {indent}threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             {indent}#pragma clang loop unroll(full)\n\
             {indent}for (ushort {loop_var} = 0; {loop_var} < {tiles}; \
             ++{loop_var}) {{\n\
             {store}\
             {indent}}}\n\
             {indent}threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             {indent}if (simd_id == 0 && lane_id == 0) {{\n\
             {indent}  block_event event;\n\
             {indent}  event.copy_threadgroup_to_device(\n\
             {indent}      dST + c0 * LEADING_DST + r0, LEADING_DST,\n\
             {indent}      ushort2(min(uint(BLOCK_R), R - r0),\n\
             {indent}              min(uint(BLOCK_C), C - c0)),\n\
             {indent}      block_ds, BLOCK_R,\n\
             {indent}      ushort2(min(uint(BLOCK_R), R - r0),\n\
             {indent}              min(uint(BLOCK_C), C - c0)));\n\
             {indent}  block_event::wait(1, &event);\n\
             {indent}}}\n"
        )
    }

    /// Writeback of a row-parallel output (O or dQ): direct simdgroup
    /// stores when the block is interior and the head dimension tiles
    /// evenly, otherwise staged through threadgroup memory with one
    /// clipped copy.
    fn emit_row_output_store(
        &self,
        buffer: &str,
        leading: &str,
        frags: &str,
        precision: Precision,
        transposed: bool,
        slab: &str,
    ) -> String {
        let dtiles = self.head_tiles();
        let tile = if precision == Precision::F32 {
            format!("{frags}[d]")
        } else {
            format!(
                "tile_cast<float, {}>({frags}[d])",
                precision.shader_name()
            )
        };
        let direct = if transposed {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {buffer} + (d * 8) * {leading} + r0 + \
                 simd_id * 8,\n\
                 \x20         {leading}, ulong2(0, 0), true);\n"
            )
        } else {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {buffer} + (r0 + simd_id * 8) * {leading} + \
                 d * 8,\n\
                 \x20         {leading});\n"
            )
        };
        let staged = if transposed {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {slab} + (d * 8) * BLOCK_R + simd_id * 8,\n\
                 \x20         BLOCK_R, ulong2(0, 0), true);\n"
            )
        } else {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {slab} + (simd_id * 8) * HEAD_BLOCK + d * 8,\n\
                 \x20         HEAD_BLOCK);\n"
            )
        };
        let copy = if transposed {
            format!(
                "      event.copy_threadgroup_to_device(\n\
                 \x20         {buffer} + r0, {leading},\n\
                 \x20         ushort2(valid_r, D),\n\
                 \x20         {slab}, BLOCK_R, ushort2(valid_r, D));\n"
            )
        } else {
            format!(
                "      event.copy_threadgroup_to_device(\n\
                 \x20         {buffer} + r0 * {leading}, {leading},\n\
                 \x20         ushort2(D, valid_r),\n\
                 \x20         {slab}, HEAD_BLOCK, ushort2(D, valid_r));\n"
            )
        };
        format!(
            "  if (r0 + BLOCK_R <= R && (D % 8) == 0) {{\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {direct}\
             \x20   }}\n\
             \x20 }} else {{\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {staged}\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   if (simd_id == 0 && lane_id == 0) {{\n\
             \x20     uint valid_r = min(uint(BLOCK_R), R - r0);\n\
             \x20     block_event event;\n\
             {copy}\
             \x20     block_event::wait(1, &event);\n\
             \x20   }}\n\
             \x20 }}\n"
        )
    }

    /// Writeback of the column-parallel dV output.
    fn emit_column_output_store(
        &self,
        buffer: &str,
        leading: &str,
        frags: &str,
        transposed: bool,
        slab: &str,
    ) -> String {
        let dtiles = self.head_tiles();
        let tile = format!("{frags}[d]");
        let direct = if transposed {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {buffer} + (d * 8) * {leading} + c0 + \
                 simd_id * 8,\n\
                 \x20         {leading}, ulong2(0, 0), true);\n"
            )
        } else {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {buffer} + (c0 + simd_id * 8) * {leading} + \
                 d * 8,\n\
                 \x20         {leading});\n"
            )
        };
        let staged = if transposed {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {slab} + (d * 8) * BLOCK_C + simd_id * 8,\n\
                 \x20         BLOCK_C, ulong2(0, 0), true);\n"
            )
        } else {
            format!(
                "      simdgroup_store(\n\
                 \x20         {tile},\n\
                 \x20         {slab} + (simd_id * 8) * HEAD_BLOCK + d * 8,\n\
                 \x20         HEAD_BLOCK);\n"
            )
        };
        let copy = if transposed {
            format!(
                "      event.copy_threadgroup_to_device(\n\
                 \x20         {buffer} + c0, {leading},\n\
                 \x20         ushort2(valid_c, D),\n\
                 \x20         {slab}, BLOCK_C, ushort2(valid_c, D));\n"
            )
        } else {
            format!(
                "      event.copy_threadgroup_to_device(\n\
                 \x20         {buffer} + c0 * {leading}, {leading},\n\
                 \x20         ushort2(D, valid_c),\n\
                 \x20         {slab}, HEAD_BLOCK, ushort2(D, valid_c));\n"
            )
        };
        format!(
            "  if (c0 + BLOCK_C <= C && (D % 8) == 0) {{\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {direct}\
             \x20   }}\n\
             \x20 }} else {{\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   #pragma clang loop unroll(full)\n\
             \x20   for (ushort d = 0; d < {dtiles}; ++d) {{\n\
             {staged}\
             \x20   }}\n\
             \x20   threadgroup_barrier(mem_flags::mem_threadgroup);\n\
             \x20   if (simd_id == 0 && lane_id == 0) {{\n\
             \x20     uint valid_c = min(uint(BLOCK_C), C - c0);\n\
             \x20     block_event event;\n\
             {copy}\
             \x20     block_event::wait(1, &event);\n\
             \x20   }}\n\
             \x20 }}\n"
        )
    }
}

/// Device leading dimension of an operand whose rows run along `extent`
/// when transposed and along the head dimension otherwise.
fn leading_expression(transposed: bool, extent: &str) -> String {
    if transposed {
        extent.to_string()
    } else {
        "uint(D)".to_string()
    }
}

/// One staged copy of an operand slab: the destination names the full
/// padded slab, the source the clamped window.
#[allow(clippy::too_many_arguments)]
fn slab_copy(
    event: &str,
    slab: &str,
    buffer: &str,
    leading: &str,
    transposed: bool,
    origin: &str,
    block: &str,
    extent: &str,
    indent: &str,
) -> String {
    if transposed {
        format!(
            "{indent}{event}.copy_device_to_threadgroup(\n\
             {indent}    {slab}, {block}, ushort2({block}, HEAD_BLOCK),\n\
             {indent}    {buffer} + {origin}, {leading},\n\
             {indent}    ushort2(min(uint({block}), {extent} - {origin}), \
             D));\n"
        )
    } else {
        format!(
            "{indent}{event}.copy_device_to_threadgroup(\n\
             {indent}    {slab}, HEAD_BLOCK, ushort2(HEAD_BLOCK, \
             {block}),\n\
             {indent}    {buffer} + {origin} * {leading}, {leading},\n\
             {indent}    ushort2(D, min(uint({block}), {extent} - \
             {origin})));\n"
        )
    }
}

/// A single staged copy wrapped in its own issue/wait/barrier sequence.
#[allow(clippy::too_many_arguments)]
fn stage_slab(
    event: &str,
    slab: &str,
    buffer: &str,
    leading: &str,
    transposed: bool,
    origin: &str,
    block: &str,
    extent: &str,
    indent: &str,
) -> String {
    let copy = slab_copy(
        event,
        slab,
        buffer,
        leading,
        transposed,
        origin,
        block,
        extent,
        &format!("{indent}  "),
    );
    format!(
        "{indent}if (simd_id == 0 && lane_id == 0) {{\n\
         {indent}  block_event {event};\n\
         {copy}\
         {indent}  block_event::wait(1, &{event});\n\
         {indent}}}\n\
         {indent}threadgroup_barrier(mem_flags::mem_threadgroup);\n"
    )
}

/// One register-tile load from a staged slab, converting to the F32
/// attention registers when the memory precision is narrower.
///
/// `want_transpose` asks for the mathematical transpose of the operand;
/// composed with the storage orientation it decides the pointer math and
/// the transpose flag of the load.
#[allow(clippy::too_many_arguments)]
fn tile_load(
    target: &str,
    slab: &str,
    storage_transposed: bool,
    want_transpose: bool,
    row_expr: &str,
    column_expr: &str,
    transposed_stride: &str,
    memory: Precision,
    raw_name: &str,
    indent: &str,
) -> String {
    let flag = storage_transposed != want_transpose;
    let (pointer, stride) = if storage_transposed {
        (
            format!(
                "{slab} + ({column_expr}) * {transposed_stride} + {row_expr}"
            ),
            transposed_stride.to_string(),
        )
    } else {
        (
            format!("{slab} + ({row_expr}) * HEAD_BLOCK + {column_expr}"),
            "HEAD_BLOCK".to_string(),
        )
    };
    let tail = if flag { ", ulong2(0, 0), true" } else { "" };
    if memory == Precision::F32 {
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
             {indent}{target} = tile_cast<{mem}, float>({raw_name});\n",
            mem = memory.shader_name(),
        )
    }
}

/// Threadgroup memory plan shared by selection and emission. Regions are
/// reused between phases with barriers separating the lifetimes.
struct MemoryLayout {
    row_slab_bytes: u32,
    kv_bytes: u32,
    k_bytes: u32,
    q_tile_bytes: u32,
    total: u32,
}

impl MemoryLayout {
    fn new(kernel: &AttentionKernel) -> Self {
        let (block_r, block_c) = kernel.block_dimensions;
        let head_block = u32::from(kernel.head_block());
        let mem = kernel.memory_precisions;
        let store_ds = kernel.stores_derivative_st();
        Self::for_parameters(
            kernel.kernel_type,
            block_r,
            block_c,
            head_block,
            &mem,
            store_ds,
        )
    }

    fn for_parameters(
        kernel_type: AttentionKernelType,
        block_r: u16,
        block_c: u16,
        head_block: u32,
        mem: &AttentionOperands<Precision>,
        store_ds: bool,
    ) -> Self {
        let block_r = u32::from(block_r);
        let block_c = u32::from(block_c);
        let slab = |rows: u32, precision: Precision| {
            rows * head_block * precision.size_in_bytes() as u32
        };
        let k_bytes = slab(block_c, mem.k);
        let kv_bytes = k_bytes + slab(block_c, mem.v);
        let ds_bytes = if store_ds {
            block_r * block_c * DERIVATIVE_ST_PRECISION.size_in_bytes() as u32
        } else {
            0
        };
        let (row_slab_bytes, q_tile_bytes, total) = match kernel_type {
            AttentionKernelType::Forward { .. } => {
                let row = slab(block_r, mem.q).max(slab(block_r, mem.o));
                (row, 0, row.max(kv_bytes))
            }
            AttentionKernelType::BackwardQuery { .. } => {
                let row = slab(block_r, mem.q)
                    .max(slab(block_r, mem.o))
                    .max(slab(block_r, Precision::F32))
                    .max(ds_bytes);
                (row, 0, row + kv_bytes)
            }
            AttentionKernelType::BackwardKeyValue { .. } => {
                let row = (slab(block_r, mem.q) + slab(block_r, mem.o))
                    .max(ds_bytes)
                    .max(slab(block_c, Precision::F32));
                (row, slab(block_r, mem.q), kv_bytes + row)
            }
        };
        Self {
            row_slab_bytes,
            kv_bytes,
            k_bytes,
            q_tile_bytes,
            total,
        }
    }

    /// Forward: the Q slab, the K/V tiles, and the O staging slab all
    /// alias the front of block memory; only K and V coexist.
    fn forward_pointers(&self, mem: &AttentionOperands<Precision>) -> String {
        format!(
            "  threadgroup {q} *block_q = (threadgroup {q} \
             *)block_memory;\n\
             \x20 threadgroup {k} *block_k = (threadgroup {k} \
             *)block_memory;\n\
             \x20 threadgroup {v} *block_v =\n\
             \x20     (threadgroup {v} *)(block_memory + {k_bytes});\n\
             \x20 threadgroup {o} *block_o = (threadgroup {o} \
             *)block_memory;\n",
            q = mem.q.shader_name(),
            k = mem.k.shader_name(),
            v = mem.v.shader_name(),
            o = mem.o.shader_name(),
            k_bytes = self.k_bytes,
        )
    }

    /// Backward-query: the row slabs (Q, O, dO, the dQ writeback and the
    /// dS spill) share the front region; K and V tiles live behind it so
    /// they survive the streamed loop.
    fn backward_query_pointers(
        &self,
        mem: &AttentionOperands<Precision>,
    ) -> String {
        let kv_offset = self.row_slab_bytes;
        format!(
            "  threadgroup {q} *block_q = (threadgroup {q} \
             *)block_memory;\n\
             \x20 threadgroup {o} *block_o = (threadgroup {o} \
             *)block_memory;\n\
             \x20 threadgroup {o} *block_do = (threadgroup {o} \
             *)block_memory;\n\
             \x20 threadgroup float *block_dq = (threadgroup float \
             *)block_memory;\n\
             \x20 threadgroup bfloat *block_ds = (threadgroup bfloat \
             *)block_memory;\n\
             \x20 threadgroup {k} *block_k =\n\
             \x20     (threadgroup {k} *)(block_memory + {kv_offset});\n\
             \x20 threadgroup {v} *block_v =\n\
             \x20     (threadgroup {v} *)(block_memory + {v_offset});\n",
            q = mem.q.shader_name(),
            k = mem.k.shader_name(),
            v = mem.v.shader_name(),
            o = mem.o.shader_name(),
            v_offset = kv_offset + self.k_bytes,
        )
    }

    /// Backward-key-value: K and V column slabs persist at the front; the
    /// streamed Q/dO tiles, the dS spill and the dV writeback share the
    /// region behind them.
    fn backward_key_value_pointers(
        &self,
        mem: &AttentionOperands<Precision>,
    ) -> String {
        let q_offset = self.kv_bytes;
        format!(
            "  threadgroup {k} *block_k = (threadgroup {k} \
             *)block_memory;\n\
             \x20 threadgroup {v} *block_v =\n\
             \x20     (threadgroup {v} *)(block_memory + {k_bytes});\n\
             \x20 threadgroup {q} *block_q =\n\
             \x20     (threadgroup {q} *)(block_memory + {q_offset});\n\
             \x20 threadgroup {o} *block_do =\n\
             \x20     (threadgroup {o} *)(block_memory + {do_offset});\n\
             \x20 threadgroup bfloat *block_ds =\n\
             \x20     (threadgroup bfloat *)(block_memory + {q_offset});\n\
             \x20 threadgroup float *block_dv =\n\
             \x20     (threadgroup float *)(block_memory + {q_offset});\n",
            q = mem.q.shader_name(),
            k = mem.k.shader_name(),
            v = mem.v.shader_name(),
            o = mem.o.shader_name(),
            k_bytes = self.k_bytes,
            do_offset = q_offset + self.q_tile_bytes,
        )
    }
}

/// Rule-based blocking: start from a 32x32 score block and halve the
/// streamed extent (then the parallel one) until the staging plan fits
/// the device threadgroup-memory limit.
fn select_block_dimensions(
    descriptor: &AttentionDescriptor,
    device: &DeviceProperties,
) -> Result<((u16, u16), u32), DescriptorError> {
    let head_block =
        ceil_to_multiple(u32::from(descriptor.matrix_dimensions.2), 8);
    let store_ds = matches!(
        descriptor.kernel_type,
        AttentionKernelType::BackwardQuery {
            store_derivative_st: true,
        } | AttentionKernelType::BackwardKeyValue {
            store_derivative_st: true,
        }
    );
    let streamed_first =
        !matches!(
            descriptor.kernel_type,
            AttentionKernelType::BackwardKeyValue { .. }
        );

    let mut block_r: u16 = 32;
    let mut block_c: u16 = 32;
    loop {
        let layout = MemoryLayout::for_parameters(
            descriptor.kernel_type,
            block_r,
            block_c,
            head_block,
            &descriptor.memory_precisions,
            store_ds,
        );
        if layout.total <= device.threadgroup_memory_limit {
            return Ok(((block_r, block_c), layout.total));
        }
        // Shrink the streamed axis before giving up parallelism.
        let streamed =
            if streamed_first { &mut block_c } else { &mut block_r };
        if *streamed > 8 {
            *streamed /= 2;
            continue;
        }
        let parallel =
            if streamed_first { &mut block_r } else { &mut block_c };
        if *parallel > 8 {
            *parallel /= 2;
            continue;
        }
        return Err(DescriptorError::ThreadgroupMemoryExceeded {
            required: layout.total,
            limit: device.threadgroup_memory_limit,
        });
    }
}
