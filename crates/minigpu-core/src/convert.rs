//! Device-side element conversions.
//!
//! WGSL storage buffers only address 32-bit words, so narrow integers travel
//! packed several to a word and `f64` values travel as pairs of `u32` words.
//! The helpers here run the packing and unpacking on the device through the
//! context's shader cache, so each kernel is compiled once per context.

use crate::buffer::Buffer;
use crate::context::ContextManager;
use crate::error::{GpuError, Result};
use crate::types::DataType;

/// Invocations per workgroup in every conversion kernel.
pub const WORKGROUP_SIZE: u32 = 256;

/// Largest workgroup count a conversion may dispatch along x.
pub const MAX_WORKGROUPS: u32 = 65535;

/// Narrow integer layout packed into 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackedFormat {
    /// Four sign-extended `i8` lanes per `i32` word
    I8,
    /// Four `u8` lanes per `u32` word
    U8,
    /// Two sign-extended `i16` lanes per `i32` word
    I16,
    /// Two `u16` lanes per `u32` word
    U16,
}

impl PackedFormat {
    pub fn bits(self) -> u32 {
        match self {
            PackedFormat::I8 | PackedFormat::U8 => 8,
            PackedFormat::I16 | PackedFormat::U16 => 16,
        }
    }

    /// Lanes stored in one 32-bit word.
    pub fn lanes(self) -> usize {
        (32 / self.bits()) as usize
    }

    pub fn is_signed(self) -> bool {
        matches!(self, PackedFormat::I8 | PackedFormat::I16)
    }

    /// Data type of both the packed and the unpacked buffers.
    pub fn word_type(self) -> DataType {
        if self.is_signed() {
            DataType::Int32
        } else {
            DataType::Uint32
        }
    }

    /// Number of words needed to pack `element_count` lanes.
    pub fn packed_len(self, element_count: usize) -> usize {
        element_count.div_ceil(self.lanes())
    }

    fn scalar(self) -> &'static str {
        if self.is_signed() { "i32" } else { "u32" }
    }

    fn mask(self) -> u32 {
        (1u32 << self.bits()) - 1
    }

    /// Kernel spreading each `source` word over `lanes` `destination` elements.
    pub fn unpack_kernel(self) -> String {
        let lanes = self.lanes();
        let bits = self.bits();
        let extract = if self.is_signed() {
            let rest = 32 - bits;
            format!("(word << ({rest}u - lane * {bits}u)) >> {rest}u")
        } else {
            format!("(word >> (lane * {bits}u)) & {}u", self.mask())
        };
        format!(
            r#"
@group(0) @binding(0) var<storage, read_write> source: array<{scalar}>;
@group(0) @binding(1) var<storage, read_write> destination: array<{scalar}>;

@compute @workgroup_size({WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) id: vec3<u32>) {{
    if (id.x >= arrayLength(&source)) {{
        return;
    }}
    let word = source[id.x];
    for (var lane = 0u; lane < {lanes}u; lane = lane + 1u) {{
        let index = id.x * {lanes}u + lane;
        if (index < arrayLength(&destination)) {{
            destination[index] = {extract};
        }}
    }}
}}
"#,
            scalar = self.scalar(),
        )
    }

    /// Kernel folding `lanes` `source` elements into each `destination` word.
    pub fn pack_kernel(self) -> String {
        let lanes = self.lanes();
        let bits = self.bits();
        let mask = self.mask();
        format!(
            r#"
@group(0) @binding(0) var<storage, read_write> source: array<{scalar}>;
@group(0) @binding(1) var<storage, read_write> destination: array<{scalar}>;

@compute @workgroup_size({WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) id: vec3<u32>) {{
    if (id.x >= arrayLength(&destination)) {{
        return;
    }}
    var word = 0u;
    for (var lane = 0u; lane < {lanes}u; lane = lane + 1u) {{
        let index = id.x * {lanes}u + lane;
        if (index < arrayLength(&source)) {{
            word = word | ((bitcast<u32>(source[index]) & {mask}u) << (lane * {bits}u));
        }}
    }}
    destination[id.x] = bitcast<{scalar}>(word);
}}
"#,
            scalar = self.scalar(),
        )
    }
}

/// Copies `u32` word pairs. Serves both directions of the `f64` split.
pub const COPY_WORD_PAIRS_KERNEL: &str = r#"
@group(0) @binding(0) var<storage, read_write> source: array<u32>;
@group(0) @binding(1) var<storage, read_write> destination: array<u32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let high = id.x * 2u + 1u;
    if (high >= arrayLength(&source) || high >= arrayLength(&destination)) {
        return;
    }
    destination[high - 1u] = source[high - 1u];
    destination[high] = source[high];
}
"#;

/// Adds one to every `i32` in `data`.
pub const ADD_ONE_I32_KERNEL: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<i32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&data)) {
        data[id.x] = data[id.x] + 1;
    }
}
"#;

/// Workgroups needed to cover `invocations` along x.
fn workgroups(invocations: usize, operation: &str) -> Result<u32> {
    let groups = invocations.div_ceil(WORKGROUP_SIZE as usize);
    match u32::try_from(groups) {
        Ok(groups) if groups <= MAX_WORKGROUPS => Ok(groups),
        _ => Err(GpuError::InvalidArgument(format!(
            "{operation}: {invocations} invocations need {groups} workgroups, more than {MAX_WORKGROUPS}"
        ))),
    }
}

fn expect_type(buffer: &Buffer, data_type: DataType, role: &str, operation: &str) -> Result<()> {
    if buffer.data_type() != data_type {
        return Err(GpuError::InvalidArgument(format!(
            "{operation}: {role} buffer holds {} but {} is required",
            buffer.data_type(),
            data_type
        )));
    }
    Ok(())
}

fn expect_len(buffer: &Buffer, needed: usize, role: &str, operation: &str) -> Result<()> {
    if buffer.element_count() < needed {
        return Err(GpuError::InvalidArgument(format!(
            "{operation}: {role} buffer has {} elements but {} are required",
            buffer.element_count(),
            needed
        )));
    }
    Ok(())
}

async fn run(
    ctx: &ContextManager,
    kernel: &str,
    source: &Buffer,
    destination: &Buffer,
    groups: u32,
) -> Result<()> {
    let mut shader = ctx.create_compute_shader();
    shader.load_kernel_string(kernel)?;
    shader.set_buffer("source", source)?;
    shader.set_buffer("destination", destination)?;
    shader.dispatch(groups, 1, 1).await
}

/// Unpacks `packed` words into one `unpacked` element per lane.
///
/// The lane count comes from `unpacked.element_count()`. Both buffers hold
/// [`PackedFormat::word_type`] elements.
pub async fn unpack(
    ctx: &ContextManager,
    format: PackedFormat,
    packed: &Buffer,
    unpacked: &Buffer,
) -> Result<()> {
    const OP: &str = "unpack";
    expect_type(packed, format.word_type(), "packed", OP)?;
    expect_type(unpacked, format.word_type(), "unpacked", OP)?;

    let count = unpacked.element_count();
    if count == 0 {
        tracing::warn!("{:?} unpack of an empty buffer; nothing to do", format);
        return Ok(());
    }
    let words = format.packed_len(count);
    expect_len(packed, words, "packed", OP)?;
    let groups = workgroups(words, OP)?;

    tracing::debug!(
        "Unpacking {} {:?} lanes from {} words in {} workgroups",
        count,
        format,
        words,
        groups
    );
    run(ctx, &format.unpack_kernel(), packed, unpacked, groups).await
}

/// Packs every `unpacked` element into `packed`, `lanes` per word.
///
/// Only the low [`PackedFormat::bits`] of each element are kept.
pub async fn pack(
    ctx: &ContextManager,
    format: PackedFormat,
    unpacked: &Buffer,
    packed: &Buffer,
) -> Result<()> {
    const OP: &str = "pack";
    expect_type(unpacked, format.word_type(), "unpacked", OP)?;
    expect_type(packed, format.word_type(), "packed", OP)?;

    let count = unpacked.element_count();
    if count == 0 {
        tracing::warn!("{:?} pack of an empty buffer; nothing to do", format);
        return Ok(());
    }
    let words = format.packed_len(count);
    expect_len(packed, words, "packed", OP)?;
    let groups = workgroups(words, OP)?;

    tracing::debug!(
        "Packing {} {:?} lanes into {} words in {} workgroups",
        count,
        format,
        words,
        groups
    );
    run(ctx, &format.pack_kernel(), unpacked, packed, groups).await
}

/// Splits each `f64` of `input` into its low and high `u32` words.
pub async fn expand_f64(ctx: &ContextManager, input: &Buffer, output: &Buffer) -> Result<()> {
    const OP: &str = "expand_f64";
    expect_type(input, DataType::Float64, "input", OP)?;
    expect_type(output, DataType::Uint32, "output", OP)?;

    let count = input.element_count();
    if count == 0 {
        tracing::warn!("f64 expand of an empty buffer; nothing to do");
        return Ok(());
    }
    expect_len(output, count * 2, "output", OP)?;
    let groups = workgroups(count, OP)?;
    run(ctx, COPY_WORD_PAIRS_KERNEL, input, output, groups).await
}

/// Joins `u32` word pairs of `input` back into the `f64`s of `output`.
pub async fn combine_f64(ctx: &ContextManager, input: &Buffer, output: &Buffer) -> Result<()> {
    const OP: &str = "combine_f64";
    expect_type(input, DataType::Uint32, "input", OP)?;
    expect_type(output, DataType::Float64, "output", OP)?;

    let count = output.element_count();
    if count == 0 {
        tracing::warn!("f64 combine into an empty buffer; nothing to do");
        return Ok(());
    }
    expect_len(input, count * 2, "input", OP)?;
    let groups = workgroups(count, OP)?;
    run(ctx, COPY_WORD_PAIRS_KERNEL, input, output, groups).await
}

/// Adds one to every element of an `i32` buffer in place.
pub async fn add_one_i32(ctx: &ContextManager, data: &Buffer) -> Result<()> {
    const OP: &str = "add_one_i32";
    expect_type(data, DataType::Int32, "data", OP)?;
    if data.element_count() == 0 {
        return Ok(());
    }
    let groups = workgroups(data.element_count(), OP)?;

    let mut shader = ctx.create_compute_shader();
    shader.load_kernel_string(ADD_ONE_I32_KERNEL)?;
    shader.set_buffer("data", data)?;
    shader.dispatch(groups, 1, 1).await
}
