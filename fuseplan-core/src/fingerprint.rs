//! Cache keys for fused programs.
//!
//! A fingerprint is `discriminator(args)signature`, where `args` describes
//! each kernel argument's alignment and whether it is aliased, written, or a
//! repeat of an earlier argument. Two launches of the same numeric program
//! with different aliasing get distinct keys.

use std::fmt::Write;

use crate::graph::OperatorGraph;

/// Base alignment guaranteed for every allocation.
pub const BUFFER_ALIGN_BYTES: u64 = 16;

/// A byte range of one allocation, as seen by a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub allocation: u64,
    pub offset: u64,
    pub size: u64,
    /// The kernel writes through this argument.
    pub written: bool,
}

impl BufferSlice {
    pub fn new(allocation: u64, offset: u64, size: u64) -> Self {
        Self {
            allocation,
            offset,
            size,
            written: false,
        }
    }

    pub fn written(self) -> Self {
        Self {
            written: true,
            ..self
        }
    }

    fn same_range(&self, other: &Self) -> bool {
        self.allocation == other.allocation && self.offset == other.offset && self.size == other.size
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.allocation == other.allocation
            && self.offset < other.offset + other.size
            && other.offset < self.offset + self.size
    }

    /// Largest power of two dividing the offset, capped at the buffer alignment.
    pub fn alignment(&self) -> u64 {
        if self.offset == 0 {
            BUFFER_ALIGN_BYTES
        } else {
            (1u64 << self.offset.trailing_zeros()).min(BUFFER_ALIGN_BYTES)
        }
    }
}

/// Traits of one kernel argument that affect code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelArgument {
    pub alignment: u64,
    pub aliased: bool,
    pub written: bool,
    /// Index of an earlier argument bound to exactly the same slice.
    pub first_with_same_slice: Option<usize>,
}

impl KernelArgument {
    /// Derive argument traits from the slices in launch order.
    ///
    /// Overlapping arguments are only aliased when their ranges differ and at
    /// least one side is written. An identical repeat is recorded as a
    /// duplicate instead.
    pub fn from_slices(slices: &[BufferSlice]) -> Vec<KernelArgument> {
        slices
            .iter()
            .enumerate()
            .map(|(i, slice)| {
                let first_with_same_slice = slices[..i].iter().position(|s| s.same_range(slice));
                let aliased = slices.iter().enumerate().any(|(j, other)| {
                    j != i
                        && !other.same_range(slice)
                        && other.overlaps(slice)
                        && (other.written || slice.written)
                });
                let written = slices
                    .iter()
                    .filter(|s| s.same_range(slice))
                    .any(|s| s.written);
                KernelArgument {
                    alignment: slice.alignment(),
                    aliased,
                    written,
                    first_with_same_slice,
                }
            })
            .collect()
    }
}

/// Compact argument descriptor, e.g. `16aw,16aw,=0`.
pub fn argument_fingerprint(args: &[KernelArgument]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match arg.first_with_same_slice {
            Some(first) => {
                let _ = write!(out, "={first}");
            }
            None => {
                let _ = write!(out, "{}", arg.alignment);
                if arg.aliased {
                    out.push('a');
                }
                if arg.written {
                    out.push('w');
                }
            }
        }
    }
    out
}

/// Full cache key for a graph launched with `args`.
pub fn computation_fingerprint(
    graph: &OperatorGraph,
    args: &[KernelArgument],
    discriminator: &str,
) -> String {
    format!(
        "{discriminator}({}){}",
        argument_fingerprint(args),
        graph.signature()
    )
}

/// Default argument traits: every materialized tensor in its own aligned
/// buffer, outputs written.
pub fn default_arguments(graph: &OperatorGraph) -> Vec<KernelArgument> {
    graph
        .materialized()
        .iter()
        .map(|t| KernelArgument {
            alignment: BUFFER_ALIGN_BYTES,
            aliased: false,
            written: !t.is_input(),
            first_with_same_slice: None,
        })
        .collect()
}
