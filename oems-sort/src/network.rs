//! Odd-even merge network topology.
//!
//! The network is a sequence of [`Column`]s. Each column is one
//! compare-and-swap stage whose comparisons touch pairwise disjoint elements,
//! so a single GPU dispatch can execute it with one thread per comparison.
//!
//! Columns assume the base pass already sorted every group of
//! [`BASE_GROUP`] elements (see [`sort_groups_of_four`]). The first merge
//! width is [`FIRST_TIP`]: runs of 4 are merged into runs of 8, then 16, and
//! so on until the merge width exceeds the element count.
//!
//! | pass   | columns per tip               | pattern                             |
//! |--------|-------------------------------|-------------------------------------|
//! | first  | 2 (even, odd)                 | `i` vs `i + tip/2`                  |
//! | second | 2 per inner level per block   | rows of `k` vs `k`, `k = tip/4 .. 2`|
//! | third  | 1                             | `2i + 1` vs `2i + 2`                |

use bytemuck::{Pod, Zeroable};

/// Smallest merge width. The base pass produces sorted runs of `FIRST_TIP / 2`.
pub const FIRST_TIP: u32 = 8;

/// Number of elements one base-pass thread sorts on its own.
pub const BASE_GROUP: usize = 4;

/// One compare-and-swap stage of the network.
///
/// For every `block < block_count` and `c < comparisons_per_block` the stage
/// compares `left = origin + block * origin_step + 2 * c` with
/// `right = left + right_offset` and swaps them when `data[left] > data[right]`.
///
/// The layout is the wire format read by the network kernel: five `u32`
/// fields in declaration order, 20 bytes, no padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Column {
    pub block_count: u32,
    pub comparisons_per_block: u32,
    pub origin: u32,
    pub origin_step: u32,
    pub right_offset: u32,
}

impl Column {
    /// Size of one descriptor in the column buffer.
    pub const SIZE: usize = std::mem::size_of::<Column>();

    /// Total comparisons in this stage, i.e. the threads a dispatch needs.
    pub fn comparison_count(&self) -> usize {
        self.block_count as usize * self.comparisons_per_block as usize
    }

    /// The `(left, right)` indices compared by thread `index` of the stage.
    ///
    /// `index` must be below [`Column::comparison_count`].
    pub fn pair(&self, index: usize) -> (usize, usize) {
        let per_block = self.comparisons_per_block as usize;
        let block = index / per_block;
        let comparison = index % per_block;
        let left =
            self.origin as usize + block * self.origin_step as usize + 2 * comparison;
        (left, left + self.right_offset as usize)
    }

    /// Every `(left, right)` pair of the stage in thread order.
    pub fn compare_pairs(&self) -> impl Iterator<Item = (usize, usize)> {
        let column = *self;
        (0..column.comparison_count()).map(move |index| column.pair(index))
    }
}

/// Exact number of columns [`emit_columns`] produces for `n` elements.
///
/// Computed from the same walk as the generator in O(log n):
/// each merge width contributes `3 + 2 * (n / tip) * (power - 2)` columns.
pub fn column_count(n: u32) -> usize {
    let mut count = 0usize;
    let mut tip = FIRST_TIP;
    let mut power = FIRST_TIP.trailing_zeros();
    while tip <= n {
        let block_count = (n / tip) as usize;
        count += 3 + 2 * block_count * (power - 2) as usize;
        match tip.checked_mul(2) {
            Some(next) => tip = next,
            None => break,
        }
        power += 1;
    }
    count
}

/// Closed-form column count `n + log2(n / 64)`.
///
/// The formula is an empirical fit that matches [`column_count`] for powers of
/// two. Its real value is an integer only when `n` is a power of two; for any
/// other `n` (or `n < FIRST_TIP`) there is no estimate and `None` is returned.
pub fn estimated_column_count(n: u32) -> Option<usize> {
    if n < FIRST_TIP || !n.is_power_of_two() {
        return None;
    }
    let log2 = i64::from(n.trailing_zeros()) - 6;
    usize::try_from(i64::from(n) + log2).ok()
}

/// Walk the network for `n` elements and hand every column to `sink` in
/// dispatch order.
///
/// Callers validate `n >= FIRST_TIP`; smaller counts emit nothing.
pub fn emit_columns(n: u32, mut sink: impl FnMut(Column)) {
    let mut tip = FIRST_TIP;
    let mut power = FIRST_TIP.trailing_zeros();

    while tip <= n {
        let block_count = n / tip;

        // i vs i + tip/2. Split by parity so no element is read by one thread
        // while another thread of the same dispatch writes it.
        for parity in 0..2 {
            sink(Column {
                block_count,
                comparisons_per_block: tip / 4,
                origin: parity,
                origin_step: tip,
                right_offset: tip / 2,
            });
        }

        // Inner merge levels, one block at a time.
        for block in 0..block_count {
            let mut row_count = 0u32;
            let mut right_offset = tip / 2;
            for _ in 2..power {
                row_count = 2 * row_count + 1;
                right_offset /= 2;
                let origin = block * tip + right_offset;
                for parity in 0..2 {
                    sink(Column {
                        block_count: row_count,
                        comparisons_per_block: right_offset / 2,
                        origin: origin + parity,
                        origin_step: 2 * right_offset,
                        right_offset,
                    });
                }
            }
        }

        // Neighbour exchange closing the merge.
        sink(Column {
            block_count,
            comparisons_per_block: tip / 2 - 1,
            origin: 1,
            origin_step: tip,
            right_offset: 1,
        });

        match tip.checked_mul(2) {
            Some(next) => tip = next,
            None => break,
        }
        power += 1;
    }
}

/// Write the columns for `n` elements straight into `dest`.
///
/// At most `dest.len()` descriptors are stored. The return value is the number
/// of columns the walk emitted, so a destination of the wrong size shows up as
/// `written != dest.len()` instead of a silent truncation.
pub fn write_columns(n: u32, dest: &mut [Column]) -> usize {
    let mut emitted = 0usize;
    emit_columns(n, |column| {
        if let Some(slot) = dest.get_mut(emitted) {
            *slot = column;
        }
        emitted += 1;
    });
    emitted
}

/// Sort every complete group of [`BASE_GROUP`] elements in place.
///
/// Host equivalent of the base kernel: a five-comparator network per group.
/// A trailing partial group is left untouched.
pub fn sort_groups_of_four(data: &mut [f32]) {
    for group in data.chunks_exact_mut(BASE_GROUP) {
        compare_and_swap(group, 0, 1);
        compare_and_swap(group, 2, 3);
        compare_and_swap(group, 0, 2);
        compare_and_swap(group, 1, 3);
        compare_and_swap(group, 1, 2);
    }
}

/// Swap `data[left]` and `data[right]` when they are out of order.
/// Pairs reaching past the end of `data` are skipped.
#[inline]
pub fn compare_and_swap(data: &mut [f32], left: usize, right: usize) {
    if right < data.len() && data[left] > data[right] {
        data.swap(left, right);
    }
}

/// The complete ordered column sequence for one element count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPlan {
    element_count: u32,
    columns: Vec<Column>,
}

impl NetworkPlan {
    /// Generate the plan for `n` elements.
    pub fn generate(n: u32) -> Self {
        let mut columns = Vec::with_capacity(column_count(n));
        emit_columns(n, |column| columns.push(column));
        Self {
            element_count: n,
            columns,
        }
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The plan in column-buffer wire format.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.columns)
    }

    /// Run the base pass and every column on the host.
    pub fn apply(&self, data: &mut [f32]) {
        debug_assert_eq!(data.len(), self.element_count as usize);
        sort_groups_of_four(data);
        for column in &self.columns {
            for (left, right) in column.compare_pairs() {
                compare_and_swap(data, left, right);
            }
        }
    }
}
