//! Row-stripe partitioning of a raster

/// A contiguous run of full raster rows assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stripe {
    /// Worker the stripe belongs to
    pub index: usize,
    /// First row of the stripe
    pub row_offset: usize,
    /// Number of rows in this stripe
    pub rows: usize,
}

impl Stripe {
    /// One past the last row
    pub fn row_end(&self) -> usize {
        self.row_offset + self.rows
    }

    pub fn row_range(&self) -> std::ops::Range<usize> {
        self.row_offset..self.row_end()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// Split `height` rows into `count` stripes of `height / count` rows.
///
/// The remainder goes to the last stripe. With more stripes than rows the
/// leading stripes are empty.
pub fn stripes(height: usize, count: usize) -> Vec<Stripe> {
    let count = count.max(1);
    let base = height / count;
    (0..count)
        .map(|index| {
            let row_offset = index * base;
            let rows = if index + 1 == count {
                height - row_offset
            } else {
                base
            };
            Stripe {
                index,
                row_offset,
                rows,
            }
        })
        .collect()
}
