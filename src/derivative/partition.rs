use serde::{Deserialize, Serialize};

use crate::parallel::Rank;

/// Assignment of Jacobian columns to ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Partition {
    /// Rank `r` owns the block `[r*b, min((r+1)*b, n))` with `b = ceil(n/W)`.
    #[default]
    Contiguous,
    /// Rank `r` owns every column `j` with `j % W == r`.
    RoundRobin,
}

impl Partition {
    /// Column indices owned by `rank` in a group of `size` ranks.
    pub fn columns(&self, n: usize, size: usize, rank: Rank) -> Vec<usize> {
        let size = size.max(1);
        match self {
            Partition::Contiguous => {
                let block = n.div_ceil(size);
                let start = (rank * block).min(n);
                let end = ((rank + 1) * block).min(n);
                (start..end).collect()
            }
            Partition::RoundRobin => (rank..n).step_by(size).collect(),
        }
    }
}
