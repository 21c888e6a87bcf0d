use std::collections::BTreeMap;

use super::{Communicator, Rank, ROOT};
use crate::error::{OptError, OptResult};

/// A group of exactly one rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

fn check_root(root: Rank) -> OptResult<()> {
    if root == ROOT {
        Ok(())
    } else {
        Err(OptError::Communication(format!(
            "root {} out of range for a single rank",
            root
        )))
    }
}

impl Communicator for SingleProcess {
    fn rank(&self) -> Rank {
        ROOT
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast(&self, root: Rank, payload: &[u8]) -> OptResult<Vec<u8>> {
        check_root(root)?;
        Ok(payload.to_vec())
    }

    fn gather(&self, root: Rank, payload: &[u8]) -> OptResult<Option<BTreeMap<Rank, Vec<u8>>>> {
        check_root(root)?;
        Ok(Some(BTreeMap::from([(ROOT, payload.to_vec())])))
    }
}
