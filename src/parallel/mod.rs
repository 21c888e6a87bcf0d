//! Parallel substrate
//!
//! Ranks cooperate only through explicit collectives on a [`Communicator`].
//! Rank identity travels in an [`ExecutionContext`] passed to every call that
//! needs it; there is no process-global rank state.
//!
//! Two communicators are bundled: [`SingleProcess`] (one rank) and
//! [`ThreadComm`], a group of ranks hosted on OS threads and created with
//! [`ThreadGroup::run`].

pub mod local;
pub mod threads;

pub use local::SingleProcess;
pub use threads::{ThreadComm, ThreadGroup};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{OptError, OptResult};

/// Index of a rank within its group.
pub type Rank = usize;

/// The rank that owns the problem and drives the solver.
pub const ROOT: Rank = 0;

/// Byte-level collectives.
///
/// Every rank of a group must call the same collectives in the same order.
pub trait Communicator: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Distribute `payload` from `root` to every rank. Non-root ranks pass an
    /// empty slice and receive root's bytes.
    fn broadcast(&self, root: Rank, payload: &[u8]) -> OptResult<Vec<u8>>;

    /// Collect one payload per rank at `root`, keyed by source rank. Non-root
    /// ranks get `None`.
    fn gather(&self, root: Rank, payload: &[u8]) -> OptResult<Option<BTreeMap<Rank, Vec<u8>>>>;
}

/// Rank identity plus typed collectives over a communicator.
pub struct ExecutionContext {
    comm: Box<dyn Communicator>,
}

impl ExecutionContext {
    pub fn new(comm: impl Communicator + 'static) -> Self {
        Self {
            comm: Box::new(comm),
        }
    }

    /// A context with a single rank.
    pub fn single() -> Self {
        Self::new(SingleProcess)
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == ROOT
    }

    /// Broadcast a value from [`ROOT`]. Root passes `Some(value)`, workers
    /// pass `None`.
    pub fn broadcast<T>(&self, value: Option<&T>) -> OptResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = match (self.is_root(), value) {
            (true, Some(v)) => bincode::serialize(v)?,
            (true, None) => {
                return Err(OptError::Communication(
                    "root must supply the broadcast value".to_string(),
                ))
            }
            (false, _) => Vec::new(),
        };
        let bytes = self.comm.broadcast(ROOT, &payload)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Gather one value per rank at [`ROOT`].
    pub fn gather<T>(&self, value: &T) -> OptResult<Option<BTreeMap<Rank, T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = bincode::serialize(value)?;
        match self.comm.gather(ROOT, &payload)? {
            Some(parts) => {
                let mut out = BTreeMap::new();
                for (rank, bytes) in parts {
                    out.insert(rank, bincode::deserialize(&bytes)?);
                }
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}
