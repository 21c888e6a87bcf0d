//! Ranks hosted on OS threads, exchanging bytes over channels
//!
//! Each rank blocks on its own tokio unbounded channel, so no runtime is
//! needed. A rank that unwinds tells every peer it is gone; their pending
//! and future collectives then fail with [`OptError::Communication`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

use super::{Communicator, ExecutionContext, Rank};
use crate::error::{OptError, OptResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    Broadcast,
    Gather,
}

#[derive(Debug)]
struct Envelope {
    source: Rank,
    collective: Collective,
    /// Position of the collective in this group's call sequence.
    sequence: u64,
    payload: Vec<u8>,
}

#[derive(Debug)]
enum Packet {
    Message(Envelope),
    /// The rank is unwinding and takes part in no further collective.
    Down(Rank),
}

/// One rank's endpoint in an in-process group.
///
/// Messages that arrive ahead of the collective that expects them wait in a
/// pending buffer, so ranks may run ahead of each other by several calls.
pub struct ThreadComm {
    rank: Rank,
    size: usize,
    /// Senders to every other rank; `None` at our own position.
    peers: Vec<Option<UnboundedSender<Packet>>>,
    inbox: RefCell<UnboundedReceiver<Packet>>,
    pending: RefCell<Vec<Envelope>>,
    sequence: Cell<u64>,
    /// First peer reported down, if any.
    lost: Cell<Option<Rank>>,
}

impl ThreadComm {
    /// Create the endpoints of a group of `size` ranks, in rank order.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded_channel::<Packet>()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadComm {
                rank,
                size,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(peer, tx)| (peer != rank).then(|| tx.clone()))
                    .collect(),
                inbox: RefCell::new(inbox),
                pending: RefCell::new(Vec::new()),
                sequence: Cell::new(0),
                lost: Cell::new(None),
            })
            .collect()
    }

    fn next_sequence(&self) -> u64 {
        let seq = self.sequence.get();
        self.sequence.set(seq + 1);
        seq
    }

    fn check_root(&self, root: Rank) -> OptResult<()> {
        if root < self.size {
            Ok(())
        } else {
            Err(OptError::Communication(format!(
                "root {} out of range for {} ranks",
                root, self.size
            )))
        }
    }

    fn lost_peer(&self, peer: Rank) -> OptError {
        OptError::Communication(format!("rank {}: rank {} terminated", self.rank, peer))
    }

    fn send(&self, dest: Rank, collective: Collective, sequence: u64, payload: Vec<u8>) -> OptResult<()> {
        let tx = self
            .peers
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or_else(|| OptError::Communication(format!("no channel to rank {}", dest)))?;
        tx.send(Packet::Message(Envelope {
            source: self.rank,
            collective,
            sequence,
            payload,
        }))
        .map_err(|_| OptError::Communication(format!("rank {} hung up", dest)))
    }

    /// Block until a message of the given collective and sequence arrives,
    /// optionally from one specific source.
    fn receive(&self, collective: Collective, sequence: u64, source: Option<Rank>) -> OptResult<Envelope> {
        let matches = |e: &Envelope| {
            e.collective == collective && e.sequence == sequence && source.map_or(true, |s| s == e.source)
        };
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|e| matches(e)) {
                return Ok(pending.remove(pos));
            }
        }
        if let Some(peer) = self.lost.get() {
            return Err(self.lost_peer(peer));
        }
        let mut inbox = self.inbox.borrow_mut();
        loop {
            let packet = inbox.blocking_recv().ok_or_else(|| {
                OptError::Communication(format!("rank {}: every peer hung up", self.rank))
            })?;
            match packet {
                Packet::Message(envelope) if matches(&envelope) => return Ok(envelope),
                Packet::Message(envelope) => {
                    trace!(rank = self.rank, source = envelope.source, "buffering early message");
                    self.pending.borrow_mut().push(envelope);
                }
                Packet::Down(peer) => {
                    warn!(rank = self.rank, peer, "peer rank terminated");
                    self.lost.set(Some(peer));
                    return Err(self.lost_peer(peer));
                }
            }
        }
    }
}

impl Drop for ThreadComm {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        warn!(rank = self.rank, "rank unwinding, notifying peers");
        for tx in self.peers.iter().flatten() {
            // peers that already finished have dropped their inbox
            let _ = tx.send(Packet::Down(self.rank));
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&self, root: Rank, payload: &[u8]) -> OptResult<Vec<u8>> {
        self.check_root(root)?;
        let seq = self.next_sequence();
        if self.rank == root {
            for dest in (0..self.size).filter(|&r| r != root) {
                self.send(dest, Collective::Broadcast, seq, payload.to_vec())?;
            }
            Ok(payload.to_vec())
        } else {
            Ok(self.receive(Collective::Broadcast, seq, Some(root))?.payload)
        }
    }

    fn gather(&self, root: Rank, payload: &[u8]) -> OptResult<Option<BTreeMap<Rank, Vec<u8>>>> {
        self.check_root(root)?;
        let seq = self.next_sequence();
        if self.rank != root {
            self.send(root, Collective::Gather, seq, payload.to_vec())?;
            return Ok(None);
        }
        let mut parts = BTreeMap::new();
        parts.insert(root, payload.to_vec());
        while parts.len() < self.size {
            let envelope = self.receive(Collective::Gather, seq, None)?;
            parts.insert(envelope.source, envelope.payload);
        }
        Ok(Some(parts))
    }
}

/// Runs a closure once per rank, each on its own scoped thread.
pub struct ThreadGroup;

impl ThreadGroup {
    /// Spawn `size` ranks, hand each its [`ExecutionContext`] and return the
    /// closure results in rank order.
    ///
    /// A panic on any rank is re-raised here once every rank has returned.
    /// Ranks blocked on the panicking one see a `Communication` error.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(ExecutionContext) -> T + Sync,
        T: Send,
    {
        let comms = ThreadComm::group(size);
        std::thread::scope(|scope| {
            let f = &f;
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(ExecutionContext::new(comm))))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(value) => value,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}
