//! Parallel gradient by columns
//!
//! Root broadcasts a [`Command`]; every rank, root included, evaluates the
//! columns its partition assigns it and reports them through a gather. Root
//! places each column by its index, so arrival order never matters.
//!
//! Session lifecycle, driven by the solver adapter:
//!
//! 1. [`handshake`] on every rank: root broadcasts its [`ProblemState`],
//!    workers check their own layout against it and acknowledge.
//! 2. Workers enter [`serve`]; root issues [`request`]s.
//! 3. Root calls [`release`] exactly once, with `Shutdown` on success or
//!    `Abort` carrying the failure, which workers then return as their error.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::kernel::{Column, Kernel};
use super::partition::Partition;
use crate::error::{OptError, OptResult, RankFailure};
use crate::parallel::{ExecutionContext, ROOT};
use crate::problem::{Problem, ProblemState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Command {
    Columns {
        x: Vec<f64>,
        kernel: Kernel,
        partition: Partition,
    },
    Shutdown,
    Abort {
        failures: Vec<RankFailure>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnReport {
    result: Result<Vec<Column>, String>,
}

fn own_block(problem: &Problem, kernel: &Kernel, x: &[f64], partition: Partition, ctx: &ExecutionContext) -> ColumnReport {
    let indices = partition.columns(x.len(), ctx.size(), ctx.rank());
    ColumnReport {
        result: kernel
            .columns(problem, x, &indices)
            .map_err(|e| e.to_string()),
    }
}

fn failures_from_acks(acks: impl IntoIterator<Item = (usize, Option<String>)>) -> Vec<RankFailure> {
    acks.into_iter()
        .filter_map(|(rank, mismatch)| {
            mismatch.map(|reason| RankFailure {
                rank,
                reason: format!("problem layout differs from root: {}", reason),
            })
        })
        .collect()
}

pub(crate) fn handshake(problem: &Problem, ctx: &ExecutionContext) -> OptResult<()> {
    if ctx.is_root() {
        let state = problem.state();
        ctx.broadcast(Some(&state))?;
        let acks: Option<String> = None;
        let gathered = ctx
            .gather(&acks)?
            .ok_or_else(|| OptError::Communication("root received no acknowledgements".to_string()))?;
        let failures = failures_from_acks(gathered);
        if !failures.is_empty() {
            return Err(OptError::DerivativeEvaluation { failures });
        }
        debug!(ranks = ctx.size(), "parallel sensitivity session established");
    } else {
        let root_state: ProblemState = ctx.broadcast(None)?;
        let mismatch = root_state.layout_mismatch(&problem.state());
        if let Some(reason) = &mismatch {
            warn!(rank = ctx.rank(), %reason, "problem layout differs from root");
        }
        ctx.gather(&mismatch)?;
    }
    Ok(())
}

/// Root side of one Jacobian request.
pub(crate) fn request(
    problem: &Problem,
    kernel: Kernel,
    x: &[f64],
    partition: Partition,
    ctx: &ExecutionContext,
) -> OptResult<Vec<Column>> {
    let command = Command::Columns {
        x: x.to_vec(),
        kernel: kernel.clone(),
        partition,
    };
    ctx.broadcast(Some(&command))?;
    let own = own_block(problem, &kernel, x, partition, ctx);
    let reports = ctx
        .gather(&own)?
        .ok_or_else(|| OptError::Communication("root received no column reports".to_string()))?;

    let mut columns = Vec::with_capacity(x.len());
    let mut failures = Vec::new();
    for (rank, report) in reports {
        match report.result {
            Ok(block) => columns.extend(block),
            Err(reason) => failures.push(RankFailure { rank, reason }),
        }
    }
    if !failures.is_empty() {
        return Err(OptError::DerivativeEvaluation { failures });
    }
    Ok(columns)
}

/// Worker loop. Returns once root releases the session.
pub(crate) fn serve(problem: &Problem, ctx: &ExecutionContext) -> OptResult<usize> {
    let mut served = 0;
    loop {
        let command: Command = ctx.broadcast(None)?;
        match command {
            Command::Columns { x, kernel, partition } => {
                let report = own_block(problem, &kernel, &x, partition, ctx);
                if let Err(reason) = &report.result {
                    debug!(rank = ctx.rank(), %reason, "column evaluation failed");
                }
                ctx.gather(&report)?;
                served += 1;
            }
            Command::Shutdown => {
                debug!(rank = ctx.rank(), served, "released by root");
                return Ok(served);
            }
            Command::Abort { failures } => {
                return Err(OptError::DerivativeEvaluation { failures });
            }
        }
    }
}

/// End the session from root. An error travels to the workers as the
/// failure list they report.
pub(crate) fn release(ctx: &ExecutionContext, error: Option<&OptError>) -> OptResult<()> {
    let command = match error {
        None => Command::Shutdown,
        Some(OptError::DerivativeEvaluation { failures }) => Command::Abort {
            failures: failures.clone(),
        },
        Some(other) => Command::Abort {
            failures: vec![RankFailure {
                rank: ROOT,
                reason: other.to_string(),
            }],
        },
    };
    ctx.broadcast(Some(&command))?;
    Ok(())
}
