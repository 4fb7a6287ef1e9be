//! Restart recovery and online rollback.
//!
//! Recovery scans the whole log once, repeating history: every page action,
//! forward or compensation, is reapplied to pages whose LSN shows they missed
//! it. Transactions that never committed or ended are then undone. Their
//! trailing structural records (a split or merge cut short by the crash) are
//! reversed first for every loser, so the tree is well formed again before
//! logical undo has to navigate it.

use std::collections::{BTreeMap, BinaryHeap};

use tracing::{debug, info, warn};

use crate::storage::blink::handle::{LatchMode, PageHandle};
use crate::storage::blink::log::{IndexOp, LogBody, LogRecord, PageAction};
use crate::storage::blink::page::PageType;
use crate::storage::blink::BlinkTree;
use crate::storage::txn::{Transaction, TxState};
use crate::types::{BlinkError, Lsn, Result, TxId};

/// Counters describing one recovery run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Log records read.
    pub scanned: usize,
    /// Page actions reapplied.
    pub redone: usize,
    /// Page actions already reflected on their page, or on a released page.
    pub skipped: usize,
    /// Forward actions compensated during undo.
    pub undone: usize,
    /// Transactions rolled back, in id order.
    pub losers: Vec<TxId>,
    /// Largest transaction id found in the log.
    pub max_tx: Option<TxId>,
    /// Released pages deleted from the buffer manager.
    pub swept: usize,
}

struct TxEntry {
    last_lsn: Lsn,
    finished: bool,
}

/// Runs analysis, redo and undo over the log of `tree`.
pub(crate) fn recover(tree: &BlinkTree) -> Result<RecoveryReport> {
    let wal = tree.wal();
    let mut report = RecoveryReport::default();
    let mut table: BTreeMap<TxId, TxEntry> = BTreeMap::new();

    for (lsn, payload) in wal.records() {
        let record = LogRecord::decode(&payload)?;
        report.scanned += 1;
        report.max_tx = report.max_tx.max(Some(record.tx));
        let entry = table.entry(record.tx).or_insert(TxEntry {
            last_lsn: Lsn::ZERO,
            finished: false,
        });
        entry.last_lsn = lsn;
        if matches!(record.body, LogBody::Commit | LogBody::End) {
            entry.finished = true;
        }
        if let Some(action) = record.action() {
            if redo(tree, lsn, action)? {
                report.redone += 1;
            } else {
                report.skipped += 1;
            }
        }
    }
    debug!(
        scanned = report.scanned,
        redone = report.redone,
        skipped = report.skipped,
        "recovery.redo"
    );

    let mut losers: Vec<(Transaction, Lsn)> = table
        .into_iter()
        .filter(|(_, entry)| !entry.finished)
        .map(|(id, entry)| (Transaction::resume(id, entry.last_lsn), entry.last_lsn))
        .collect();
    report.losers = losers.iter().map(|(tx, _)| tx.id()).collect();

    for (tx, next) in losers.iter_mut() {
        report.undone += undo_structural_tail(tree, tx, next)?;
    }

    let mut heap: BinaryHeap<(Lsn, usize)> = losers
        .iter()
        .enumerate()
        .filter(|(_, (_, next))| !next.is_zero())
        .map(|(idx, (_, next))| (*next, idx))
        .collect();
    while let Some((lsn, idx)) = heap.pop() {
        let (tx, next) = &mut losers[idx];
        let (after, undone) = undo_one(tree, tx, lsn)?;
        report.undone += undone;
        *next = after;
        if !after.is_zero() {
            heap.push((after, idx));
        }
    }
    for (tx, _) in &losers {
        tx.log(wal, LogBody::End)?;
        tx.set_state(TxState::Aborted);
    }
    debug!(losers = losers.len(), undone = report.undone, "recovery.undo");

    report.swept = sweep_released(tree)?;
    wal.flush()?;
    tree.pager().flush_all()?;
    info!(
        scanned = report.scanned,
        redone = report.redone,
        undone = report.undone,
        losers = report.losers.len(),
        swept = report.swept,
        "recovery.complete"
    );
    Ok(report)
}

/// Rolls back a live transaction: its chain is undone from the most recent
/// record, then an end record closes it. Returns the number of actions
/// compensated.
pub(crate) fn rollback(tree: &BlinkTree, tx: &Transaction) -> Result<usize> {
    tx.ensure_active()?;
    let mut next = tx.last_lsn();
    let mut undone = 0;
    while !next.is_zero() {
        let (after, count) = undo_one(tree, tx, next)?;
        undone += count;
        next = after;
    }
    tx.log(tree.wal(), LogBody::End)?;
    tx.set_state(TxState::Aborted);
    debug!(tx = %tx.id(), undone, "txn.rollback");
    Ok(undone)
}

/// Reapplies `action` when its page has not seen `lsn` yet. Returns whether
/// the page changed.
fn redo(tree: &BlinkTree, lsn: Lsn, action: &PageAction) -> Result<bool> {
    let creates = matches!(
        &action.op,
        IndexOp::Format { after, .. } if after.page_type != PageType::Free
    );
    let frame = if creates {
        tree.pager().fix_or_create(action.page)?
    } else {
        match tree.pager().fix_page(action.page) {
            Ok(frame) => frame,
            Err(BlinkError::PageNotFound { .. }) => return Ok(false),
            Err(err) => return Err(err.access(action.page, action.root, "redo")),
        }
    };
    let mut page = PageHandle::acquire(&frame, LatchMode::X);
    if page.view().lsn() >= lsn {
        return Ok(false);
    }
    let mut bytes = page.page_mut()?;
    if let Err(err) = action.op.apply(&mut bytes, tree.options().format_version) {
        warn!(page = %action.page, %lsn, error = %err, "recovery.redo_failed");
        return Err(BlinkError::Protocol {
            lsn,
            page: action.page,
            reason: "logged mutation did not apply during redo",
        });
    }
    bytes.set_lsn(lsn);
    Ok(true)
}

/// Reverses the run of structural forward records at the head of a loser's
/// chain. Such a run only exists when a structure modification was cut short
/// before its closing dummy compensation record.
fn undo_structural_tail(tree: &BlinkTree, tx: &Transaction, next: &mut Lsn) -> Result<usize> {
    let mut undone = 0;
    while !next.is_zero() {
        let record = LogRecord::decode(&tree.wal().read(*next)?)?;
        match &record.body {
            LogBody::Action(action) if action.structural => {
                tree.undo_action(tx, *next, &record, action)?;
                *next = record.prev_lsn;
                undone += 1;
            }
            _ => break,
        }
    }
    if undone > 0 {
        debug!(tx = %tx.id(), records = undone, "recovery.smo_tail");
    }
    Ok(undone)
}

/// Processes the record at `lsn` of a chain being undone and returns the
/// next LSN to visit with the number of actions compensated.
fn undo_one(tree: &BlinkTree, tx: &Transaction, lsn: Lsn) -> Result<(Lsn, usize)> {
    let record = LogRecord::decode(&tree.wal().read(lsn)?)?;
    if record.tx != tx.id() {
        return Err(BlinkError::Corruption("undo chain crosses transactions"));
    }
    Ok(match &record.body {
        LogBody::Compensation { undo_next, .. } => (*undo_next, 0),
        LogBody::Action(action) => {
            tree.undo_action(tx, lsn, &record, action)?;
            (record.prev_lsn, 1)
        }
        LogBody::Commit | LogBody::End => (record.prev_lsn, 0),
    })
}

/// Deletes every page left in the released state. Such pages belong to
/// merges whose deallocation never happened, or to allocations undone by
/// recovery.
fn sweep_released(tree: &BlinkTree) -> Result<usize> {
    let pager = tree.pager();
    let mut swept = 0;
    for id in pager.page_ids() {
        let released = {
            let frame = pager.fix_page(id)?;
            let page = PageHandle::acquire(&frame, LatchMode::S);
            page.header()?.page_type == PageType::Free
        };
        if released {
            pager.delete_page(id)?;
            swept += 1;
        }
    }
    Ok(swept)
}
