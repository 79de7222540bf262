//! Cursors: tree search, ordered traversal, and tree surgery.
//!
//! A cursor is an explicit stack of `(page, index)` pairs from the root
//! of its table to a leaf entry. Reads walk the stack; writes copy the
//! whole stack path first (the engine's copy-on-write step), then insert
//! or delete through it, splitting and rebalancing as nodes fill or
//! drain. Duplicate-sorted tables store each key's values as a nested
//! tree whose record lives in the owning leaf entry; a sub-cursor tracks
//! the position inside it.

use std::borrow::Cow;
use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::db::{Dbi, KeyCmp};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::node::{self, move_entries, Item, NodeMut, NodeRef};
use crate::txn::{TxnInternal, TxnRead, WriteTxn};
use crate::{DbFlags, WriteFlags, CURSOR_STACK, MAX_KEY_SIZE, P_INVALID};

/// Everything a search needs to know about one tree.
#[derive(Clone, Copy)]
pub(crate) struct TreeRef {
    pub root: u64,
    pub flags: DbFlags,
    pub cmp: KeyCmp,
    pub dcmp: KeyCmp,
}

impl TreeRef {
    /// The nested tree named by a duplicate entry's record.
    fn sub(&self, rec: &DbRecord) -> TreeRef {
        TreeRef {
            root: rec.root,
            flags: rec.db_flags(),
            cmp: self.dcmp,
            dcmp: self.dcmp,
        }
    }
}

/// Working copy of a tree's record during surgery.
struct TreeCtx {
    rec: DbRecord,
    cmp: KeyCmp,
    /// Fixed key width when nodes are leaf2; zero otherwise.
    leaf2: u16,
}

#[derive(Clone, Copy, Debug)]
struct StackEntry {
    pgno: u64,
    ix: usize,
}

struct SubCursor {
    rec: DbRecord,
    stack: Vec<StackEntry>,
}

/// Cursor position shared by the read and write cursor types.
pub(crate) struct CursorState {
    dbi: Dbi,
    stack: Vec<StackEntry>,
    sub: Option<SubCursor>,
    init: bool,
    eof: bool,
    /// Set right after a delete: the stack already points at the
    /// successor entry, so the next `Next` must not advance.
    del_pending: bool,
}

impl CursorState {
    fn new(dbi: Dbi) -> CursorState {
        CursorState {
            dbi,
            stack: Vec::new(),
            sub: None,
            init: false,
            eof: false,
            del_pending: false,
        }
    }

    fn top(&self) -> Result<StackEntry> {
        self.stack.last().copied().ok_or(Error::NotFound)
    }
}

/// Cursor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    GetMultiple,
    Last,
    LastDup,
    Next,
    NextDup,
    NextNoDup,
    NextMultiple,
    Prev,
    PrevDup,
    PrevNoDup,
    PrevMultiple,
    Set,
    SetKey,
    SetRange,
}

// ---------------------------------------------------------------------
// Raw node access
//
// Pages live in the environment mapping, which outlives every
// transaction; a cloned Env handle pins it. Mutable access is sound
// because exactly one write transaction exists and only its dirty pages
// are handed out mutably.
// ---------------------------------------------------------------------

fn ref_node(env: &Env, pgno: u64) -> Result<NodeRef<'_>> {
    Ok(NodeRef::new(env.page(pgno)?))
}

fn mut_node(env: &Env, pgno: u64) -> Result<NodeMut<'_>> {
    unsafe { Ok(NodeMut::new(env.page_mut(pgno)?)) }
}

// ---------------------------------------------------------------------
// Search and traversal
// ---------------------------------------------------------------------

/// Index of the branch slot to descend for `key`: the largest slot whose
/// key compares `<= key`, or slot 0.
fn branch_index(node: &NodeRef<'_>, cmp: &KeyCmp, key: &[u8]) -> Result<usize> {
    let n = node.num_entries();
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp.compare(key, node.key(mid)?) {
            Ordering::Less => hi = mid,
            _ => lo = mid + 1,
        }
    }
    Ok(lo.saturating_sub(1))
}

/// Binary search within a leaf: `(index, exact)` where `index` is the
/// position of the match or the insertion point.
fn leaf_search(node: &NodeRef<'_>, cmp: &KeyCmp, key: &[u8]) -> Result<(usize, bool)> {
    let n = node.num_entries();
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp.compare(node.key(mid)?, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Descend to the leaf position for `key`. Returns `(exact, nonempty)`.
fn descend_key<T: TxnInternal + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    cmp: &KeyCmp,
    key: &[u8],
    stack: &mut Vec<StackEntry>,
) -> Result<(bool, bool)> {
    stack.clear();
    if tree.root == P_INVALID {
        return Ok((false, false));
    }
    let mut pgno = tree.root;
    loop {
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let node = txn.node(pgno)?;
        if node.is_branch() {
            let ix = branch_index(&node, cmp, key)?;
            stack.push(StackEntry { pgno, ix });
            pgno = node.child(ix)?;
        } else {
            let (ix, exact) = leaf_search(&node, cmp, key)?;
            stack.push(StackEntry { pgno, ix });
            return Ok((exact, true));
        }
    }
}

/// Walk to the smallest (or largest) entry of the tree.
fn descend_edge<T: TxnInternal + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    last: bool,
    stack: &mut Vec<StackEntry>,
) -> Result<bool> {
    stack.clear();
    if tree.root == P_INVALID {
        return Ok(false);
    }
    let mut pgno = tree.root;
    loop {
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let node = txn.node(pgno)?;
        let ix = if last {
            node.num_entries().saturating_sub(1)
        } else {
            0
        };
        stack.push(StackEntry { pgno, ix });
        if node.is_branch() {
            pgno = node.child(ix)?;
        } else {
            return Ok(node.num_entries() > 0);
        }
    }
}

/// Advance the stack to the next leaf entry; `false` at the end. Leaf
/// crossings consult the parent so the depth stays exact, then follow
/// the leftmost spine down again.
fn next_pos<T: TxnInternal + ?Sized>(txn: &T, stack: &mut Vec<StackEntry>) -> Result<bool> {
    let Some(top) = stack.last().copied() else {
        return Ok(false);
    };
    let node = txn.node(top.pgno)?;
    if top.ix + 1 < node.num_entries() {
        stack.last_mut().unwrap().ix += 1;
        return Ok(true);
    }
    // Climb until a right turn is possible.
    let mut level = stack.len();
    loop {
        if level == 1 {
            return Ok(false);
        }
        level -= 1;
        let e = stack[level - 1];
        let n = txn.node(e.pgno)?.num_entries();
        if e.ix + 1 < n {
            stack.truncate(level);
            stack[level - 1].ix += 1;
            break;
        }
    }
    // Descend leftmost back to leaf depth.
    loop {
        let e = *stack.last().unwrap();
        let node = txn.node(e.pgno)?;
        if !node.is_branch() {
            return Ok(true);
        }
        let child = node.child(e.ix)?;
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        stack.push(StackEntry { pgno: child, ix: 0 });
    }
}

/// Step back to the previous leaf entry; `false` before the start.
fn prev_pos<T: TxnInternal + ?Sized>(txn: &T, stack: &mut Vec<StackEntry>) -> Result<bool> {
    let Some(top) = stack.last().copied() else {
        return Ok(false);
    };
    if top.ix > 0 {
        stack.last_mut().unwrap().ix -= 1;
        return Ok(true);
    }
    let mut level = stack.len();
    loop {
        if level == 1 {
            return Ok(false);
        }
        level -= 1;
        if stack[level - 1].ix > 0 {
            stack.truncate(level);
            stack[level - 1].ix -= 1;
            break;
        }
    }
    // Descend the rightmost spine back to leaf depth.
    loop {
        let e = *stack.last().unwrap();
        let node = txn.node(e.pgno)?;
        if !node.is_branch() {
            return Ok(true);
        }
        let child = node.child(e.ix)?;
        let cn = txn.node(child)?;
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        stack.push(StackEntry {
            pgno: child,
            ix: cn.num_entries().saturating_sub(1),
        });
    }
}

/// Read an entry's value, chasing overflow chains.
fn read_value<'x, T: TxnInternal + ?Sized>(
    txn: &'x T,
    node: NodeRef<'x>,
    ix: usize,
) -> Result<Cow<'x, [u8]>> {
    if node.is_leaf2() {
        return Ok(Cow::Borrowed(&[]));
    }
    let flags = node.entry_flags(ix)?;
    if flags & node::F_OVERFLOW != 0 {
        let (first, last, len) = node.overflow_span(ix)?;
        if len <= node::OVERFLOW_DATA {
            let ov = txn.node(first)?;
            return Ok(Cow::Borrowed(&ov.overflow_data()[..len]));
        }
        let mut out = Vec::with_capacity(len);
        for pg in first..=last {
            let ov = txn.node(pg)?;
            let take = (len - out.len()).min(node::OVERFLOW_DATA);
            out.extend_from_slice(&ov.overflow_data()[..take]);
        }
        return Ok(Cow::Owned(out));
    }
    Ok(Cow::Borrowed(node.value(ix)?))
}

fn parse_sub_record(node: &NodeRef<'_>, ix: usize) -> Result<DbRecord> {
    if node.value_len(ix)? != std::mem::size_of::<DbRecord>() {
        return Err(Error::Corrupted("malformed duplicate sub-tree record"));
    }
    Ok(bytemuck::pod_read_unaligned(node.value(ix)?))
}

// ---------------------------------------------------------------------
// Whole-tree lookups used by the transaction layer
// ---------------------------------------------------------------------

/// Exact-match search returning the owning leaf and slot.
pub(crate) fn search_exact<T: TxnInternal>(
    txn: &T,
    tree: &TreeRef,
    key: &[u8],
) -> Result<Option<(u64, usize)>> {
    let mut stack = Vec::new();
    let (exact, _) = descend_key(txn, tree, &tree.cmp, key, &mut stack)?;
    if !exact {
        return Ok(None);
    }
    let top = stack.last().unwrap();
    Ok(Some((top.pgno, top.ix)))
}

/// `get`: the value stored under `key`; the first duplicate for
/// duplicate-sorted tables.
pub(crate) fn tree_get<'x, T: TxnInternal>(
    txn: &'x T,
    dbi: Dbi,
    key: &[u8],
) -> Result<Cow<'x, [u8]>> {
    let tree = txn.tree_of(dbi)?;
    let mut stack = Vec::new();
    let (exact, _) = descend_key(txn, &tree, &tree.cmp, key, &mut stack)?;
    if !exact {
        return Err(Error::NotFound);
    }
    let top = stack.last().unwrap();
    let node = txn.node(top.pgno)?;
    if node.entry_flags(top.ix)? & node::F_DUPDATA != 0 {
        let rec = parse_sub_record(&node, top.ix)?;
        let sub = tree.sub(&rec);
        let mut sub_stack = Vec::new();
        if !descend_edge(txn, &sub, false, &mut sub_stack)? {
            return Err(Error::Corrupted("empty duplicate sub-tree"));
        }
        let st = sub_stack.last().unwrap();
        let sn = txn.node(st.pgno)?;
        return Ok(Cow::Borrowed(sn.key(st.ix)?));
    }
    read_value(txn, node, top.ix)
}

/// First free-list record with key `>= from`, decoded.
pub(crate) fn freelist_next<T: TxnInternal>(
    txn: &T,
    tree: &TreeRef,
    from: &[u8],
) -> Result<Option<(u64, Vec<u64>)>> {
    let mut stack = Vec::new();
    let (_, any) = descend_key(txn, tree, &tree.cmp, from, &mut stack)?;
    if !any {
        return Ok(None);
    }
    {
        let top = stack.last().unwrap();
        let node = txn.node(top.pgno)?;
        if top.ix >= node.num_entries() {
            stack.last_mut().unwrap().ix = node.num_entries() - 1;
            if !next_pos(txn, &mut stack)? {
                return Ok(None);
            }
        }
    }
    let top = stack.last().unwrap();
    let node = txn.node(top.pgno)?;
    let txnid = LittleEndian::read_u64(node.key(top.ix)?);
    let value = read_value(txn, node, top.ix)?;
    let ids = value.chunks_exact(8).map(LittleEndian::read_u64).collect();
    Ok(Some((txnid, ids)))
}

// ---------------------------------------------------------------------
// The shared get-operation core
// ---------------------------------------------------------------------

fn load_sub_at<T: TxnInternal + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    state: &mut CursorState,
    at_last: bool,
) -> Result<()> {
    state.sub = None;
    let top = state.top()?;
    let node = txn.node(top.pgno)?;
    if node.is_leaf2() {
        return Ok(());
    }
    if node.entry_flags(top.ix)? & node::F_DUPDATA != 0 {
        let rec = parse_sub_record(&node, top.ix)?;
        let sub_tree = tree.sub(&rec);
        let mut stack = Vec::new();
        if !descend_edge(txn, &sub_tree, at_last, &mut stack)? {
            return Err(Error::Corrupted("empty duplicate sub-tree"));
        }
        state.sub = Some(SubCursor { rec, stack });
    }
    Ok(())
}

fn current_key<'x, T: TxnInternal + ?Sized>(
    txn: &'x T,
    state: &CursorState,
) -> Result<Cow<'x, [u8]>> {
    let top = state.top()?;
    let node = txn.node(top.pgno)?;
    Ok(Cow::Borrowed(node.key(top.ix)?))
}

fn current_value<'x, T: TxnInternal + ?Sized>(
    txn: &'x T,
    state: &CursorState,
) -> Result<Cow<'x, [u8]>> {
    if let Some(sub) = &state.sub {
        let st = sub.stack.last().ok_or(Error::NotFound)?;
        let sn = txn.node(st.pgno)?;
        return Ok(Cow::Borrowed(sn.key(st.ix)?));
    }
    let top = state.top()?;
    read_value(txn, txn.node(top.pgno)?, top.ix)
}

type Pair<'x> = (Cow<'x, [u8]>, Cow<'x, [u8]>);

fn pair<'x, T: TxnInternal + ?Sized>(txn: &'x T, state: &CursorState) -> Result<Pair<'x>> {
    Ok((current_key(txn, state)?, current_value(txn, state)?))
}

/// One cursor-get operation against `state`.
pub(crate) fn op_get<'x, T: TxnInternal + ?Sized>(
    txn: &'x T,
    state: &mut CursorState,
    op: CursorOp,
    key: Option<&[u8]>,
    data: Option<&[u8]>,
) -> Result<Pair<'x>> {
    let tree = txn.tree_of(state.dbi)?;
    let dupsort = tree.flags.contains(DbFlags::DUPSORT);
    match op {
        CursorOp::First | CursorOp::Last => {
            let last = op == CursorOp::Last;
            state.del_pending = false;
            if !descend_edge(txn, &tree, last, &mut state.stack)? {
                state.init = false;
                return Err(Error::NotFound);
            }
            state.init = true;
            state.eof = false;
            load_sub_at(txn, &tree, state, last)?;
            pair(txn, state)
        }
        CursorOp::GetCurrent => {
            if !state.init || state.eof {
                return Err(Error::NotFound);
            }
            pair(txn, state)
        }
        CursorOp::Set | CursorOp::SetKey | CursorOp::SetRange => {
            let key = key.ok_or(Error::InvalidArg("key required"))?;
            state.del_pending = false;
            let (exact, any) = descend_key(txn, &tree, &tree.cmp, key, &mut state.stack)?;
            if !any {
                state.init = false;
                return Err(Error::NotFound);
            }
            if !exact {
                if op != CursorOp::SetRange {
                    state.init = false;
                    return Err(Error::NotFound);
                }
                // Insertion point may be one past the leaf's end.
                let top = state.top()?;
                let n = txn.node(top.pgno)?.num_entries();
                if top.ix >= n {
                    state.stack.last_mut().unwrap().ix = n - 1;
                    if !next_pos(txn, &mut state.stack)? {
                        state.init = false;
                        state.eof = true;
                        return Err(Error::NotFound);
                    }
                }
            }
            state.init = true;
            state.eof = false;
            load_sub_at(txn, &tree, state, false)?;
            pair(txn, state)
        }
        CursorOp::Next | CursorOp::NextNoDup => {
            if !state.init {
                return op_get(txn, state, CursorOp::First, None, None);
            }
            if state.eof {
                return Err(Error::NotFound);
            }
            if state.del_pending {
                // The delete already left us on the successor.
                state.del_pending = false;
                load_sub_at(txn, &tree, state, false)?;
                return pair(txn, state);
            }
            if op == CursorOp::Next {
                let advanced = match &mut state.sub {
                    Some(sub) => next_pos(txn, &mut sub.stack)?,
                    None => false,
                };
                if advanced {
                    return pair(txn, state);
                }
            }
            if !next_pos(txn, &mut state.stack)? {
                state.eof = true;
                return Err(Error::NotFound);
            }
            load_sub_at(txn, &tree, state, false)?;
            pair(txn, state)
        }
        CursorOp::Prev | CursorOp::PrevNoDup => {
            if !state.init {
                return op_get(txn, state, CursorOp::Last, None, None);
            }
            state.del_pending = false;
            if state.eof {
                state.eof = false;
                load_sub_at(txn, &tree, state, true)?;
                return pair(txn, state);
            }
            if op == CursorOp::Prev {
                let moved = match &mut state.sub {
                    Some(sub) => prev_pos(txn, &mut sub.stack)?,
                    None => false,
                };
                if moved {
                    return pair(txn, state);
                }
            }
            if !prev_pos(txn, &mut state.stack)? {
                state.init = false;
                return Err(Error::NotFound);
            }
            load_sub_at(txn, &tree, state, true)?;
            pair(txn, state)
        }
        CursorOp::FirstDup | CursorOp::LastDup => {
            if !dupsort {
                return Err(Error::Incompatible);
            }
            if !state.init {
                return Err(Error::NotFound);
            }
            let last = op == CursorOp::LastDup;
            load_sub_at(txn, &tree, state, last)?;
            pair(txn, state)
        }
        CursorOp::NextDup | CursorOp::PrevDup => {
            if !dupsort {
                return Err(Error::Incompatible);
            }
            if !state.init {
                return Err(Error::NotFound);
            }
            let moved = match &mut state.sub {
                Some(sub) => {
                    if op == CursorOp::NextDup {
                        next_pos(txn, &mut sub.stack)?
                    } else {
                        prev_pos(txn, &mut sub.stack)?
                    }
                }
                None => return Err(Error::NotFound),
            };
            if !moved {
                return Err(Error::NotFound);
            }
            pair(txn, state)
        }
        CursorOp::GetBoth | CursorOp::GetBothRange => {
            if !dupsort {
                return Err(Error::Incompatible);
            }
            let key = key.ok_or(Error::InvalidArg("key required"))?;
            let data = data.ok_or(Error::InvalidArg("data required"))?;
            state.del_pending = false;
            let (exact, _) = descend_key(txn, &tree, &tree.cmp, key, &mut state.stack)?;
            if !exact {
                state.init = false;
                return Err(Error::NotFound);
            }
            state.init = true;
            state.eof = false;
            let top = state.top()?;
            let node = txn.node(top.pgno)?;
            if node.entry_flags(top.ix)? & node::F_DUPDATA != 0 {
                let rec = parse_sub_record(&node, top.ix)?;
                let sub_tree = tree.sub(&rec);
                let mut stack = Vec::new();
                let (dexact, _) = descend_key(txn, &sub_tree, &sub_tree.cmp, data, &mut stack)?;
                if !dexact {
                    if op == CursorOp::GetBoth {
                        return Err(Error::NotFound);
                    }
                    let t = *stack.last().ok_or(Error::NotFound)?;
                    let n = txn.node(t.pgno)?.num_entries();
                    if t.ix >= n {
                        stack.last_mut().unwrap().ix = n - 1;
                        if !next_pos(txn, &mut stack)? {
                            return Err(Error::NotFound);
                        }
                    }
                }
                state.sub = Some(SubCursor { rec, stack });
                return pair(txn, state);
            }
            state.sub = None;
            let have = read_value(txn, node, top.ix)?;
            let ord = tree.dcmp.compare(&have, data);
            let ok = match op {
                CursorOp::GetBoth => ord == Ordering::Equal,
                _ => ord != Ordering::Less,
            };
            if !ok {
                return Err(Error::NotFound);
            }
            pair(txn, state)
        }
        CursorOp::GetMultiple | CursorOp::NextMultiple | CursorOp::PrevMultiple => {
            if !tree.flags.contains(DbFlags::DUPFIXED) {
                return Err(Error::Incompatible);
            }
            if !state.init {
                return Err(Error::NotFound);
            }
            if state.sub.is_none() {
                // A lone value is a run of one.
                if op != CursorOp::GetMultiple {
                    return Err(Error::NotFound);
                }
                return pair(txn, state);
            }
            let t = {
                let sub = state.sub.as_mut().unwrap();
                match op {
                    CursorOp::NextMultiple => {
                        // Jump past the current leaf's run.
                        let t = *sub.stack.last().ok_or(Error::NotFound)?;
                        let n = txn.node(t.pgno)?.num_entries();
                        sub.stack.last_mut().unwrap().ix = n - 1;
                        if !next_pos(txn, &mut sub.stack)? {
                            return Err(Error::NotFound);
                        }
                    }
                    CursorOp::PrevMultiple => {
                        sub.stack.last_mut().unwrap().ix = 0;
                        if !prev_pos(txn, &mut sub.stack)? {
                            return Err(Error::NotFound);
                        }
                        sub.stack.last_mut().unwrap().ix = 0;
                    }
                    _ => {}
                }
                *sub.stack.last().ok_or(Error::NotFound)?
            };
            let sn = txn.node(t.pgno)?;
            let run = sn.leaf2_keys_from(t.ix)?;
            Ok((current_key(txn, state)?, Cow::Borrowed(run)))
        }
    }
}

fn op_count<T: TxnInternal + ?Sized>(txn: &T, state: &CursorState) -> Result<u64> {
    if !state.init || state.eof {
        return Err(Error::NotFound);
    }
    if let Some(sub) = &state.sub {
        return Ok(sub.rec.entries);
    }
    let top = state.top()?;
    if top.ix >= txn.node(top.pgno)?.num_entries() {
        return Err(Error::NotFound);
    }
    Ok(1)
}

// ---------------------------------------------------------------------
// Read cursor
// ---------------------------------------------------------------------

/// A read-only cursor over one table.
pub struct Cursor<'t, T: TxnRead> {
    txn: &'t T,
    state: CursorState,
}

impl<'t, T: TxnRead> Cursor<'t, T> {
    pub(crate) fn new(txn: &'t T, dbi: Dbi) -> Result<Self> {
        txn.db_state(dbi)?;
        Ok(Cursor {
            txn,
            state: CursorState::new(dbi),
        })
    }

    /// Position per `op` and return the entry there.
    pub fn get(&mut self, op: CursorOp, key: Option<&[u8]>, data: Option<&[u8]>) -> Result<Pair<'t>> {
        op_get(self.txn, &mut self.state, op, key, data)
    }

    /// Number of duplicates at the current position.
    pub fn count(&self) -> Result<u64> {
        op_count(self.txn, &self.state)
    }

    /// Rebind this cursor to another transaction over the same table.
    pub fn renew<'u>(self, txn: &'u T) -> Cursor<'u, T> {
        Cursor {
            txn,
            state: CursorState::new(self.state.dbi),
        }
    }
}

// ---------------------------------------------------------------------
// Write cursor
// ---------------------------------------------------------------------

/// A cursor that can modify its table.
pub struct CursorMut<'t, 'e> {
    txn: &'t mut WriteTxn<'e>,
    state: CursorState,
    /// Internal cursors may touch sub-record entries directly.
    raw: bool,
}

impl<'t, 'e> CursorMut<'t, 'e> {
    pub(crate) fn new(txn: &'t mut WriteTxn<'e>, dbi: Dbi) -> Result<Self> {
        txn.db_state(dbi)?;
        Ok(CursorMut {
            txn,
            state: CursorState::new(dbi),
            raw: false,
        })
    }

    pub(crate) fn new_raw(txn: &'t mut WriteTxn<'e>, dbi: Dbi) -> Result<Self> {
        txn.db_state(dbi)?;
        Ok(CursorMut {
            txn,
            state: CursorState::new(dbi),
            raw: true,
        })
    }

    pub fn get(&mut self, op: CursorOp, key: Option<&[u8]>, data: Option<&[u8]>) -> Result<Pair<'_>> {
        op_get(&*self.txn, &mut self.state, op, key, data)
    }

    pub fn count(&self) -> Result<u64> {
        op_count(&*self.txn, &self.state)
    }

    /// Store `value` under `key` at (or near) this cursor.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::MULTIPLE) {
            return Err(Error::InvalidArg("use put_multiple for bulk stores"));
        }
        let tree = self.txn.tree_of(self.state.dbi)?;
        let dupsort = tree.flags.contains(DbFlags::DUPSORT) && !self.raw;

        if key.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize(key.len()));
        }
        if value.len() > u32::MAX as usize {
            return Err(Error::BadValSize(value.len()));
        }
        if tree.flags.contains(DbFlags::INTEGERKEY) && key.len() != 4 && key.len() != 8 {
            return Err(Error::BadValSize(key.len()));
        }
        if dupsort && value.len() > MAX_KEY_SIZE {
            // Duplicate values become keys of the sub-tree.
            return Err(Error::BadValSize(value.len()));
        }

        // Position the stack.
        let (mut exact, any) = if flags.contains(WriteFlags::CURRENT) {
            if !self.state.init {
                return Err(Error::InvalidArg("cursor is not positioned"));
            }
            (true, true)
        } else if flags.intersects(WriteFlags::APPEND | WriteFlags::APPENDDUP) {
            let nonempty = descend_edge(&*self.txn, &tree, true, &mut self.state.stack)?;
            if nonempty {
                let top = self.state.top()?;
                let node = self.txn.node(top.pgno)?;
                match tree.cmp.compare(key, node.key(top.ix)?) {
                    Ordering::Greater => {
                        self.state.stack.last_mut().unwrap().ix += 1;
                        (false, true)
                    }
                    Ordering::Equal => (true, true),
                    Ordering::Less => return Err(Error::Exists),
                }
            } else {
                (false, false)
            }
        } else {
            descend_key(&*self.txn, &tree, &tree.cmp, key, &mut self.state.stack)?
        };

        let mut ctx = TreeCtx {
            rec: self.txn.db_state(self.state.dbi)?.rec,
            cmp: tree.cmp,
            leaf2: 0,
        };

        if !any {
            // Empty tree: plant the root leaf.
            let root = self.txn.alloc_pages(1)?;
            self.txn.init_node(root, 0, node::P_LEAF, 0)?;
            ctx.rec.root = root;
            ctx.rec.depth = 1;
            ctx.rec.leaf_pages = 1;
            self.state.stack.clear();
            self.state.stack.push(StackEntry { pgno: root, ix: 0 });
            exact = false;
        }

        touch_stack(self.txn, &mut ctx, &mut self.state.stack)?;

        let outcome = if exact {
            self.put_existing(&tree, &mut ctx, key, value, flags)
        } else {
            self.put_fresh(&tree, &mut ctx, key, value)
        };
        outcome?;

        let state = self.txn.state_mut(self.state.dbi)?;
        state.rec = ctx.rec;
        state.dirty = true;

        // Splits relocate entries; recover the exact position by key.
        self.rebuild_position(&ctx.rec, key, if dupsort { Some(value) } else { None })?;
        let keep: Vec<u64> = self.state.stack.iter().map(|e| e.pgno).collect();
        self.txn.spill_check(&keep)?;
        Ok(())
    }

    /// Insert a brand-new key at the positioned slot.
    fn put_fresh(
        &mut self,
        _tree: &TreeRef,
        ctx: &mut TreeCtx,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let ix = self.state.top()?.ix;
        if node::value_needs_overflow(key.len(), value.len()) {
            let (first, last) = self.txn.write_overflow(value)?;
            ctx.rec.overflow_pages += last - first + 1;
            let item = Item::Overflow {
                key,
                value_len: value.len() as u32,
                first,
                last,
            };
            insert_at(self.txn, ctx, &mut self.state.stack, ix, &item)?;
        } else {
            let item = Item::Leaf {
                key,
                value,
                flags: 0,
            };
            insert_at(self.txn, ctx, &mut self.state.stack, ix, &item)?;
        }
        ctx.rec.entries += 1;
        self.state.init = true;
        self.state.eof = false;
        Ok(())
    }

    /// Overwrite or extend the entry the cursor found.
    fn put_existing(
        &mut self,
        tree: &TreeRef,
        ctx: &mut TreeCtx,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        let dupsort = tree.flags.contains(DbFlags::DUPSORT) && !self.raw;
        let top = self.state.top()?;
        let env = self.txn.env_ref().clone();
        let eflags = ref_node(&env, top.pgno)?.entry_flags(top.ix)?;

        if eflags & node::F_SUBDATA != 0 && !self.raw {
            return Err(Error::Incompatible);
        }

        if !dupsort {
            if flags.contains(WriteFlags::NOOVERWRITE) {
                return Err(Error::Exists);
            }
            return self.replace_entry(ctx, top, key, value, eflags & node::F_SUBDATA);
        }

        if eflags & node::F_DUPDATA != 0 {
            return self.put_dup_into_sub(tree, ctx, top, value, flags);
        }

        // Second value for a plain entry: promote to a sub-tree.
        let old = read_value(&*self.txn, ref_node(&env, top.pgno)?, top.ix)?.into_owned();
        match tree.dcmp.compare(&old, value) {
            Ordering::Equal => {
                if flags.intersects(WriteFlags::NODUPDATA | WriteFlags::NOOVERWRITE) {
                    return Err(Error::Exists);
                }
                Ok(())
            }
            _ => self.promote_to_sub(tree, ctx, top, key, &old, value),
        }
    }

    /// Replace a plain entry's value, keeping its key.
    fn replace_entry(
        &mut self,
        ctx: &mut TreeCtx,
        top: StackEntry,
        key: &[u8],
        value: &[u8],
        keep_flags: u8,
    ) -> Result<()> {
        let env = self.txn.env_ref().clone();
        // Retire the previous overflow chain, if any.
        let node = ref_node(&env, top.pgno)?;
        if node.entry_flags(top.ix)? & node::F_OVERFLOW != 0 {
            let (first, last, _) = node.overflow_span(top.ix)?;
            ctx.rec.overflow_pages -= last - first + 1;
            self.txn.free_overflow(first, last)?;
        }

        if node::value_needs_overflow(key.len(), value.len()) {
            let (first, last) = self.txn.write_overflow(value)?;
            ctx.rec.overflow_pages += last - first + 1;
            let item = Item::Overflow {
                key,
                value_len: value.len() as u32,
                first,
                last,
            };
            self.set_or_reinsert(ctx, top, &item)
        } else {
            let item = Item::Leaf {
                key,
                value,
                flags: keep_flags,
            };
            self.set_or_reinsert(ctx, top, &item)
        }
    }

    /// `set_entry`, falling back to delete + insert when the node can't
    /// absorb the growth.
    fn set_or_reinsert(&mut self, ctx: &mut TreeCtx, top: StackEntry, item: &Item<'_>) -> Result<()> {
        let env = self.txn.env_ref().clone();
        let mut node = mut_node(&env, top.pgno)?;
        match node.set_entry(top.ix, item) {
            Ok(()) => Ok(()),
            Err(Error::PageFull) => {
                node.delete_entry(top.ix)?;
                drop(node);
                insert_at(self.txn, ctx, &mut self.state.stack, top.ix, item)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert `value` into an existing duplicate sub-tree.
    fn put_dup_into_sub(
        &mut self,
        tree: &TreeRef,
        ctx: &mut TreeCtx,
        top: StackEntry,
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        let env = self.txn.env_ref().clone();
        let rec = parse_sub_record(&ref_node(&env, top.pgno)?, top.ix)?;
        let sub_tree = tree.sub(&rec);
        let mut sub_ctx = TreeCtx {
            rec,
            cmp: sub_tree.cmp,
            leaf2: rec.pad as u16,
        };
        let mut stack = Vec::new();
        let (exact, _) =
            descend_key(&*self.txn, &sub_tree, &sub_tree.cmp, value, &mut stack)?;
        if exact {
            if flags.contains(WriteFlags::NODUPDATA) {
                return Err(Error::Exists);
            }
            return Ok(());
        }
        if sub_ctx.leaf2 != 0 && value.len() != sub_ctx.leaf2 as usize {
            return Err(Error::BadValSize(value.len()));
        }
        touch_stack(self.txn, &mut sub_ctx, &mut stack)?;
        let ix = stack.last().unwrap().ix;
        let item = Item::Leaf {
            key: value,
            value: &[],
            flags: 0,
        };
        insert_at(self.txn, &mut sub_ctx, &mut stack, ix, &item)?;
        sub_ctx.rec.entries += 1;
        ctx.rec.entries += 1;

        let mut main = mut_node(&env, top.pgno)?;
        main.value_mut(top.ix)?
            .copy_from_slice(bytemuck::bytes_of(&sub_ctx.rec));
        Ok(())
    }

    /// Turn a single-value entry into a duplicate sub-tree of two.
    fn promote_to_sub(
        &mut self,
        tree: &TreeRef,
        ctx: &mut TreeCtx,
        top: StackEntry,
        key: &[u8],
        old: &[u8],
        new: &[u8],
    ) -> Result<()> {
        let fixed = tree.flags.contains(DbFlags::DUPFIXED);
        if fixed && (old.len() != new.len() || old.is_empty()) {
            return Err(Error::BadValSize(new.len()));
        }
        let ksize = if fixed { old.len() as u16 } else { 0 };

        let root = self.txn.alloc_pages(1)?;
        let node_flags = if fixed {
            node::P_LEAF | node::P_LEAF2
        } else {
            node::P_LEAF
        };
        self.txn.init_node(root, 0, node_flags, ksize)?;
        let env = self.txn.env_ref().clone();
        {
            let mut sub = mut_node(&env, root)?;
            let (lo, hi) = match tree.dcmp.compare(old, new) {
                Ordering::Less => (old, new),
                _ => (new, old),
            };
            sub.insert_entry(
                0,
                &Item::Leaf {
                    key: lo,
                    value: &[],
                    flags: 0,
                },
            )?;
            sub.insert_entry(
                1,
                &Item::Leaf {
                    key: hi,
                    value: &[],
                    flags: 0,
                },
            )?;
        }
        let mut rec = DbRecord::empty(if fixed {
            DbFlags::DUPFIXED.persistent()
        } else {
            0
        });
        rec.root = root;
        rec.depth = 1;
        rec.leaf_pages = 1;
        rec.entries = 2;
        rec.pad = ksize as u32;
        ctx.rec.entries += 1;

        let item = Item::Leaf {
            key,
            value: bytemuck::bytes_of(&rec),
            flags: node::F_DUPDATA,
        };
        self.set_or_reinsert(ctx, top, &item)
    }

    /// Store a named table's record under its name (`F_SUBDATA` entry).
    pub(crate) fn put_sub_record(&mut self, name: &[u8], rec_bytes: &[u8]) -> Result<()> {
        let tree = self.txn.tree_of(self.state.dbi)?;
        let (exact, any) =
            descend_key(&*self.txn, &tree, &tree.cmp, name, &mut self.state.stack)?;
        let mut ctx = TreeCtx {
            rec: self.txn.db_state(self.state.dbi)?.rec,
            cmp: tree.cmp,
            leaf2: 0,
        };
        if !any {
            let root = self.txn.alloc_pages(1)?;
            self.txn.init_node(root, 0, node::P_LEAF, 0)?;
            ctx.rec.root = root;
            ctx.rec.depth = 1;
            ctx.rec.leaf_pages = 1;
            self.state.stack.clear();
            self.state.stack.push(StackEntry { pgno: root, ix: 0 });
        }
        touch_stack(self.txn, &mut ctx, &mut self.state.stack)?;
        let top = self.state.top()?;
        let item = Item::Leaf {
            key: name,
            value: rec_bytes,
            flags: node::F_SUBDATA,
        };
        if exact {
            self.set_or_reinsert(&mut ctx, top, &item)?;
        } else {
            insert_at(self.txn, &mut ctx, &mut self.state.stack, top.ix, &item)?;
            ctx.rec.entries += 1;
        }
        let state = self.txn.state_mut(self.state.dbi)?;
        state.rec = ctx.rec;
        state.dirty = true;
        Ok(())
    }

    /// Remove a named table's record entry.
    pub(crate) fn del_sub_record(&mut self, name: &[u8]) -> Result<()> {
        let tree = self.txn.tree_of(self.state.dbi)?;
        let (exact, _) =
            descend_key(&*self.txn, &tree, &tree.cmp, name, &mut self.state.stack)?;
        if !exact {
            return Err(Error::NotFound);
        }
        let mut ctx = TreeCtx {
            rec: self.txn.db_state(self.state.dbi)?.rec,
            cmp: tree.cmp,
            leaf2: 0,
        };
        touch_stack(self.txn, &mut ctx, &mut self.state.stack)?;
        delete_at(self.txn, &mut ctx, &mut self.state.stack)?;
        ctx.rec.entries -= 1;
        let state = self.txn.state_mut(self.state.dbi)?;
        state.rec = ctx.rec;
        state.dirty = true;
        self.state.init = false;
        Ok(())
    }

    /// Delete by key: one duplicate when `value` names it, otherwise the
    /// whole entry including its sub-tree or overflow chain.
    pub fn del_key(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let tree = self.txn.tree_of(self.state.dbi)?;
        let (exact, _) =
            descend_key(&*self.txn, &tree, &tree.cmp, key, &mut self.state.stack)?;
        if !exact {
            return Err(Error::NotFound);
        }
        self.state.init = true;
        self.state.eof = false;
        self.del_positioned(&tree, value)
    }

    /// Delete at the cursor. `all_dups` removes every duplicate of the
    /// current key.
    pub fn del(&mut self, all_dups: bool) -> Result<()> {
        if !self.state.init || self.state.eof {
            return Err(Error::NotFound);
        }
        let tree = self.txn.tree_of(self.state.dbi)?;
        let current_dup = if all_dups {
            None
        } else {
            self.state
                .sub
                .as_ref()
                .map(|sub| -> Result<Vec<u8>> {
                    let st = sub.stack.last().ok_or(Error::NotFound)?;
                    Ok(self.txn.node(st.pgno)?.key(st.ix)?.to_vec())
                })
                .transpose()?
        };
        self.del_positioned(&tree, current_dup.as_deref())
    }

    fn del_positioned(&mut self, tree: &TreeRef, value: Option<&[u8]>) -> Result<()> {
        let dupsort = tree.flags.contains(DbFlags::DUPSORT) && !self.raw;
        let mut ctx = TreeCtx {
            rec: self.txn.db_state(self.state.dbi)?.rec,
            cmp: tree.cmp,
            leaf2: 0,
        };
        touch_stack(self.txn, &mut ctx, &mut self.state.stack)?;
        let top = self.state.top()?;
        let env = self.txn.env_ref().clone();
        let eflags = ref_node(&env, top.pgno)?.entry_flags(top.ix)?;
        if eflags & node::F_SUBDATA != 0 && !self.raw {
            return Err(Error::Incompatible);
        }

        let succ_key = self.successor_key(&env, top)?;
        let main_key = ref_node(&env, top.pgno)?.key(top.ix)?.to_vec();
        // `(key, deleted duplicate)` when the entry survives a dup delete.
        let mut survived: Option<Vec<u8>> = None;

        if eflags & node::F_DUPDATA != 0 {
            let rec = parse_sub_record(&ref_node(&env, top.pgno)?, top.ix)?;
            match value {
                Some(dup) if dupsort => {
                    let sub_tree = tree.sub(&rec);
                    let mut sub_ctx = TreeCtx {
                        rec,
                        cmp: sub_tree.cmp,
                        leaf2: rec.pad as u16,
                    };
                    let mut stack = Vec::new();
                    let (dexact, _) =
                        descend_key(&*self.txn, &sub_tree, &sub_tree.cmp, dup, &mut stack)?;
                    if !dexact {
                        return Err(Error::NotFound);
                    }
                    touch_stack(self.txn, &mut sub_ctx, &mut stack)?;
                    delete_at(self.txn, &mut sub_ctx, &mut stack)?;
                    sub_ctx.rec.entries -= 1;
                    ctx.rec.entries -= 1;
                    if sub_ctx.rec.root == P_INVALID || sub_ctx.rec.entries == 0 {
                        // Last duplicate went away with its tree.
                        self.delete_main_entry(&mut ctx, top)?;
                    } else {
                        let mut main = mut_node(&env, top.pgno)?;
                        main.value_mut(top.ix)?
                            .copy_from_slice(bytemuck::bytes_of(&sub_ctx.rec));
                        survived = Some(dup.to_vec());
                    }
                }
                _ => {
                    // Delete the whole entry and its sub-tree.
                    self.free_sub_tree(&mut ctx, rec.root)?;
                    ctx.rec.entries -= rec.entries;
                    ctx.rec.entries += 1; // delete_main_entry subtracts one
                    self.delete_main_entry(&mut ctx, top)?;
                }
            }
        } else {
            if let (Some(dup), true) = (value, dupsort) {
                let have = read_value(&*self.txn, ref_node(&env, top.pgno)?, top.ix)?;
                if tree.dcmp.compare(&have, dup) != Ordering::Equal {
                    return Err(Error::NotFound);
                }
            }
            if eflags & node::F_OVERFLOW != 0 {
                let (first, last, _) = ref_node(&env, top.pgno)?.overflow_span(top.ix)?;
                ctx.rec.overflow_pages -= last - first + 1;
                self.txn.free_overflow(first, last)?;
            }
            self.delete_main_entry(&mut ctx, top)?;
        }

        let state = self.txn.state_mut(self.state.dbi)?;
        state.rec = ctx.rec;
        state.dirty = true;

        // The entry outlived its deleted duplicate: stay on this key, at
        // the duplicate that followed the deleted one.
        if let Some(deleted_dup) = survived {
            self.state.sub = None;
            let tree_now = TreeRef {
                root: ctx.rec.root,
                ..*tree
            };
            let (exact, _) = descend_key(
                &*self.txn,
                &tree_now,
                &tree.cmp,
                &main_key,
                &mut self.state.stack,
            )?;
            if exact {
                load_sub_at(&*self.txn, &tree_now, &mut self.state, false)?;
                if let Some(sub) = &mut self.state.sub {
                    let sub_tree = tree_now.sub(&sub.rec);
                    descend_key(
                        &*self.txn,
                        &sub_tree,
                        &sub_tree.cmp,
                        &deleted_dup,
                        &mut sub.stack,
                    )?;
                    // The insertion point of the deleted value is its
                    // in-order successor; it may sit one past a leaf.
                    let t = *sub.stack.last().ok_or(Error::NotFound)?;
                    let n = self.txn.node(t.pgno)?.num_entries();
                    let have_dup = if t.ix >= n {
                        sub.stack.last_mut().unwrap().ix = n.saturating_sub(1);
                        next_pos(&*self.txn, &mut sub.stack)?
                    } else {
                        true
                    };
                    if have_dup {
                        self.state.del_pending = true;
                        return Ok(());
                    }
                }
                // No further duplicate: fall through to the next key.
                if next_pos(&*self.txn, &mut self.state.stack)? {
                    load_sub_at(&*self.txn, &tree_now, &mut self.state, false)?;
                    self.state.del_pending = true;
                } else {
                    self.state.eof = true;
                }
                return Ok(());
            }
            self.state.init = false;
            return Ok(());
        }

        // Land on the successor so `Next` keeps working.
        self.state.sub = None;
        match succ_key {
            Some(k) if ctx.rec.root != P_INVALID => {
                let tree_now = TreeRef {
                    root: ctx.rec.root,
                    ..*tree
                };
                let (_, any) =
                    descend_key(&*self.txn, &tree_now, &tree.cmp, &k, &mut self.state.stack)?;
                if any {
                    let top = self.state.top()?;
                    let n = self.txn.node(top.pgno)?.num_entries();
                    if top.ix >= n {
                        self.state.stack.last_mut().unwrap().ix = n - 1;
                        if !next_pos(&*self.txn, &mut self.state.stack)? {
                            self.state.eof = true;
                        }
                    }
                    if !self.state.eof {
                        self.state.del_pending = true;
                    }
                } else {
                    self.state.init = false;
                }
            }
            _ => {
                self.state.init = false;
                self.state.eof = true;
            }
        }
        Ok(())
    }

    /// Key of the entry after `top`, if any, before the tree changes.
    fn successor_key(&self, env: &Env, top: StackEntry) -> Result<Option<Vec<u8>>> {
        let node = ref_node(env, top.pgno)?;
        if top.ix + 1 < node.num_entries() {
            return Ok(Some(node.key(top.ix + 1)?.to_vec()));
        }
        let mut probe = self.state.stack.clone();
        if next_pos(&*self.txn, &mut probe)? {
            let t = probe.last().unwrap();
            let n = self.txn.node(t.pgno)?;
            return Ok(Some(n.key(t.ix)?.to_vec()));
        }
        Ok(None)
    }

    fn delete_main_entry(&mut self, ctx: &mut TreeCtx, _top: StackEntry) -> Result<()> {
        delete_at(self.txn, ctx, &mut self.state.stack)?;
        ctx.rec.entries -= 1;
        Ok(())
    }

    /// Free a whole duplicate sub-tree. Sub-tree pages are accounted in
    /// the sub record, not the owning table's, so only the pages move.
    fn free_sub_tree(&mut self, _ctx: &mut TreeCtx, root: u64) -> Result<()> {
        let mut stack = vec![root];
        while let Some(pgno) = stack.pop() {
            let children = {
                let node = self.txn.node(pgno)?;
                let mut c = Vec::new();
                if node.is_branch() {
                    for i in 0..node.num_entries() {
                        c.push(node.child(i)?);
                    }
                }
                c
            };
            stack.extend(children);
            self.txn.free_page(pgno)?;
        }
        Ok(())
    }

    /// Reserve space for the value of `key`, returning the writable
    /// slice. Consumes the cursor so the borrow can outlive it.
    pub(crate) fn reserve_current(self, key: &[u8]) -> Result<&'t mut [u8]> {
        let tree = self.txn.tree_of(self.state.dbi)?;
        let mut stack = Vec::new();
        let (exact, _) = descend_key(&*self.txn, &tree, &tree.cmp, key, &mut stack)?;
        if !exact {
            return Err(Error::NotFound);
        }
        let top = *stack.last().unwrap();
        let txn: &'t WriteTxn<'e> = self.txn;
        let env: &'t Env = txn.env_ref();
        let node = mut_node(env, top.pgno)?;
        node.into_value_mut(top.ix)
    }

    /// Bulk-insert `data.len() / width` fixed-width duplicates of `key`.
    /// Returns how many were actually stored (existing ones are skipped).
    pub fn put_multiple(&mut self, key: &[u8], data: &[u8], width: usize) -> Result<u64> {
        let tree = self.txn.tree_of(self.state.dbi)?;
        if !tree.flags.contains(DbFlags::DUPFIXED) {
            return Err(Error::Incompatible);
        }
        if width == 0 || data.len() % width != 0 {
            return Err(Error::InvalidArg("data is not a whole number of items"));
        }
        let mut stored = 0u64;
        for chunk in data.chunks_exact(width) {
            match self.put(key, chunk, WriteFlags::NODUPDATA) {
                Ok(()) => stored += 1,
                Err(Error::Exists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stored)
    }

    fn rebuild_position(
        &mut self,
        rec: &DbRecord,
        key: &[u8],
        dup: Option<&[u8]>,
    ) -> Result<()> {
        let mut tree = self.txn.tree_of(self.state.dbi)?;
        tree.root = rec.root;
        let (exact, any) =
            descend_key(&*self.txn, &tree, &tree.cmp, key, &mut self.state.stack)?;
        if !exact || !any {
            self.state.init = false;
            return Ok(());
        }
        self.state.init = true;
        self.state.eof = false;
        load_sub_at(&*self.txn, &tree, &mut self.state, false)?;
        if let (Some(dup), Some(sub)) = (dup, &mut self.state.sub) {
            let sub_tree = tree.sub(&sub.rec);
            descend_key(&*self.txn, &sub_tree, &sub_tree.cmp, dup, &mut sub.stack)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Tree surgery
// ---------------------------------------------------------------------

/// Copy-on-write the whole stack path, patching parent links and the
/// root as pages move.
fn touch_stack(txn: &mut WriteTxn<'_>, ctx: &mut TreeCtx, stack: &mut [StackEntry]) -> Result<()> {
    let env = txn.env_ref().clone();
    for level in 0..stack.len() {
        let old = stack[level].pgno;
        let new = txn.touch_page(old)?;
        if new != old {
            if level == 0 {
                ctx.rec.root = new;
            } else {
                let parent = stack[level - 1];
                let mut pnode = mut_node(&env, parent.pgno)?;
                pnode.set_child(parent.ix, new)?;
            }
            stack[level].pgno = new;
        }
    }
    Ok(())
}

/// Insert `item` at slot `ix` of the leaf (the stack's top), splitting
/// upward as needed.
fn insert_at(
    txn: &mut WriteTxn<'_>,
    ctx: &mut TreeCtx,
    stack: &mut Vec<StackEntry>,
    ix: usize,
    item: &Item<'_>,
) -> Result<()> {
    let level = stack.len() - 1;
    insert_level(txn, ctx, stack, level, ix, item)
}

fn insert_level(
    txn: &mut WriteTxn<'_>,
    ctx: &mut TreeCtx,
    stack: &mut Vec<StackEntry>,
    level: usize,
    ix: usize,
    item: &Item<'_>,
) -> Result<()> {
    let env = txn.env_ref().clone();
    let pgno = stack[level].pgno;
    {
        let mut node = mut_node(&env, pgno)?;
        match node.insert_entry(ix, item) {
            Ok(()) => {
                stack[level].ix = ix;
                return Ok(());
            }
            Err(Error::PageFull) => {}
            Err(e) => return Err(e),
        }
    }

    // Split. Choose the cut by accumulated entry size, or put the new
    // entry alone on the right when this is a pure append.
    let (n, is_leaf, is_leaf2, used, next_leaf, flags) = {
        let node = ref_node(&env, pgno)?;
        (
            node.num_entries(),
            node.is_leaf(),
            node.is_leaf2(),
            node.used_bytes(),
            node.next_leaf(),
            node.flags() & (node::P_BRANCH | node::P_LEAF | node::P_LEAF2),
        )
    };
    let split_ix = if ix == n {
        n
    } else if is_leaf2 {
        (n / 2).max(1)
    } else {
        // Scan from the high end until the moved half crosses half the
        // page, or until the cut matches the insertion side.
        let node = ref_node(&env, pgno)?;
        let mut acc = 0usize;
        let mut s = n;
        while s > 1 {
            acc += node.entry_size(s - 1)?;
            s -= 1;
            if acc >= used / 2 {
                break;
            }
        }
        s.clamp(1, n.saturating_sub(1).max(1))
    };

    let right_pg = txn.alloc_pages(1)?;
    if is_leaf {
        ctx.rec.leaf_pages += 1;
    } else {
        ctx.rec.branch_pages += 1;
    }
    let ksize = if flags & node::P_LEAF2 != 0 { ctx.leaf2 } else { 0 };
    txn.init_node(right_pg, 0, flags, ksize)?;

    if split_ix < n {
        let mut right = mut_node(&env, right_pg)?;
        let mut left = mut_node(&env, pgno)?;
        move_entries(&mut right, 0, &mut left, split_ix, n - split_ix)?;
    }
    if is_leaf {
        let mut right = mut_node(&env, right_pg)?;
        right.set_next_leaf(next_leaf)?;
        drop(right);
        let mut left = mut_node(&env, pgno)?;
        left.set_next_leaf(right_pg)?;
    }

    // Insert the new entry on its side.
    if ix >= split_ix {
        let mut right = mut_node(&env, right_pg)?;
        right.insert_entry(ix - split_ix, item)?;
        stack[level] = StackEntry {
            pgno: right_pg,
            ix: ix - split_ix,
        };
    } else {
        let mut left = mut_node(&env, pgno)?;
        left.insert_entry(ix, item)?;
        stack[level].ix = ix;
    }

    // Promote the separator.
    let sep: Vec<u8> = ref_node(&env, right_pg)?.key(0)?.to_vec();
    if level == 0 {
        let new_root = txn.alloc_pages(1)?;
        txn.init_node(new_root, 0, node::P_BRANCH, 0)?;
        ctx.rec.branch_pages += 1;
        ctx.rec.depth += 1;
        let left_first: Vec<u8> = ref_node(&env, pgno)?.key(0)?.to_vec();
        {
            let mut root = mut_node(&env, new_root)?;
            root.insert_entry(
                0,
                &Item::Internal {
                    key: &left_first,
                    child: pgno,
                },
            )?;
            root.insert_entry(
                1,
                &Item::Internal {
                    key: &sep,
                    child: right_pg,
                },
            )?;
        }
        ctx.rec.root = new_root;
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let on_right = stack[level].pgno == right_pg;
        stack.insert(
            0,
            StackEntry {
                pgno: new_root,
                ix: if on_right { 1 } else { 0 },
            },
        );
        Ok(())
    } else {
        let parent_ix = stack[level - 1].ix;
        let sep_item = Item::Internal {
            key: &sep,
            child: right_pg,
        };
        insert_level(txn, ctx, stack, level - 1, parent_ix + 1, &sep_item)
        // The caller re-descends afterwards, so the stale child levels of
        // the stack don't matter here.
    }
}

/// Delete the entry at the stack's top and rebalance upward.
fn delete_at(txn: &mut WriteTxn<'_>, ctx: &mut TreeCtx, stack: &mut Vec<StackEntry>) -> Result<()> {
    let env = txn.env_ref().clone();
    let top = *stack.last().ok_or(Error::NotFound)?;
    {
        let mut node = mut_node(&env, top.pgno)?;
        node.delete_entry(top.ix)?;
    }
    rebalance(txn, ctx, stack, stack.len() - 1)
}

fn rebalance(
    txn: &mut WriteTxn<'_>,
    ctx: &mut TreeCtx,
    stack: &mut Vec<StackEntry>,
    level: usize,
) -> Result<()> {
    let env = txn.env_ref().clone();
    let pgno = stack[level].pgno;
    let (n, used, is_leaf) = {
        let node = ref_node(&env, pgno)?;
        (node.num_entries(), node.used_bytes(), node.is_leaf())
    };

    if used >= node::FILL_THRESHOLD && n >= node::MINKEYS {
        let node = ref_node(&env, pgno)?;
        if stack[level].ix >= node.num_entries() && node.num_entries() > 0 {
            stack[level].ix = node.num_entries() - 1;
        }
        return Ok(());
    }

    if level == 0 {
        // Root underflow: collapse.
        if !is_leaf && n == 1 {
            let child = ref_node(&env, pgno)?.child(0)?;
            ctx.rec.root = child;
            ctx.rec.depth -= 1;
            ctx.rec.branch_pages = ctx.rec.branch_pages.saturating_sub(1);
            txn.free_page(pgno)?;
            stack.remove(0);
            return Ok(());
        }
        if is_leaf && n == 0 {
            ctx.rec.root = P_INVALID;
            ctx.rec.depth = 0;
            ctx.rec.leaf_pages = ctx.rec.leaf_pages.saturating_sub(1);
            txn.free_page(pgno)?;
            stack.clear();
        }
        return Ok(());
    }

    let parent = stack[level - 1];
    let pn = ref_node(&env, parent.pgno)?.num_entries();
    if pn < 2 {
        return rebalance(txn, ctx, stack, level - 1);
    }

    // Prefer the left sibling.
    let (sib_slot, node_is_right) = if parent.ix > 0 {
        (parent.ix - 1, true)
    } else {
        (parent.ix + 1, false)
    };
    let sib_old = ref_node(&env, parent.pgno)?.child(sib_slot)?;
    let sib_pg = txn.touch_page(sib_old)?;
    if sib_pg != sib_old {
        let mut pnode = mut_node(&env, parent.pgno)?;
        pnode.set_child(sib_slot, sib_pg)?;
    }
    let (sn, s_used) = {
        let s = ref_node(&env, sib_pg)?;
        (s.num_entries(), s.used_bytes())
    };

    // Borrow when the sibling can spare an entry, and always when the
    // two nodes together would not fit in one page.
    let (spare, can_merge) = {
        let s = ref_node(&env, sib_pg)?;
        let edge = if node_is_right { sn - 1 } else { 0 };
        let moved = s.entry_size(edge)?;
        (
            sn > node::MINKEYS && s_used - moved >= node::FILL_THRESHOLD,
            used + s_used <= s.region_size(),
        )
    };

    if spare || !can_merge {
        if node_is_right {
            // Pull the left sibling's last entry to our front.
            {
                let mut me = mut_node(&env, pgno)?;
                let mut sib = mut_node(&env, sib_pg)?;
                move_entries(&mut me, 0, &mut sib, sn - 1, 1)?;
            }
            stack[level].ix += 1;
            let new_first: Vec<u8> = ref_node(&env, pgno)?.key(0)?.to_vec();
            update_parent_key(txn, ctx, stack, level - 1, parent.ix, &new_first)?;
        } else {
            // Pull the right sibling's first entry to our end.
            {
                let mut me = mut_node(&env, pgno)?;
                let mut sib = mut_node(&env, sib_pg)?;
                let me_n = me.as_ref().num_entries();
                move_entries(&mut me, me_n, &mut sib, 0, 1)?;
            }
            let new_first: Vec<u8> = ref_node(&env, sib_pg)?.key(0)?.to_vec();
            update_parent_key(txn, ctx, stack, level - 1, sib_slot, &new_first)?;
        }
        return Ok(());
    }

    // Merge: the right node drains into the left one.
    let (left_pg, right_pg, right_slot) = if node_is_right {
        (sib_pg, pgno, parent.ix)
    } else {
        (pgno, sib_pg, sib_slot)
    };
    let left_n = ref_node(&env, left_pg)?.num_entries();
    {
        let right_next = ref_node(&env, right_pg)?.next_leaf();
        let right_n = ref_node(&env, right_pg)?.num_entries();
        let mut left = mut_node(&env, left_pg)?;
        let mut right = mut_node(&env, right_pg)?;
        move_entries(&mut left, left_n, &mut right, 0, right_n)?;
        if left.as_ref().is_leaf() {
            left.set_next_leaf(right_next)?;
        }
    }
    if is_leaf {
        ctx.rec.leaf_pages = ctx.rec.leaf_pages.saturating_sub(1);
    } else {
        ctx.rec.branch_pages = ctx.rec.branch_pages.saturating_sub(1);
    }
    txn.free_page(right_pg)?;

    // The cursor follows its entry into the left page.
    if node_is_right {
        stack[level] = StackEntry {
            pgno: left_pg,
            ix: stack[level].ix + left_n,
        };
        stack[level - 1].ix = sib_slot;
    } else {
        stack[level].pgno = left_pg;
    }

    {
        let mut pnode = mut_node(&env, parent.pgno)?;
        pnode.delete_entry(right_slot)?;
    }
    rebalance(txn, ctx, stack, level - 1)
}

/// Rewrite the separator key of `slot` in the parent node at `level`,
/// splitting the parent when the new key doesn't fit.
fn update_parent_key(
    txn: &mut WriteTxn<'_>,
    ctx: &mut TreeCtx,
    stack: &mut Vec<StackEntry>,
    level: usize,
    slot: usize,
    new_key: &[u8],
) -> Result<()> {
    let env = txn.env_ref().clone();
    let pgno = stack[level].pgno;
    let child = ref_node(&env, pgno)?.child(slot)?;
    let item = Item::Internal {
        key: new_key,
        child,
    };
    let mut pnode = mut_node(&env, pgno)?;
    match pnode.set_entry(slot, &item) {
        Ok(()) => Ok(()),
        Err(Error::PageFull) => {
            pnode.delete_entry(slot)?;
            drop(pnode);
            insert_level(txn, ctx, stack, level, slot, &item)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use crate::{EnvFlags, PAGE_SIZE};

    fn env(pages: usize) -> Env {
        Env::options()
            .map_size(pages * PAGE_SIZE)
            .flags(EnvFlags::empty())
            .open_anon()
            .unwrap()
    }

    fn filled(env: &Env, n: u32) -> Dbi {
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        // Insert in a scrambled order so the tree really gets exercised.
        let mut keys: Vec<u32> = (0..n).collect();
        let mut state = 0x9e37u32;
        for i in (1..keys.len()).rev() {
            state = state.wrapping_mul(48271).wrapping_add(11);
            keys.swap(i, (state as usize) % (i + 1));
        }
        for k in keys {
            let key = format!("key-{k:06}");
            let val = format!("val-{k:06}-{}", "x".repeat(40));
            txn.put(dbi, key.as_bytes(), val.as_bytes(), crate::WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
        dbi
    }

    #[test]
    fn enumeration_is_sorted_and_complete() {
        let env = env(512);
        let dbi = filled(&env, 500);
        let rtxn = env.begin_read().unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();

        let mut seen = Vec::new();
        let mut op = CursorOp::First;
        loop {
            match cursor.get(op, None, None) {
                Ok((k, v)) => {
                    assert!(v.starts_with(b"val-"));
                    seen.push(k.into_owned());
                }
                Err(Error::NotFound) => break,
                Err(e) => panic!("{e}"),
            }
            op = CursorOp::Next;
        }
        assert_eq!(seen.len(), 500);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(seen, sorted);
        assert_eq!(seen[0], b"key-000000");
        assert_eq!(seen[499], b"key-000499");
    }

    #[test]
    fn reverse_enumeration_matches() {
        let env = env(512);
        let dbi = filled(&env, 300);
        let rtxn = env.begin_read().unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();
        let mut count = 0;
        let mut op = CursorOp::Last;
        let mut prev: Option<Vec<u8>> = None;
        loop {
            match cursor.get(op, None, None) {
                Ok((k, _)) => {
                    if let Some(p) = &prev {
                        assert!(k.as_ref() < p.as_slice());
                    }
                    prev = Some(k.into_owned());
                    count += 1;
                }
                Err(Error::NotFound) => break,
                Err(e) => panic!("{e}"),
            }
            op = CursorOp::Prev;
        }
        assert_eq!(count, 300);
    }

    #[test]
    fn set_range_finds_successors() {
        let env = env(256);
        let dbi = filled(&env, 100);
        let rtxn = env.begin_read().unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();

        let (k, _) = cursor
            .get(CursorOp::SetRange, Some(b"key-000050"), None)
            .unwrap();
        assert_eq!(&*k, b"key-000050");

        // Between two keys: land on the next one.
        let (k, _) = cursor
            .get(CursorOp::SetRange, Some(b"key-0000509"), None)
            .unwrap();
        assert_eq!(&*k, b"key-000051");

        assert!(matches!(
            cursor.get(CursorOp::SetRange, Some(b"key-999999"), None),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            cursor.get(CursorOp::Set, Some(b"key-0000509"), None),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn deletes_shrink_the_tree_consistently() {
        let env = env(512);
        let dbi = filled(&env, 400);
        let mut txn = env.begin_write().unwrap();
        let dbi2 = txn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(dbi2, dbi);
        for k in 0..400u32 {
            if k % 4 != 0 {
                let key = format!("key-{k:06}");
                txn.del(dbi, key.as_bytes(), None).unwrap();
            }
        }
        txn.commit().unwrap();

        let rtxn = env.begin_read().unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();
        let mut remaining = Vec::new();
        let mut op = CursorOp::First;
        while let Ok((k, _)) = cursor.get(op, None, None) {
            remaining.push(k.into_owned());
            op = CursorOp::Next;
        }
        let expected: Vec<Vec<u8>> = (0..400u32)
            .filter(|k| k % 4 == 0)
            .map(|k| format!("key-{k:06}").into_bytes())
            .collect();
        assert_eq!(remaining, expected);
        assert_eq!(rtxn.db_stat(dbi).unwrap().entries, 100);
    }

    #[test]
    fn delete_to_empty_collapses_the_root() {
        let env = env(256);
        let dbi = filled(&env, 150);
        let mut txn = env.begin_write().unwrap();
        for k in 0..150u32 {
            let key = format!("key-{k:06}");
            txn.del(dbi, key.as_bytes(), None).unwrap();
        }
        txn.commit().unwrap();

        let rtxn = env.begin_read().unwrap();
        let stat = rtxn.db_stat(dbi).unwrap();
        assert_eq!(stat.entries, 0);
        assert_eq!(stat.depth, 0);
        let mut cursor = rtxn.cursor(dbi).unwrap();
        assert!(matches!(
            cursor.get(CursorOp::First, None, None),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn duplicate_values_sort_and_count() {
        let env = env(256);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn
            .open_db(Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT)
            .unwrap();
        for v in [b"cherry".as_slice(), b"apple", b"banana"] {
            txn.put(dbi, b"fruit", v, crate::WriteFlags::empty()).unwrap();
        }
        txn.put(dbi, b"veg", b"carrot", crate::WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(Some("dups"), DbFlags::empty()).unwrap();
        // get() returns the first duplicate in order.
        assert_eq!(&*rtxn.get(dbi, b"fruit").unwrap(), b"apple");

        let mut cursor = rtxn.cursor(dbi).unwrap();
        let (k, v) = cursor.get(CursorOp::Set, Some(b"fruit"), None).unwrap();
        assert_eq!((&*k, &*v), (b"fruit".as_slice(), b"apple".as_slice()));
        assert_eq!(cursor.count().unwrap(), 3);

        let (_, v) = cursor.get(CursorOp::NextDup, None, None).unwrap();
        assert_eq!(&*v, b"banana");
        let (_, v) = cursor.get(CursorOp::LastDup, None, None).unwrap();
        assert_eq!(&*v, b"cherry");
        assert!(matches!(
            cursor.get(CursorOp::NextDup, None, None),
            Err(Error::NotFound)
        ));

        // Next crosses from the last dup to the following key.
        let (k, v) = cursor.get(CursorOp::Next, None, None).unwrap();
        assert_eq!((&*k, &*v), (b"veg".as_slice(), b"carrot".as_slice()));

        let (_, v) = cursor
            .get(CursorOp::GetBoth, Some(b"fruit"), Some(b"banana"))
            .unwrap();
        assert_eq!(&*v, b"banana");
        assert!(matches!(
            cursor.get(CursorOp::GetBoth, Some(b"fruit"), Some(b"durian")),
            Err(Error::NotFound)
        ));
        let (_, v) = cursor
            .get(CursorOp::GetBothRange, Some(b"fruit"), Some(b"b"))
            .unwrap();
        assert_eq!(&*v, b"banana");
    }

    #[test]
    fn duplicate_delete_one_and_all() {
        let env = env(256);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn
            .open_db(Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT)
            .unwrap();
        for v in [b"a".as_slice(), b"b", b"c"] {
            txn.put(dbi, b"k", v, crate::WriteFlags::empty()).unwrap();
        }
        // Deleting one named duplicate keeps the others.
        txn.del(dbi, b"k", Some(b"b")).unwrap();
        assert_eq!(txn.db_stat(dbi).unwrap().entries, 2);
        {
            let mut cursor = txn.cursor_mut(dbi).unwrap();
            let (_, v) = cursor.get(CursorOp::Set, Some(b"k"), None).unwrap();
            assert_eq!(&*v, b"a");
            assert_eq!(cursor.count().unwrap(), 2);
        }
        // Deleting without a value drops the key entirely.
        txn.del(dbi, b"k", None).unwrap();
        assert!(matches!(txn.get(dbi, b"k"), Err(Error::NotFound)));
        assert_eq!(txn.db_stat(dbi).unwrap().entries, 0);
        txn.commit().unwrap();
    }

    #[test]
    fn nodupdata_rejects_existing_pair() {
        let env = env(256);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn
            .open_db(Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT)
            .unwrap();
        txn.put(dbi, b"k", b"v", crate::WriteFlags::empty()).unwrap();
        txn.put(dbi, b"k", b"w", crate::WriteFlags::empty()).unwrap();
        assert!(matches!(
            txn.put(dbi, b"k", b"v", crate::WriteFlags::NODUPDATA),
            Err(Error::Exists)
        ));
        txn.put(dbi, b"k", b"v", crate::WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn dupfixed_runs_via_get_multiple() {
        let env = env(256);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn
            .open_db(
                Some("fixed"),
                DbFlags::CREATE | DbFlags::DUPSORT | DbFlags::DUPFIXED,
            )
            .unwrap();
        {
            let mut cursor = txn.cursor_mut(dbi).unwrap();
            let data: Vec<u8> = (0..32u8).flat_map(|i| [i, 0, 0, 0]).collect();
            assert_eq!(cursor.put_multiple(b"runs", &data, 4).unwrap(), 32);
        }
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(Some("fixed"), DbFlags::empty()).unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();
        cursor.get(CursorOp::Set, Some(b"runs"), None).unwrap();
        assert_eq!(cursor.count().unwrap(), 32);
        let (_, run) = cursor.get(CursorOp::GetMultiple, None, None).unwrap();
        assert_eq!(run.len() % 4, 0);
        assert!(run.len() >= 4);
        assert_eq!(&run[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn append_mode_inserts_in_order() {
        let env = env(256);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        for k in 0..200u32 {
            let key = format!("k{k:05}");
            txn.put(dbi, key.as_bytes(), b"v", crate::WriteFlags::APPEND)
                .unwrap();
        }
        // Out-of-order appends are refused.
        assert!(matches!(
            txn.put(dbi, b"k00000a", b"v", crate::WriteFlags::APPEND),
            Err(Error::Exists)
        ));
        txn.commit().unwrap();

        let rtxn = env.begin_read().unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();
        let (k, _) = cursor.get(CursorOp::Last, None, None).unwrap();
        assert_eq!(&*k, b"k00199");
    }

    #[test]
    fn cursor_del_lands_on_successor() {
        let env = env(256);
        let dbi = filled(&env, 50);
        let mut txn = env.begin_write().unwrap();
        let _ = txn.open_db(None, DbFlags::empty()).unwrap();
        {
            let mut cursor = txn.cursor_mut(dbi).unwrap();
            cursor.get(CursorOp::Set, Some(b"key-000010"), None).unwrap();
            cursor.del(false).unwrap();
            let (k, _) = cursor.get(CursorOp::Next, None, None).unwrap();
            assert_eq!(&*k, b"key-000011");
        }
        txn.commit().unwrap();
    }
}
