//! Recursive B-tree algorithms over a store's node arena.
//!
//! Nodes never hold an owning back-reference to the store; the algorithms
//! here take the store's mutable state plus a [`NodeHandle`] and thread it
//! through recursive calls instead, avoiding a reference cycle.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace};

use crate::error;
use crate::key::Key128;
use crate::node::{ChildSlotSeed, NodeBlock, NodeHandle, NODE_BLOCK_SIZE};
use crate::pair::{fnv1a_init, fnv1a_update, Pair};
use crate::reader::DataReader;
use crate::store::StoreState;

pub(crate) fn new_node(state: &mut StoreState) -> NodeHandle {
    state.arena.push(NodeBlock::default());
    let handle = state.arena.len() - 1;
    state.touch(handle);
    handle
}

pub(crate) fn load_node_block(
    state: &mut StoreState,
    file: &mut File,
    offset: i64,
) -> io::Result<NodeHandle> {
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut buf = [0u8; NODE_BLOCK_SIZE];
    file.read_exact(&mut buf)?;
    state.arena.push(NodeBlock::load(offset, &buf));
    Ok(state.arena.len() - 1)
}

/// Resolves child slot `i` of `handle` to an arena handle, lazily loading
/// it from disk if it has an offset but no cached handle yet. Returns
/// `None` only for a genuinely empty slot (offset `0`, never loaded).
pub(crate) fn child(
    state: &mut StoreState,
    file: &mut File,
    handle: NodeHandle,
    i: usize,
) -> io::Result<Option<NodeHandle>> {
    let slot = state.arena[handle].children[i];
    if let Some(h) = slot.handle {
        return Ok(Some(h));
    }
    if slot.offset == 0 {
        return Ok(None);
    }
    trace!("lazily loading child {i} of node {handle} at offset {}", slot.offset);
    let loaded = load_node_block(state, file, slot.offset)?;
    state.arena[handle].children[i].handle = Some(loaded);
    Ok(Some(loaded))
}

/// Splits the full node at `handle` at the fixed midpoint, returning the
/// promoted median pair and the handle of the new right sibling.
pub(crate) fn split_node(state: &mut StoreState, handle: NodeHandle) -> (Pair, NodeHandle) {
    let mid = crate::node::MAX_ITEMS / 2;
    let right = new_node(state);

    let (promoted, right_items, right_children) = {
        let node = &mut state.arena[handle];
        let right_items = node.items.split_off(mid + 1);
        let promoted = node.items.pop().expect("full node has a median item");
        let right_children = if !node.children.is_empty() {
            Some(node.children.split_off(mid + 1))
        } else {
            None
        };
        (promoted, right_items, right_children)
    };

    state.arena[right].items = right_items;
    if let Some(children) = right_children {
        state.arena[right].children = children;
    }

    state.touch(handle);
    state.touch(right);
    debug!(
        "split node {handle} at median key {:?}, new sibling {right}",
        promoted.key
    );
    (promoted, right)
}

/// If child `i` of `handle` exists and is full, splits it and promotes its
/// median into `handle`. Returns whether a split occurred.
pub(crate) fn maybe_split_child(
    state: &mut StoreState,
    file: &mut File,
    handle: NodeHandle,
    i: usize,
) -> io::Result<bool> {
    let child_handle = match child(state, file, handle, i)? {
        Some(h) => h,
        None => return Ok(false),
    };
    if !state.arena[child_handle].is_full() {
        return Ok(false);
    }

    let (promoted, right) = split_node(state, child_handle);
    state.arena[handle].insert_item_at(i, promoted);
    state.arena[handle].insert_child_at(i + 1, ChildSlotSeed::Loaded(right));
    state.touch(handle);
    Ok(true)
}

pub(crate) fn insert(
    state: &mut StoreState,
    file: &mut File,
    handle: NodeHandle,
    key: Key128,
    reader: &mut dyn Read,
) -> io::Result<()> {
    let (mut i, found) = state.arena[handle].find(key);
    if found {
        return Err(error::key_existed(key));
    }

    if state.arena[handle].is_leaf() {
        let pair = write_pair(file, key, reader)?;
        state.arena[handle].insert_item_at(i, pair);
        state.touch(handle);
        return Ok(());
    }

    if maybe_split_child(state, file, handle, i)? {
        let promoted = state.arena[handle].items[i].key;
        if key < promoted {
            // descend into the left (original) split half, index unchanged
        } else if promoted < key {
            i += 1;
        } else {
            return Err(error::key_existed(key));
        }
    }

    let next = child(state, file, handle, i)?.expect("descent index must name a real child");
    insert(state, file, next, key, reader)
}

pub(crate) fn get(
    state: &mut StoreState,
    file: &mut File,
    handle: NodeHandle,
    key: Key128,
) -> io::Result<Pair> {
    let (i, found) = state.arena[handle].find(key);
    if found {
        return Ok(state.arena[handle].items[i]);
    }
    if !state.arena[handle].is_leaf() {
        if let Some(next) = child(state, file, handle, i)? {
            return get(state, file, next, key);
        }
    }
    Err(error::key_not_found(key))
}

/// `true` once every in-use child slot of `handle` carries a non-zero
/// offset, cross-referencing a loaded child's freshly assigned offset into
/// its parent's slot along the way.
pub(crate) fn are_children_synced(state: &mut StoreState, handle: NodeHandle) -> bool {
    for i in 0..state.arena[handle].children.len() {
        let slot = state.arena[handle].children[i];
        if slot.offset != 0 {
            continue;
        }
        if let Some(child_handle) = slot.handle {
            let child_offset = state.arena[child_handle].offset;
            if child_offset != 0 {
                state.arena[handle].children[i].offset = child_offset;
                continue;
            }
        }
        return false;
    }
    true
}

/// Serializes `handle` to its permanent (or first-assigned) disk address.
pub(crate) fn sync_node(state: &mut StoreState, file: &mut File, handle: NodeHandle) -> io::Result<()> {
    let mut offset = state.arena[handle].offset;
    if offset == 0 {
        offset = file.seek(SeekFrom::End(0))? as i64;
        state.arena[handle].offset = offset;
    }
    file.seek(SeekFrom::Start(offset as u64))?;
    let image = state.arena[handle].dump();
    file.write_all(image.as_ref())?;
    trace!("synced node {handle} at offset {offset}");
    state.arena[handle].pending_snapshot = Some(image);
    state.arena[handle].dirty = false;
    Ok(())
}

pub(crate) fn iterate(
    state: &mut StoreState,
    file: &mut File,
    path: &Path,
    handle: NodeHandle,
    callback: &mut dyn FnMut(Key128, DataReader) -> io::Result<()>,
) -> io::Result<()> {
    let is_leaf = state.arena[handle].is_leaf();
    let item_count = state.arena[handle].items.len();

    for i in 0..item_count {
        if !is_leaf {
            if let Some(next) = child(state, file, handle, i)? {
                iterate(state, file, path, next, callback)?;
            }
        }
        let pair = state.arena[handle].items[i];
        let reader = DataReader::open(path, pair)?;
        callback(pair.key, reader)?;
    }

    if !is_leaf {
        let last = state.arena[handle].children.len() - 1;
        if let Some(next) = child(state, file, handle, last)? {
            iterate(state, file, path, next, callback)?;
        }
    }
    Ok(())
}

pub(crate) fn write_pair(file: &mut File, key: Key128, reader: &mut dyn Read) -> io::Result<Pair> {
    const CHUNK: usize = 32 * 1024;

    let start = file.seek(SeekFrom::End(0))?;
    let mut buf = [0u8; CHUNK];
    let mut written: i64 = 0;
    let mut hash = fnv1a_init();

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        let wrote = file.write(&buf[..read])?;
        fnv1a_update(&mut hash, &buf[..wrote]);
        written += wrote as i64;
        if wrote != read {
            return Err(error::short_write(read, wrote));
        }
    }

    Ok(Pair {
        key,
        tstamp: crate::utils::unix_secs_u32(),
        value: start as i64,
        size: written,
        hash,
    })
}
