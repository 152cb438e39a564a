use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info};
use uuid::Uuid;

use crate::btree;
use crate::error;
use crate::key::Key128;
use crate::node::{ChildSlotSeed, NodeBlock, NodeHandle};
use crate::reader::DataReader;
use crate::utils::unix_nanos_u64;

/// Suppresses the automatic flush at the end of each `Put`; an explicit
/// `commit` (or `close`) is then required to make index updates durable.
pub const LS_ASYNC_COMMIT: u64 = 1 << 0;

const MAGIC: [u8; 4] = *b"BST1";
const VERSION: u8 = 1;
pub(crate) const SUPERBLOCK_SIZE: usize = 4096;

const STORE_ID_OFFSET: usize = 5;
const CREATED_AT_OFFSET: usize = STORE_ID_OFFSET + 16;
const ROOT_NODE_OFFSET: usize = CREATED_AT_OFFSET + 8;
const COUNT_OFFSET: usize = ROOT_NODE_OFFSET + 8;
const FLAG_OFFSET: usize = COUNT_OFFSET + 8;
const _: () = assert!(FLAG_OFFSET + 8 <= SUPERBLOCK_SIZE);

/// Mutable state behind the store's coarse lock: the node arena, the
/// dirty-set, the cached root, and the bookkeeping needed to reproduce a
/// pre-flush snapshot.
pub(crate) struct StoreState {
    pub store_id: Uuid,
    pub created_at: u64,
    pub root_offset: i64,
    pub root: Option<NodeHandle>,
    pub count: u64,
    pub flags: u64,
    pub arena: Vec<NodeBlock>,
    pub dirty: BTreeSet<NodeHandle>,
    /// The last superblock image written to disk.
    pub snapshot: Box<[u8; SUPERBLOCK_SIZE]>,
    /// Scratch buffer accumulating the pre-flush image: the superblock
    /// snapshot followed by every already-persisted dirty node's pending
    /// snapshot, in that order.
    pub master_snapshot: Vec<u8>,
}

impl StoreState {
    pub(crate) fn touch(&mut self, handle: NodeHandle) {
        self.arena[handle].dirty = true;
        self.dirty.insert(handle);
    }

    fn superblock_image(&self) -> Box<[u8; SUPERBLOCK_SIZE]> {
        let mut bytes = Box::new([0u8; SUPERBLOCK_SIZE]);
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4] = VERSION;
        bytes[STORE_ID_OFFSET..STORE_ID_OFFSET + 16].copy_from_slice(self.store_id.as_bytes());
        bytes[CREATED_AT_OFFSET..CREATED_AT_OFFSET + 8]
            .copy_from_slice(&self.created_at.to_be_bytes());
        bytes[ROOT_NODE_OFFSET..ROOT_NODE_OFFSET + 8].copy_from_slice(&self.root_offset.to_be_bytes());
        bytes[COUNT_OFFSET..COUNT_OFFSET + 8].copy_from_slice(&self.count.to_be_bytes());
        bytes[FLAG_OFFSET..FLAG_OFFSET + 8].copy_from_slice(&self.flags.to_be_bytes());
        bytes
    }

    fn load_superblock(bytes: &[u8; SUPERBLOCK_SIZE]) -> io::Result<Self> {
        if bytes[0..4] != MAGIC {
            return Err(error::corrupt("superblock magic"));
        }
        if bytes[4] != VERSION {
            return Err(error::corrupt("superblock version"));
        }
        let store_id = Uuid::from_slice(&bytes[STORE_ID_OFFSET..STORE_ID_OFFSET + 16])
            .map_err(|_| error::corrupt("superblock store id"))?;
        let created_at = u64::from_be_bytes(
            bytes[CREATED_AT_OFFSET..CREATED_AT_OFFSET + 8].try_into().unwrap(),
        );
        let root_offset = i64::from_be_bytes(
            bytes[ROOT_NODE_OFFSET..ROOT_NODE_OFFSET + 8].try_into().unwrap(),
        );
        let count = u64::from_be_bytes(bytes[COUNT_OFFSET..COUNT_OFFSET + 8].try_into().unwrap());
        let flags = u64::from_be_bytes(bytes[FLAG_OFFSET..FLAG_OFFSET + 8].try_into().unwrap());

        Ok(Self {
            store_id,
            created_at,
            root_offset,
            root: None,
            count,
            flags,
            arena: Vec::new(),
            dirty: BTreeSet::new(),
            snapshot: Box::new(*bytes),
            master_snapshot: Vec::new(),
        })
    }

    /// Ensures the root is loaded (or freshly allocated for an empty
    /// store), returning its handle.
    fn ensure_root(&mut self, file: &mut File) -> io::Result<Option<NodeHandle>> {
        if self.root.is_none() && self.root_offset != 0 {
            let handle = btree::load_node_block(self, file, self.root_offset)?;
            self.root = Some(handle);
        }
        Ok(self.root)
    }
}

/// A process-level handle to one append-only ordered key-value store file.
///
/// Put/Commit/flush acquire the coarse lock exclusively; Get/Walk acquire
/// it for shared access. The underlying mutable state (node arena, dirty
/// set, cached root) lives behind its own mutex regardless of which side
/// of the coarse lock a caller took, because lazily loading a child while
/// merely reading the tree still mutates the in-memory cache.
pub struct Store {
    path: PathBuf,
    lock: RwLock<()>,
    file: Mutex<File>,
    state: Mutex<StoreState>,
    /// Test-only fault injection seam: when armed, the `n`th call to
    /// `sync_node` across all future flushes fails instead of writing,
    /// so a flush can be interrupted partway through its dirty-set drain
    /// the way a real crash would. Disabled (`usize::MAX`) by default.
    #[cfg(test)]
    fail_after_sync: AtomicUsize,
}

impl Store {
    /// Creates a new, empty store file at `path`, failing if one already
    /// exists.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let state = StoreState {
            store_id: Uuid::new_v4(),
            created_at: unix_nanos_u64(),
            root_offset: 0,
            root: None,
            count: 0,
            flags: 0,
            arena: Vec::new(),
            dirty: BTreeSet::new(),
            snapshot: Box::new([0u8; SUPERBLOCK_SIZE]),
            master_snapshot: Vec::new(),
        };

        file.seek(SeekFrom::Start(0))?;
        file.write_all(state.superblock_image().as_ref())?;
        file.flush()?;
        info!("created store {:?} with id {}", path, state.store_id);

        Ok(Self {
            path,
            lock: RwLock::new(()),
            file: Mutex::new(file),
            state: Mutex::new(state),
            #[cfg(test)]
            fail_after_sync: AtomicUsize::new(usize::MAX),
        })
    }

    /// Opens an existing store file at `path`, or creates it if
    /// `create_if_missing` is set and the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if create_if_missing && !path.exists() {
            return Self::create(path);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let state = StoreState::load_superblock(&buf)?;
        debug!("opened store {:?} with {} keys", path, state.count);

        Ok(Self {
            path,
            lock: RwLock::new(()),
            file: Mutex::new(file),
            state: Mutex::new(state),
            #[cfg(test)]
            fail_after_sync: AtomicUsize::new(usize::MAX),
        })
    }

    /// Inserts `key` with the bytes read from `reader` as its value.
    ///
    /// Fails with a `KeyExisted`-kind error if `key` is already present.
    /// The payload is appended to the file's tail regardless of whether
    /// the index update ultimately succeeds.
    pub fn put<R: Read>(&self, key: Key128, mut reader: R) -> io::Result<()> {
        let _guard = self.lock.write().unwrap();
        let mut file = self.file.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        if state.root.is_none() && state.root_offset == 0 {
            let pair = btree::write_pair(&mut file, key, &mut reader)?;
            let root = btree::new_node(&mut state);
            state.arena[root].insert_item_at(0, pair);
            state.touch(root);
            state.root = Some(root);
            state.count += 1;
            debug!("allocated first root, node {root}");
            return self.sync_dirties(&mut file, &mut state);
        }

        let root = state.ensure_root(&mut file)?.expect("root must exist by now");

        if state.arena[root].is_full() {
            let (promoted, right) = btree::split_node(&mut state, root);
            let new_root = btree::new_node(&mut state);
            state.arena[new_root] = NodeBlock::new_internal(
                ChildSlotSeed::Loaded(root),
                promoted,
                ChildSlotSeed::Loaded(right),
            );
            state.touch(new_root);
            state.root = Some(new_root);
            debug!("root overflowed, allocated new root node {new_root}");
        }

        let root = state.root.unwrap();
        btree::insert(&mut state, &mut file, root, key, &mut reader)?;
        state.count += 1;
        self.sync_dirties(&mut file, &mut state)
    }

    /// Looks up `key`, returning a streaming reader over its value on
    /// success.
    pub fn get(&self, key: Key128) -> io::Result<DataReader> {
        let _guard = self.lock.read().unwrap();
        let mut file = self.file.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let root = state
            .ensure_root(&mut file)?
            .ok_or_else(|| error::key_not_found(key))?;
        let pair = btree::get(&mut state, &mut file, root, key)?;
        DataReader::open(&self.path, pair)
    }

    /// Visits every key in ascending order, opening a fresh [`DataReader`]
    /// for each. Aborts on the first error `callback` returns.
    pub fn walk(&self, mut callback: impl FnMut(Key128, DataReader) -> io::Result<()>) -> io::Result<()> {
        let _guard = self.lock.read().unwrap();
        let mut file = self.file.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let root = match state.ensure_root(&mut file)? {
            Some(r) => r,
            None => return Ok(()),
        };
        btree::iterate(&mut state, &mut file, &self.path, root, &mut callback)
    }

    pub fn count(&self) -> u64 {
        self.state.lock().unwrap().count
    }

    pub fn store_id(&self) -> Uuid {
        self.state.lock().unwrap().store_id
    }

    pub fn created_at(&self) -> u64 {
        self.state.lock().unwrap().created_at
    }

    pub fn flags(&self) -> u64 {
        self.state.lock().unwrap().flags
    }

    /// Last-committed root node's on-disk offset, or 0 for an empty store.
    pub fn root_offset(&self) -> i64 {
        self.state.lock().unwrap().root_offset
    }

    /// Sets bits in the flag bitfield (currently only [`LS_ASYNC_COMMIT`]
    /// is recognized).
    pub fn set_flag(&self, mask: u64) {
        let _guard = self.lock.write().unwrap();
        self.state.lock().unwrap().flags |= mask;
    }

    /// Forces a flush regardless of the async-commit flag.
    ///
    /// Calling this when `LS_ASYNC_COMMIT` is not set is a programmer
    /// error in the same sense as the rest of this API's assertions.
    pub fn commit(&self) -> io::Result<()> {
        let _guard = self.lock.write().unwrap();
        let mut file = self.file.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        assert!(
            state.flags & LS_ASYNC_COMMIT != 0,
            "Commit() called while LS_ASYNC_COMMIT is not set"
        );
        self.force_sync_dirties(&mut file, &mut state)
    }

    /// Flushes any pending dirty nodes and the superblock, then closes the
    /// store.
    pub fn close(self) -> io::Result<()> {
        let _guard = self.lock.write().unwrap();
        let mut file = self.file.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        self.force_sync_dirties(&mut file, &mut state)
    }

    /// Public flush entry point: a no-op under async commit, otherwise an
    /// immediate flush.
    fn sync_dirties(&self, file: &mut File, state: &mut StoreState) -> io::Result<()> {
        if state.flags & LS_ASYNC_COMMIT != 0 {
            return Ok(());
        }
        self.force_sync_dirties(file, state)
    }

    /// Drains the dirty-set in child-before-parent order, then rewrites
    /// the superblock. See [`crate`] module docs for the ordering
    /// argument.
    fn force_sync_dirties(&self, file: &mut File, state: &mut StoreState) -> io::Result<()> {
        debug!("flushing {} dirty node(s)", state.dirty.len());
        state.master_snapshot.clear();
        state.master_snapshot.extend_from_slice(state.snapshot.as_ref());
        for &handle in &state.dirty {
            if state.arena[handle].offset != 0 {
                if let Some(image) = &state.arena[handle].pending_snapshot {
                    state.master_snapshot.extend_from_slice(image.as_ref());
                }
            }
        }

        while !state.dirty.is_empty() {
            let pending: Vec<NodeHandle> = state.dirty.iter().copied().collect();
            let ready: Vec<NodeHandle> = pending
                .into_iter()
                .filter(|&h| btree::are_children_synced(state, h))
                .collect();

            if ready.is_empty() {
                // Every remaining node is still waiting on an unsynced
                // child; `are_children_synced` guarantees this cannot
                // happen for a well-formed dirty-set, since it is a DAG
                // whose leaves are always ready on some iteration.
                unreachable!("dirty-set made no progress");
            }

            for handle in ready {
                #[cfg(test)]
                self.maybe_fail_sync()?;
                btree::sync_node(state, file, handle)?;
                state.dirty.remove(&handle);
            }
        }

        state.root_offset = state.root.map(|r| state.arena[r].offset).unwrap_or(0);
        file.seek(SeekFrom::Start(0))?;
        let image = state.superblock_image();
        file.write_all(image.as_ref())?;
        file.flush()?;
        state.snapshot = image;
        debug!("flush complete, root at offset {}", state.root_offset);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_fail_after_sync(&self, n: usize) {
        self.fail_after_sync.store(n, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn maybe_fail_sync(&self) -> io::Result<()> {
        if self.fail_after_sync.fetch_sub(1, Ordering::SeqCst) == 1 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "injected sync failure",
            ));
        }
        Ok(())
    }
}
