use crate::key::Key128;
use crate::pair::Pair;

pub const MAX_ITEMS: usize = 63;
pub const MAX_CHILDREN: usize = MAX_ITEMS + 1;

pub const NODE_BLOCK_SIZE: usize = 4096;

const ITEMS_SIZE_OFFSET: usize = 0;
const ITEMS_OFFSET: usize = 2;
const ITEMS_BYTES: usize = MAX_ITEMS * Pair::SIZE;
const CHILDREN_SIZE_OFFSET: usize = ITEMS_OFFSET + ITEMS_BYTES;
const CHILDREN_OFFSET: usize = CHILDREN_SIZE_OFFSET + 2;
const CHILDREN_BYTES: usize = MAX_CHILDREN * 8;

const _: () = assert!(CHILDREN_OFFSET + CHILDREN_BYTES <= NODE_BLOCK_SIZE);

/// Index into the store's arena. Not persisted; valid only for the
/// lifetime of the `Store` that allocated it.
pub(crate) type NodeHandle = usize;

/// One child slot: the persistent offset (0 if the child has never been
/// written) paired with an optional in-memory handle for a loaded/newly
/// allocated child. This is the `Unloaded(offset) | Loaded(handle, offset)`
/// variant from the design notes, expressed without an enum so that the
/// offset stays trivially serializable.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChildSlot {
    pub offset: i64,
    pub handle: Option<NodeHandle>,
}

impl ChildSlot {
    fn unloaded(offset: i64) -> Self {
        Self {
            offset,
            handle: None,
        }
    }

    fn loaded(handle: NodeHandle) -> Self {
        Self {
            offset: 0,
            handle: Some(handle),
        }
    }
}

/// A B-tree node, either a leaf (`children.is_empty()`) or internal
/// (`children.len() == items.len() + 1`).
#[derive(Debug, Default)]
pub(crate) struct NodeBlock {
    /// Absolute byte position of this node on disk; 0 if never persisted.
    pub offset: i64,
    pub items: Vec<Pair>,
    pub children: Vec<ChildSlot>,
    pub dirty: bool,
    /// The last byte image successfully written for this node, used to
    /// reconstruct the pre-flush state at the start of a commit.
    pub pending_snapshot: Option<Box<[u8; NODE_BLOCK_SIZE]>>,
}

impl NodeBlock {
    pub fn new_leaf() -> Self {
        Self {
            dirty: true,
            ..Self::default()
        }
    }

    pub fn new_internal(left: ChildSlotSeed, item: Pair, right: ChildSlotSeed) -> Self {
        let mut node = Self {
            dirty: true,
            ..Self::default()
        };
        node.items.push(item);
        node.children.push(left.into_slot());
        node.children.push(right.into_slot());
        node
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= MAX_ITEMS
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Binary search for the smallest index `i` where `key < items[i].key`.
    /// Returns `(i - 1, true)` if `items[i - 1].key == key`, else `(i,
    /// false)`.
    pub fn find(&self, key: Key128) -> (usize, bool) {
        let i = self.items.partition_point(|p| p.key < key);
        if i > 0 && self.items[i - 1].key == key {
            (i - 1, true)
        } else {
            (i, false)
        }
    }

    pub fn insert_item_at(&mut self, index: usize, item: Pair) {
        assert!(self.items.len() < MAX_ITEMS, "insert into full node");
        self.items.insert(index, item);
        self.mark_dirty();
    }

    pub fn append_items(&mut self, items: &[Pair]) {
        assert!(self.items.len() + items.len() <= MAX_ITEMS);
        self.items.extend_from_slice(items);
        self.mark_dirty();
    }

    pub fn insert_child_at(&mut self, index: usize, slot: ChildSlotSeed) {
        assert!(self.children.len() < MAX_CHILDREN, "insert into full node");
        self.children.insert(index, slot.into_slot());
        self.mark_dirty();
    }

    pub(crate) fn load(offset: i64, bytes: &[u8; NODE_BLOCK_SIZE]) -> Self {
        let items_size =
            u16::from_be_bytes(bytes[ITEMS_SIZE_OFFSET..ITEMS_SIZE_OFFSET + 2].try_into().unwrap())
                as usize;
        let mut items = Vec::with_capacity(items_size);
        for i in 0..items_size {
            let start = ITEMS_OFFSET + i * Pair::SIZE;
            items.push(Pair::load(&bytes[start..start + Pair::SIZE]));
        }

        let children_size = u16::from_be_bytes(
            bytes[CHILDREN_SIZE_OFFSET..CHILDREN_SIZE_OFFSET + 2]
                .try_into()
                .unwrap(),
        ) as usize;
        let mut children = Vec::with_capacity(children_size);
        for i in 0..children_size {
            let start = CHILDREN_OFFSET + i * 8;
            let child_offset = i64::from_be_bytes(bytes[start..start + 8].try_into().unwrap());
            children.push(ChildSlot::unloaded(child_offset));
        }

        Self {
            offset,
            items,
            children,
            dirty: false,
            pending_snapshot: Some(Box::new(*bytes)),
        }
    }

    pub(crate) fn dump(&self) -> Box<[u8; NODE_BLOCK_SIZE]> {
        let mut bytes = Box::new([0u8; NODE_BLOCK_SIZE]);

        bytes[ITEMS_SIZE_OFFSET..ITEMS_SIZE_OFFSET + 2]
            .copy_from_slice(&(self.items.len() as u16).to_be_bytes());
        for (i, item) in self.items.iter().enumerate() {
            let start = ITEMS_OFFSET + i * Pair::SIZE;
            item.dump(&mut bytes[start..start + Pair::SIZE]);
        }

        bytes[CHILDREN_SIZE_OFFSET..CHILDREN_SIZE_OFFSET + 2]
            .copy_from_slice(&(self.children.len() as u16).to_be_bytes());
        for (i, child) in self.children.iter().enumerate() {
            let start = CHILDREN_OFFSET + i * 8;
            bytes[start..start + 8].copy_from_slice(&child.offset.to_be_bytes());
        }

        bytes
    }
}

/// A child reference not yet placed into a parent's slot array: either an
/// already-loaded node (by handle) or a bare on-disk offset.
pub(crate) enum ChildSlotSeed {
    Loaded(NodeHandle),
    Offset(i64),
}

impl ChildSlotSeed {
    fn into_slot(self) -> ChildSlot {
        match self {
            ChildSlotSeed::Loaded(h) => ChildSlot::loaded(h),
            ChildSlotSeed::Offset(o) => ChildSlot::unloaded(o),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(hi: u64, lo: u64) -> Pair {
        Pair {
            key: Key128::new(hi, lo),
            tstamp: 0,
            value: 0,
            size: 0,
            hash: 0,
        }
    }

    #[test]
    fn find_locates_existing_and_insertion_point() {
        let mut node = NodeBlock::new_leaf();
        node.append_items(&[pair(0, 1), pair(0, 3), pair(0, 5)]);

        assert_eq!(node.find(Key128::new(0, 3)), (1, true));
        assert_eq!(node.find(Key128::new(0, 2)), (1, false));
        assert_eq!(node.find(Key128::new(0, 0)), (0, false));
        assert_eq!(node.find(Key128::new(0, 9)), (3, false));
    }

    #[test]
    fn node_image_round_trips() {
        let mut node = NodeBlock::new_leaf();
        node.append_items(&[pair(0, 1), pair(1, 2)]);
        let bytes = node.dump();
        let loaded = NodeBlock::load(123, &bytes);
        assert_eq!(loaded.offset, 123);
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.items[0].key, Key128::new(0, 1));
        assert!(!loaded.dirty);
    }

    #[test]
    fn leaf_vs_internal() {
        let leaf = NodeBlock::new_leaf();
        assert!(leaf.is_leaf());

        let internal = NodeBlock::new_internal(
            ChildSlotSeed::Offset(4096),
            pair(0, 10),
            ChildSlotSeed::Offset(8192),
        );
        assert!(!internal.is_leaf());
        assert_eq!(internal.children.len(), internal.items.len() + 1);
    }
}
