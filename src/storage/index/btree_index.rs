use std::sync::Arc;

use log::debug;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::buffer::{BufferManager, PageId, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BTreeConfig;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::codec::BPlusTreePageCodec;
use crate::storage::page::btree_page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, IndexKey, KeyComparator,
};
use crate::storage::page::RecordId;

/// A write-latched page on a pessimistic descent path, decoded once and
/// re-encoded only when touched.
#[derive(Debug)]
struct LatchedPage {
    guard: WritePageGuard,
    page: BPlusTreePage,
    modified: bool,
}

/// State of one pessimistic mutation: the root-id guard (released as soon as
/// a safe node bounds the structural change), the write-latched path, pages
/// finished by splits, and pages to free once every latch is gone.
struct WriteContext<'a> {
    root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    path: Vec<LatchedPage>,
    finished: Vec<LatchedPage>,
    deleted: Vec<PageId>,
}

impl<'a> WriteContext<'a> {
    fn new(root_guard: RwLockWriteGuard<'a, PageId>) -> Self {
        Self {
            root_guard: Some(root_guard),
            path: Vec::new(),
            finished: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// The node about to be pushed is safe: everything latched above it can
    /// no longer be touched by this mutation.
    fn release_ancestors(&mut self) {
        self.path.clear();
        self.finished.clear();
        self.root_guard = None;
    }

    fn holds_root(&self) -> bool {
        self.root_guard.is_some()
    }
}

enum OptimisticOutcome {
    Done,
    Fallback,
}

/// Concurrent B+-tree over buffer-pool pages.
///
/// Point reads crab shared latches from the root; mutations first try a
/// leaf-only write latch and fall back to a full write-latched descent that
/// releases ancestors as soon as a safe node is reached. The root page id is
/// itself guarded by a rw-lock that structural changes hold in write mode.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub buffer_pool: Arc<BufferManager>,
    comparator: KeyComparator,
    key_size: usize,
    leaf_max_size: u32,
    internal_max_size: u32,
    root_page_id: RwLock<PageId>,
}

impl BPlusTreeIndex {
    pub fn new(
        buffer_pool: Arc<BufferManager>,
        comparator: KeyComparator,
        config: BTreeConfig,
    ) -> Self {
        assert!(
            config.leaf_max_size >= 4 && config.leaf_max_size % 2 == 0,
            "leaf_max_size must be even and at least 4"
        );
        assert!(
            config.internal_max_size >= 4 && config.internal_max_size % 2 == 0,
            "internal_max_size must be even and at least 4"
        );
        Self {
            buffer_pool,
            comparator,
            key_size: config.key_size,
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn comparator(&self) -> KeyComparator {
        self.comparator
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    fn check_key(&self, key: &[u8]) -> VellumDBResult<()> {
        if key.len() != self.key_size {
            return Err(VellumDBError::Internal(format!(
                "index key must be {} bytes, got {}",
                self.key_size,
                key.len()
            )));
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> VellumDBResult<BPlusTreePage> {
        BPlusTreePageCodec::decode(bytes, self.key_size)
    }

    fn encode_into(&self, guard: &mut WritePageGuard, page: &BPlusTreePage) {
        guard.overwrite(&BPlusTreePageCodec::encode(page, self.key_size));
    }

    /// Point lookup with shared-latch crabbing.
    pub fn get(&self, key: &[u8]) -> VellumDBResult<Option<RecordId>> {
        self.check_key(key)?;
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_id)?;
        drop(root_guard);
        loop {
            match self.decode(guard.data())? {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key, self.comparator);
                    // child latch before parent release
                    let child = self.buffer_pool.fetch_page_read(child_id)?;
                    guard = child;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(leaf.look_up(key, self.comparator)),
            }
        }
    }

    pub fn insert(&self, key: &[u8], rid: RecordId) -> VellumDBResult<()> {
        self.check_key(key)?;
        if self.is_empty() {
            let mut root_guard = self.root_page_id.write();
            if *root_guard == INVALID_PAGE_ID {
                return self.start_new_tree(&mut root_guard, key, rid);
            }
            // lost the race; fall through to the regular path
        }
        match self.insert_optimistic(key, rid)? {
            OptimisticOutcome::Done => Ok(()),
            OptimisticOutcome::Fallback => self.insert_pessimistic(key, rid),
        }
    }

    pub fn remove(&self, key: &[u8]) -> VellumDBResult<()> {
        self.check_key(key)?;
        if self.is_empty() {
            return Err(VellumDBError::KeyMissing(format!("{:?}", key)));
        }
        match self.remove_optimistic(key)? {
            OptimisticOutcome::Done => Ok(()),
            OptimisticOutcome::Fallback => self.remove_pessimistic(key),
        }
    }

    fn start_new_tree(
        &self,
        root_guard: &mut RwLockWriteGuard<'_, PageId>,
        key: &[u8],
        rid: RecordId,
    ) -> VellumDBResult<()> {
        let mut page_guard = self.buffer_pool.new_page()?;
        let page_id = page_guard.page_id();
        let mut leaf = BPlusTreeLeafPage::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key.to_vec(), rid, self.comparator);
        self.encode_into(&mut page_guard, &BPlusTreePage::Leaf(leaf));
        **root_guard = page_id;
        debug!("started new tree with root page {}", page_id);
        Ok(())
    }

    /// Read-crab to the leaf, then swap its shared latch for an exclusive one
    /// while the parent's shared latch pins the tree shape around it. Only
    /// leaf-local mutations happen here.
    fn insert_optimistic(&self, key: &[u8], rid: RecordId) -> VellumDBResult<OptimisticOutcome> {
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(OptimisticOutcome::Fallback);
        }
        let first = self.buffer_pool.fetch_page_read(root_id)?;

        match self.decode(first.data())? {
            BPlusTreePage::Leaf(_) => {
                // root is the leaf: the root-id guard stands in for a parent
                drop(first);
                let mut write_guard = self.buffer_pool.fetch_page_write(root_id)?;
                drop(root_guard);
                let BPlusTreePage::Leaf(mut leaf) = self.decode(write_guard.data())? else {
                    return Ok(OptimisticOutcome::Fallback);
                };
                if leaf.header.current_size + 1 >= leaf.header.max_size {
                    return Ok(OptimisticOutcome::Fallback);
                }
                if !leaf.insert(key.to_vec(), rid, self.comparator) {
                    return Err(VellumDBError::KeyExists(format!("{:?}", key)));
                }
                self.encode_into(&mut write_guard, &BPlusTreePage::Leaf(leaf));
                Ok(OptimisticOutcome::Done)
            }
            BPlusTreePage::Internal(internal) => {
                drop(root_guard);
                let mut parent = first;
                let mut child_id = internal.look_up(key, self.comparator);
                loop {
                    let child = self.buffer_pool.fetch_page_read(child_id)?;
                    match self.decode(child.data())? {
                        BPlusTreePage::Internal(next) => {
                            child_id = next.look_up(key, self.comparator);
                            parent = child;
                        }
                        BPlusTreePage::Leaf(_) => {
                            // parent's shared latch keeps this leaf in place
                            drop(child);
                            let mut write_guard = self.buffer_pool.fetch_page_write(child_id)?;
                            let BPlusTreePage::Leaf(mut leaf) = self.decode(write_guard.data())?
                            else {
                                return Ok(OptimisticOutcome::Fallback);
                            };
                            if leaf.header.current_size + 1 >= leaf.header.max_size {
                                return Ok(OptimisticOutcome::Fallback);
                            }
                            if !leaf.insert(key.to_vec(), rid, self.comparator) {
                                return Err(VellumDBError::KeyExists(format!("{:?}", key)));
                            }
                            self.encode_into(&mut write_guard, &BPlusTreePage::Leaf(leaf));
                            drop(write_guard);
                            drop(parent);
                            return Ok(OptimisticOutcome::Done);
                        }
                    }
                }
            }
        }
    }

    fn remove_optimistic(&self, key: &[u8]) -> VellumDBResult<OptimisticOutcome> {
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Err(VellumDBError::KeyMissing(format!("{:?}", key)));
        }
        let first = self.buffer_pool.fetch_page_read(root_id)?;

        match self.decode(first.data())? {
            BPlusTreePage::Leaf(_) => {
                drop(first);
                let mut write_guard = self.buffer_pool.fetch_page_write(root_id)?;
                let BPlusTreePage::Leaf(mut leaf) = self.decode(write_guard.data())? else {
                    return Ok(OptimisticOutcome::Fallback);
                };
                // a root leaf never restructures except when it empties out
                if leaf.header.current_size > 1 {
                    drop(root_guard);
                    if !leaf.remove(key, self.comparator) {
                        return Err(VellumDBError::KeyMissing(format!("{:?}", key)));
                    }
                    self.encode_into(&mut write_guard, &BPlusTreePage::Leaf(leaf));
                    return Ok(OptimisticOutcome::Done);
                }
                Ok(OptimisticOutcome::Fallback)
            }
            BPlusTreePage::Internal(internal) => {
                drop(root_guard);
                let mut parent = first;
                let mut child_id = internal.look_up(key, self.comparator);
                loop {
                    let child = self.buffer_pool.fetch_page_read(child_id)?;
                    match self.decode(child.data())? {
                        BPlusTreePage::Internal(next) => {
                            child_id = next.look_up(key, self.comparator);
                            parent = child;
                        }
                        BPlusTreePage::Leaf(_) => {
                            drop(child);
                            let mut write_guard = self.buffer_pool.fetch_page_write(child_id)?;
                            let BPlusTreePage::Leaf(mut leaf) = self.decode(write_guard.data())?
                            else {
                                return Ok(OptimisticOutcome::Fallback);
                            };
                            if leaf.header.current_size <= leaf.min_size() {
                                return Ok(OptimisticOutcome::Fallback);
                            }
                            if !leaf.remove(key, self.comparator) {
                                return Err(VellumDBError::KeyMissing(format!("{:?}", key)));
                            }
                            self.encode_into(&mut write_guard, &BPlusTreePage::Leaf(leaf));
                            drop(write_guard);
                            drop(parent);
                            return Ok(OptimisticOutcome::Done);
                        }
                    }
                }
            }
        }
    }

    /// Descend with exclusive latches, releasing all held ancestors whenever
    /// the just-latched node cannot propagate the mutation upward.
    fn descend_for_write(
        &self,
        ctx: &mut WriteContext<'_>,
        key: &[u8],
        for_insert: bool,
        root_id: PageId,
    ) -> VellumDBResult<()> {
        let mut current_id = root_id;
        loop {
            let guard = self.buffer_pool.fetch_page_write(current_id)?;
            let page = self.decode(guard.data())?;
            let is_root = ctx.path.is_empty() && ctx.holds_root();
            let safe = if for_insert {
                page.is_insert_safe()
            } else {
                page.is_delete_safe(is_root)
            };
            if safe {
                ctx.release_ancestors();
            }
            let next = match &page {
                BPlusTreePage::Internal(internal) => Some(internal.look_up(key, self.comparator)),
                BPlusTreePage::Leaf(_) => None,
            };
            ctx.path.push(LatchedPage {
                guard,
                page,
                modified: false,
            });
            match next {
                Some(child_id) => current_id = child_id,
                None => return Ok(()),
            }
        }
    }

    /// Encode every touched page back into its latched frame, release all
    /// latches, then physically free merged-away pages.
    fn finish(&self, mut ctx: WriteContext<'_>) -> VellumDBResult<()> {
        for latched in ctx.path.iter_mut().chain(ctx.finished.iter_mut()) {
            if latched.modified {
                let encoded = BPlusTreePageCodec::encode(&latched.page, self.key_size);
                latched.guard.overwrite(&encoded);
            }
        }
        ctx.path.clear();
        ctx.finished.clear();
        ctx.root_guard = None;
        for page_id in ctx.deleted.drain(..) {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    fn insert_pessimistic(&self, key: &[u8], rid: RecordId) -> VellumDBResult<()> {
        let mut root_guard = self.root_page_id.write();
        if *root_guard == INVALID_PAGE_ID {
            return self.start_new_tree(&mut root_guard, key, rid);
        }
        let root_id = *root_guard;
        let mut ctx = WriteContext::new(root_guard);
        self.descend_for_write(&mut ctx, key, true, root_id)?;

        {
            let latched = ctx
                .path
                .last_mut()
                .ok_or_else(|| VellumDBError::Internal("empty descent path".to_string()))?;
            let BPlusTreePage::Leaf(ref mut leaf) = latched.page else {
                return Err(VellumDBError::Internal(
                    "descent did not end at a leaf".to_string(),
                ));
            };
            if !leaf.insert(key.to_vec(), rid, self.comparator) {
                return Err(VellumDBError::KeyExists(format!("{:?}", key)));
            }
            latched.modified = true;
        }

        if ctx
            .path
            .last()
            .map(|latched| latched.page.is_full())
            .unwrap_or(false)
        {
            self.split_upward(&mut ctx)?;
        }
        self.finish(ctx)
    }

    /// Split the overflowing node at the top of the path, insert the promoted
    /// separator into its parent, and repeat while parents overflow. A root
    /// split installs a fresh root and republishes the root id.
    fn split_upward(&self, ctx: &mut WriteContext<'_>) -> VellumDBResult<()> {
        loop {
            let level = ctx.path.len() - 1;
            let splitting_root = level == 0;

            let (new_root_guard, parent_id) = if splitting_root {
                if !ctx.holds_root() {
                    return Err(VellumDBError::Internal(
                        "root split without the root guard".to_string(),
                    ));
                }
                let guard = self.buffer_pool.new_page()?;
                let id = guard.page_id();
                (Some(guard), id)
            } else {
                (None, ctx.path[level - 1].page.page_id())
            };

            let (separator, sibling_id) = self.split_node(ctx, parent_id)?;

            let mut halved = match ctx.path.pop() {
                Some(latched) => latched,
                None => {
                    return Err(VellumDBError::Internal(
                        "split target vanished from path".to_string(),
                    ))
                }
            };

            if splitting_root {
                let mut root_page_guard = match new_root_guard {
                    Some(guard) => guard,
                    None => {
                        return Err(VellumDBError::Internal(
                            "missing pre-allocated root page".to_string(),
                        ))
                    }
                };
                let new_root_id = root_page_guard.page_id();
                let old_root_id = halved.page.page_id();
                let mut new_root =
                    BPlusTreeInternalPage::new(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
                new_root.insert_first(old_root_id);
                new_root.insert(separator, sibling_id, self.comparator);

                halved.page.set_parent_page_id(new_root_id);
                halved.modified = true;
                ctx.finished.push(halved);
                ctx.finished.push(LatchedPage {
                    guard: root_page_guard,
                    page: BPlusTreePage::Internal(new_root),
                    modified: true,
                });

                match ctx.root_guard.as_mut() {
                    Some(root_guard) => **root_guard = new_root_id,
                    None => {
                        return Err(VellumDBError::Internal(
                            "root guard released before root split".to_string(),
                        ))
                    }
                }
                debug!("root split: new root page {}", new_root_id);
                return Ok(());
            }

            ctx.finished.push(halved);
            let parent = ctx
                .path
                .last_mut()
                .ok_or_else(|| VellumDBError::Internal("split lost its parent".to_string()))?;
            let BPlusTreePage::Internal(ref mut internal) = parent.page else {
                return Err(VellumDBError::Internal(
                    "leaf found on the interior path".to_string(),
                ));
            };
            internal.insert(separator, sibling_id, self.comparator);
            parent.modified = true;
            if !parent.page.is_full() {
                return Ok(());
            }
        }
    }

    /// Split the node at the top of `ctx.path` at its midpoint, moving the
    /// upper half into a freshly allocated sibling whose parent is
    /// `parent_id`. Returns the separator to promote and the sibling's id.
    fn split_node(
        &self,
        ctx: &mut WriteContext<'_>,
        parent_id: PageId,
    ) -> VellumDBResult<(IndexKey, PageId)> {
        let sibling_guard = self.buffer_pool.new_page()?;
        let sibling_id = sibling_guard.page_id();

        let latched = ctx
            .path
            .last_mut()
            .ok_or_else(|| VellumDBError::Internal("nothing to split".to_string()))?;
        latched.modified = true;

        match &mut latched.page {
            BPlusTreePage::Leaf(leaf) => {
                let mid = leaf.header.current_size as usize / 2;
                let upper = leaf.split_off(mid);
                let mut sibling = BPlusTreeLeafPage::new(sibling_id, parent_id, self.leaf_max_size);
                sibling.batch_append(upper);
                sibling.header.next_page_id = leaf.header.next_page_id;
                leaf.header.next_page_id = sibling_id;
                let separator = sibling.first_key().clone();
                ctx.finished.push(LatchedPage {
                    guard: sibling_guard,
                    page: BPlusTreePage::Leaf(sibling),
                    modified: true,
                });
                Ok((separator, sibling_id))
            }
            BPlusTreePage::Internal(internal) => {
                let mid = internal.header.current_size as usize / 2;
                let mut upper = internal.split_off(mid);
                let (separator, first_child) = upper.remove(0);
                let mut sibling =
                    BPlusTreeInternalPage::new(sibling_id, parent_id, self.internal_max_size);
                sibling.insert_first(first_child);
                sibling.batch_append(upper);
                let moved_children: Vec<PageId> =
                    sibling.array.iter().map(|(_, child)| *child).collect();
                ctx.finished.push(LatchedPage {
                    guard: sibling_guard,
                    page: BPlusTreePage::Internal(sibling),
                    modified: true,
                });
                // the moved subtrees now hang under the sibling
                for child_id in moved_children {
                    self.set_parent_of(ctx, child_id, sibling_id)?;
                }
                Ok((separator, sibling_id))
            }
        }
    }

    /// Update a child's parent pointer whether or not the child is currently
    /// latched on this mutation's path.
    fn set_parent_of(
        &self,
        ctx: &mut WriteContext<'_>,
        page_id: PageId,
        parent_id: PageId,
    ) -> VellumDBResult<()> {
        for latched in ctx.path.iter_mut().chain(ctx.finished.iter_mut()) {
            if latched.page.page_id() == page_id {
                latched.page.set_parent_page_id(parent_id);
                latched.modified = true;
                return Ok(());
            }
        }
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        let mut page = self.decode(guard.data())?;
        page.set_parent_page_id(parent_id);
        self.encode_into(&mut guard, &page);
        Ok(())
    }

    fn remove_pessimistic(&self, key: &[u8]) -> VellumDBResult<()> {
        let root_guard = self.root_page_id.write();
        if *root_guard == INVALID_PAGE_ID {
            return Err(VellumDBError::KeyMissing(format!("{:?}", key)));
        }
        let root_id = *root_guard;
        let mut ctx = WriteContext::new(root_guard);
        self.descend_for_write(&mut ctx, key, false, root_id)?;

        {
            let latched = ctx
                .path
                .last_mut()
                .ok_or_else(|| VellumDBError::Internal("empty descent path".to_string()))?;
            let BPlusTreePage::Leaf(ref mut leaf) = latched.page else {
                return Err(VellumDBError::Internal(
                    "descent did not end at a leaf".to_string(),
                ));
            };
            if !leaf.remove(key, self.comparator) {
                return Err(VellumDBError::KeyMissing(format!("{:?}", key)));
            }
            latched.modified = true;
        }

        // the tree shrinks to empty when the root leaf drains
        if ctx.path.len() == 1 && ctx.holds_root() {
            let latched = &ctx.path[0];
            if let BPlusTreePage::Leaf(ref leaf) = latched.page {
                if leaf.header.current_size == 0 {
                    let old_root = leaf.header.page_id;
                    match ctx.root_guard.as_mut() {
                        Some(root_guard) => **root_guard = INVALID_PAGE_ID,
                        None => {
                            return Err(VellumDBError::Internal(
                                "root guard released while draining root".to_string(),
                            ))
                        }
                    }
                    ctx.deleted.push(old_root);
                    let mut emptied = ctx.path.pop();
                    if let Some(ref mut latched) = emptied {
                        latched.modified = false;
                    }
                    drop(emptied);
                    return self.finish(ctx);
                }
            }
        }

        self.resolve_underflow(&mut ctx)?;
        self.finish(ctx)
    }

    /// Walk from the mutated leaf toward the root, fixing every underflowing
    /// node by borrow (left, then right) or merge (into left, then right).
    fn resolve_underflow(&self, ctx: &mut WriteContext<'_>) -> VellumDBResult<()> {
        let mut level = ctx.path.len() - 1;
        loop {
            let is_root = level == 0 && ctx.holds_root();
            if !ctx.path[level].page.is_underflow(is_root) {
                return Ok(());
            }

            if is_root {
                // internal root down to a single child: the child becomes root
                let child_id = match &ctx.path[level].page {
                    BPlusTreePage::Internal(internal) => internal.value_at(0),
                    BPlusTreePage::Leaf(_) => return Ok(()),
                };
                let old_root_id = ctx.path[level].page.page_id();
                self.set_parent_of(ctx, child_id, INVALID_PAGE_ID)?;
                match ctx.root_guard.as_mut() {
                    Some(root_guard) => **root_guard = child_id,
                    None => {
                        return Err(VellumDBError::Internal(
                            "root guard released during root collapse".to_string(),
                        ))
                    }
                }
                ctx.deleted.push(old_root_id);
                ctx.path[level].modified = false;
                debug!("root collapsed into child page {}", child_id);
                return Ok(());
            }

            if level == 0 {
                // the highest retained node was delete-safe; nothing above it
                // can underflow
                return Ok(());
            }

            let node_id = ctx.path[level].page.page_id();
            let (left_id, right_id) = {
                let BPlusTreePage::Internal(ref parent) = ctx.path[level - 1].page else {
                    return Err(VellumDBError::Internal(
                        "leaf found on the interior path".to_string(),
                    ));
                };
                parent.sibling_page_ids(node_id)
            };

            if let Some(left_id) = left_id {
                if self.borrow_from_left(ctx, level, left_id)? {
                    return Ok(());
                }
            }
            if let Some(right_id) = right_id {
                if self.borrow_from_right(ctx, level, right_id)? {
                    return Ok(());
                }
            }

            if let Some(left_id) = left_id {
                self.merge_into_left(ctx, level, left_id)?;
            } else if let Some(right_id) = right_id {
                self.merge_right_into_node(ctx, level, right_id)?;
            } else {
                return Err(VellumDBError::Internal(
                    "underflowing node has no siblings".to_string(),
                ));
            }

            level -= 1;
        }
    }

    fn parent_separator_index(
        parent: &BPlusTreeInternalPage,
        child: PageId,
    ) -> VellumDBResult<usize> {
        parent
            .child_index_of(child)
            .ok_or_else(|| VellumDBError::Internal("child missing from its parent".to_string()))
    }

    /// Move the largest entry of the left sibling into the front of the node.
    fn borrow_from_left(
        &self,
        ctx: &mut WriteContext<'_>,
        level: usize,
        left_id: PageId,
    ) -> VellumDBResult<bool> {
        let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
        let mut left_page = self.decode(left_guard.data())?;
        if !left_page.can_borrow() {
            return Ok(false);
        }

        let node_id = ctx.path[level].page.page_id();
        let (node_index, old_separator) = {
            let BPlusTreePage::Internal(ref parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            let index = Self::parent_separator_index(parent, node_id)?;
            (index, parent.key_at(index).clone())
        };

        let mut moved_child: Option<PageId> = None;
        let new_separator = match (&mut left_page, &mut ctx.path[level].page) {
            (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(node)) => {
                let last = left.header.current_size as usize - 1;
                let (k, v) = left.split_off(last).remove(0);
                node.array.insert(0, (k.clone(), v));
                node.header.current_size += 1;
                k
            }
            (BPlusTreePage::Internal(left), BPlusTreePage::Internal(node)) => {
                let last = left.header.current_size as usize - 1;
                let (k, child) = left.split_off(last).remove(0);
                // the old slot-0 sentinel takes the parent separator's key
                node.set_key_at(0, old_separator);
                node.array.insert(0, (IndexKey::new(), child));
                node.header.current_size += 1;
                moved_child = Some(child);
                k
            }
            _ => {
                return Err(VellumDBError::Internal(
                    "sibling levels disagree".to_string(),
                ))
            }
        };

        ctx.path[level].modified = true;
        {
            let BPlusTreePage::Internal(ref mut parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            parent.set_key_at(node_index, new_separator);
            ctx.path[level - 1].modified = true;
        }
        self.encode_into(&mut left_guard, &left_page);
        drop(left_guard);
        if let Some(child) = moved_child {
            self.set_parent_of(ctx, child, node_id)?;
        }
        Ok(true)
    }

    /// Move the smallest entry of the right sibling onto the tail of the node.
    fn borrow_from_right(
        &self,
        ctx: &mut WriteContext<'_>,
        level: usize,
        right_id: PageId,
    ) -> VellumDBResult<bool> {
        let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
        let mut right_page = self.decode(right_guard.data())?;
        if !right_page.can_borrow() {
            return Ok(false);
        }

        let node_id = ctx.path[level].page.page_id();
        let (right_index, old_separator) = {
            let BPlusTreePage::Internal(ref parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            let index = Self::parent_separator_index(parent, right_id)?;
            (index, parent.key_at(index).clone())
        };

        let mut moved_child: Option<PageId> = None;
        let new_separator = match (&mut ctx.path[level].page, &mut right_page) {
            (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(right)) => {
                let (k, v) = right.array.remove(0);
                right.header.current_size -= 1;
                node.array.push((k, v));
                node.header.current_size += 1;
                right.first_key().clone()
            }
            (BPlusTreePage::Internal(node), BPlusTreePage::Internal(right)) => {
                let (_, child) = right.array.remove(0);
                right.header.current_size -= 1;
                // right's new slot 0 gives up its key to the parent
                let promoted = std::mem::take(&mut right.array[0].0);
                node.array.push((old_separator, child));
                node.header.current_size += 1;
                moved_child = Some(child);
                promoted
            }
            _ => {
                return Err(VellumDBError::Internal(
                    "sibling levels disagree".to_string(),
                ))
            }
        };

        ctx.path[level].modified = true;
        {
            let BPlusTreePage::Internal(ref mut parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            parent.set_key_at(right_index, new_separator);
            ctx.path[level - 1].modified = true;
        }
        self.encode_into(&mut right_guard, &right_page);
        drop(right_guard);
        if let Some(child) = moved_child {
            self.set_parent_of(ctx, child, node_id)?;
        }
        Ok(true)
    }

    /// Fold the underflowing node into its left sibling; the node dies.
    fn merge_into_left(
        &self,
        ctx: &mut WriteContext<'_>,
        level: usize,
        left_id: PageId,
    ) -> VellumDBResult<()> {
        let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
        let mut left_page = self.decode(left_guard.data())?;

        let node_id = ctx.path[level].page.page_id();
        let (node_index, separator) = {
            let BPlusTreePage::Internal(ref parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            let index = Self::parent_separator_index(parent, node_id)?;
            (index, parent.key_at(index).clone())
        };

        let mut moved_children: Vec<PageId> = Vec::new();
        match (&mut left_page, &mut ctx.path[level].page) {
            (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(node)) => {
                let entries = std::mem::take(&mut node.array);
                node.header.current_size = 0;
                left.batch_append(entries);
                left.header.next_page_id = node.header.next_page_id;
            }
            (BPlusTreePage::Internal(left), BPlusTreePage::Internal(node)) => {
                let mut entries = std::mem::take(&mut node.array);
                node.header.current_size = 0;
                // the sentinel slot takes the separator that divided the pair
                if let Some(first) = entries.first_mut() {
                    first.0 = separator;
                }
                moved_children = entries.iter().map(|(_, child)| *child).collect();
                left.batch_append(entries);
            }
            _ => {
                return Err(VellumDBError::Internal(
                    "sibling levels disagree".to_string(),
                ))
            }
        }

        self.encode_into(&mut left_guard, &left_page);
        drop(left_guard);
        for child in moved_children {
            self.set_parent_of(ctx, child, left_id)?;
        }

        {
            let BPlusTreePage::Internal(ref mut parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            parent.remove_at(node_index);
            ctx.path[level - 1].modified = true;
        }
        ctx.path[level].modified = false;
        ctx.deleted.push(node_id);
        Ok(())
    }

    /// Fold the right sibling into the underflowing node; the sibling dies.
    fn merge_right_into_node(
        &self,
        ctx: &mut WriteContext<'_>,
        level: usize,
        right_id: PageId,
    ) -> VellumDBResult<()> {
        let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
        let mut right_page = self.decode(right_guard.data())?;

        let (right_index, separator) = {
            let BPlusTreePage::Internal(ref parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            let index = Self::parent_separator_index(parent, right_id)?;
            (index, parent.key_at(index).clone())
        };

        let node_id = ctx.path[level].page.page_id();
        let mut moved_children: Vec<PageId> = Vec::new();
        match (&mut ctx.path[level].page, &mut right_page) {
            (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(right)) => {
                let entries = std::mem::take(&mut right.array);
                right.header.current_size = 0;
                node.batch_append(entries);
                node.header.next_page_id = right.header.next_page_id;
            }
            (BPlusTreePage::Internal(node), BPlusTreePage::Internal(right)) => {
                let mut entries = std::mem::take(&mut right.array);
                right.header.current_size = 0;
                if let Some(first) = entries.first_mut() {
                    first.0 = separator;
                }
                moved_children = entries.iter().map(|(_, child)| *child).collect();
                node.batch_append(entries);
            }
            _ => {
                return Err(VellumDBError::Internal(
                    "sibling levels disagree".to_string(),
                ))
            }
        }

        drop(right_guard);
        for child in moved_children {
            self.set_parent_of(ctx, child, node_id)?;
        }

        {
            let BPlusTreePage::Internal(ref mut parent) = ctx.path[level - 1].page else {
                return Err(VellumDBError::Internal("parent is not internal".to_string()));
            };
            parent.remove_at(right_index);
            ctx.path[level - 1].modified = true;
        }
        ctx.path[level].modified = true;
        ctx.deleted.push(right_id);
        Ok(())
    }

    /// Decoded copy of the leftmost leaf, for iteration.
    pub(crate) fn first_leaf_snapshot(&self) -> VellumDBResult<Option<BPlusTreeLeafPage>> {
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_id)?;
        drop(root_guard);
        loop {
            match self.decode(guard.data())? {
                BPlusTreePage::Internal(internal) => {
                    let child = self.buffer_pool.fetch_page_read(internal.value_at(0))?;
                    guard = child;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(Some(leaf)),
            }
        }
    }

    /// Decoded copy of the leaf that would contain `key`.
    pub(crate) fn leaf_snapshot_for(&self, key: &[u8]) -> VellumDBResult<Option<BPlusTreeLeafPage>> {
        self.check_key(key)?;
        let root_guard = self.root_page_id.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_id)?;
        drop(root_guard);
        loop {
            match self.decode(guard.data())? {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key, self.comparator);
                    let child = self.buffer_pool.fetch_page_read(child_id)?;
                    guard = child;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(Some(leaf)),
            }
        }
    }

    pub(crate) fn leaf_snapshot(&self, page_id: PageId) -> VellumDBResult<BPlusTreeLeafPage> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        match self.decode(guard.data())? {
            BPlusTreePage::Leaf(leaf) => Ok(leaf),
            BPlusTreePage::Internal(_) => Err(VellumDBError::Storage(format!(
                "page {} is not a leaf",
                page_id
            ))),
        }
    }

    /// Structural invariants, for tests: size bounds on every non-root node,
    /// strictly increasing keys within pages and across the leaf chain,
    /// parent pointers matching the actual parent, and leaves at equal depth.
    pub fn check_integrity(&self) -> VellumDBResult<()> {
        let root_id = self.root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut leaf_depth: Option<usize> = None;
        self.check_subtree(root_id, INVALID_PAGE_ID, true, 0, &mut leaf_depth)?;

        // the sibling chain covers all keys in ascending order
        let mut previous: Option<IndexKey> = None;
        let mut current = self.first_leaf_snapshot()?;
        while let Some(leaf) = current {
            for (key, _) in leaf.array.iter() {
                if let Some(ref prev) = previous {
                    if (self.comparator)(prev, key) != std::cmp::Ordering::Less {
                        return Err(VellumDBError::Internal(
                            "leaf chain keys are not strictly increasing".to_string(),
                        ));
                    }
                }
                previous = Some(key.clone());
            }
            current = if leaf.header.next_page_id == INVALID_PAGE_ID {
                None
            } else {
                Some(self.leaf_snapshot(leaf.header.next_page_id)?)
            };
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        is_root: bool,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> VellumDBResult<()> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let page = self.decode(guard.data())?;
        drop(guard);

        if page.parent_page_id() != expected_parent {
            return Err(VellumDBError::Internal(format!(
                "page {} has parent {}, expected {}",
                page_id,
                page.parent_page_id(),
                expected_parent
            )));
        }

        match page {
            BPlusTreePage::Leaf(leaf) => {
                if !is_root && leaf.header.current_size < leaf.min_size() {
                    return Err(VellumDBError::Internal(format!(
                        "leaf {} below min size",
                        page_id
                    )));
                }
                if leaf.header.current_size > leaf.header.max_size {
                    return Err(VellumDBError::Internal(format!(
                        "leaf {} above max size",
                        page_id
                    )));
                }
                match leaf_depth {
                    Some(expected) if *expected != depth => Err(VellumDBError::Internal(
                        "leaves at unequal depth".to_string(),
                    )),
                    Some(_) => Ok(()),
                    None => {
                        *leaf_depth = Some(depth);
                        Ok(())
                    }
                }
            }
            BPlusTreePage::Internal(internal) => {
                if !is_root && internal.header.current_size < internal.min_size() {
                    return Err(VellumDBError::Internal(format!(
                        "internal {} below min size",
                        page_id
                    )));
                }
                if is_root && internal.header.current_size < 2 {
                    return Err(VellumDBError::Internal(
                        "internal root with fewer than two children".to_string(),
                    ));
                }
                for i in 2..internal.array.len() {
                    if (self.comparator)(internal.key_at(i - 1), internal.key_at(i))
                        != std::cmp::Ordering::Less
                    {
                        return Err(VellumDBError::Internal(format!(
                            "internal {} separators out of order",
                            page_id
                        )));
                    }
                }
                for (_, child) in internal.array.iter() {
                    self.check_subtree(*child, page_id, false, depth + 1, leaf_depth)?;
                }
                Ok(())
            }
        }
    }
}
