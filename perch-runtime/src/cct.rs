//! The per-thread calling-context tree.
//!
//! Nodes live in fixed-size segments carved from the owning thread's arena
//! (the freeable half: the tree is reclaimed wholesale after an epoch
//! write-out). References between nodes are packed (segment, slot) indices,
//! so the tree has no owning pointers and no destructor.
//!
//! The tree is single-writer by construction: only the owning thread
//! inserts, from its own signal handler, so no locking is needed anywhere
//! here.
//!
//! Children hang off their parent as an intrusive sibling list; once a
//! node collects more than [`CHILD_TABLE_THRESHOLD`] children, an
//! open-addressing table (also arena memory) takes over lookups while the
//! sibling list keeps serving traversal. Metric values are sparse sorted
//! `(metric, f64)` arrays attached per node.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::arena::Arena;
use crate::backtrace::Frame;
use crate::ip::NormalizedIp;
use crate::metrics::MetricId;

const SLOT_BITS: u32 = 10;
pub const NODES_PER_SEGMENT: usize = 1 << SLOT_BITS;
const MAX_SEGMENTS: usize = 256;

/// Linear child search is abandoned past this many children.
const CHILD_TABLE_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(u32);

impl NodeRef {
    pub const NULL: NodeRef = NodeRef(u32::MAX);

    fn new(segment: usize, slot: usize) -> NodeRef {
        NodeRef((segment as u32) << SLOT_BITS | slot as u32)
    }

    fn segment(self) -> usize {
        (self.0 >> SLOT_BITS) as usize
    }

    fn slot(self) -> usize {
        (self.0 & (NODES_PER_SEGMENT as u32 - 1)) as usize
    }

    pub fn is_null(self) -> bool {
        self == NodeRef::NULL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The process root; every parent chain ends here.
    Root,
    /// Root for walks that stopped at a thread bottom (or weakly).
    ThreadRoot,
    /// Root for walks that aborted before a bottom fence.
    PartialUnwindRoot,
    /// Root for frames whose module vanished before resolution.
    UnresolvedRoot,
    Call,
}

struct ChildTable {
    capacity: u32,
    len: u32,
    /// `capacity` slots of `(addr, node)`; empty slots hold `NULL`.
    slots: *mut (NormalizedIp, NodeRef),
}

#[derive(Debug)]
pub struct CctNode {
    pub addr: NormalizedIp,
    /// Enclosing function of `addr`; the recursion-folding key.
    pub function: NormalizedIp,
    pub kind: NodeKind,
    /// Creation-order id; stable for the bundle's lifetime, used as the
    /// on-disk node id and by trace records. The root is 0 and parents
    /// always have smaller ids than their children.
    pub persistent_id: u32,
    pub parent: NodeRef,
    first_child: NodeRef,
    next_sibling: NodeRef,
    child_count: u32,
    child_table: *mut ChildTable,
    metrics: *mut (MetricId, f64),
    metrics_len: u16,
    metrics_cap: u16,
}

impl CctNode {
    /// The node's sparse metric vector, sorted by metric id.
    pub fn metrics(&self) -> &[(MetricId, f64)] {
        if self.metrics.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.metrics, self.metrics_len as usize) }
    }
}

/// One thread's calling-context tree plus its distinguished roots.
#[derive(Debug)]
pub struct CctBundle {
    segments: [*mut CctNode; MAX_SEGMENTS],
    nsegments: usize,
    /// Slots used in the newest segment.
    fill: usize,
    pub top: NodeRef,
    pub thread_root: NodeRef,
    pub partial_unwind_root: NodeRef,
    pub unresolved_root: NodeRef,
    pub num_nodes: u32,
}

unsafe impl Send for CctBundle {}

impl CctBundle {
    /// Builds an empty tree: the process root and the three special roots.
    pub fn new_in(arena: &Arena) -> Option<CctBundle> {
        let mut bundle = CctBundle {
            segments: [std::ptr::null_mut(); MAX_SEGMENTS],
            nsegments: 0,
            fill: NODES_PER_SEGMENT,
            top: NodeRef::NULL,
            thread_root: NodeRef::NULL,
            partial_unwind_root: NodeRef::NULL,
            unresolved_root: NodeRef::NULL,
            num_nodes: 0,
        };
        let top = bundle.new_node(
            arena,
            NodeKind::Root,
            NormalizedIp::PROCESS_ROOT,
            NodeRef::NULL,
        )?;
        bundle.top = top;
        bundle.thread_root =
            bundle.attach_marker(arena, NodeKind::ThreadRoot, NormalizedIp::THREAD_ROOT)?;
        bundle.partial_unwind_root = bundle.attach_marker(
            arena,
            NodeKind::PartialUnwindRoot,
            NormalizedIp::PARTIAL_UNWIND,
        )?;
        bundle.unresolved_root =
            bundle.attach_marker(arena, NodeKind::UnresolvedRoot, NormalizedIp::UNRESOLVED)?;
        Some(bundle)
    }

    fn attach_marker(
        &mut self,
        arena: &Arena,
        kind: NodeKind,
        addr: NormalizedIp,
    ) -> Option<NodeRef> {
        let top = self.top;
        let marker = self.new_node(arena, kind, addr, top)?;
        let prev_head = self.node(top).first_child;
        self.node_mut(marker).next_sibling = prev_head;
        self.node_mut(top).first_child = marker;
        self.node_mut(top).child_count += 1;
        Some(marker)
    }

    pub fn node(&self, r: NodeRef) -> &CctNode {
        debug_assert!(!r.is_null());
        unsafe { &*self.segments[r.segment()].add(r.slot()) }
    }

    fn node_mut(&mut self, r: NodeRef) -> &mut CctNode {
        debug_assert!(!r.is_null());
        unsafe { &mut *self.segments[r.segment()].add(r.slot()) }
    }

    /// Inserts a whole backtrace (innermost frame first, as harvested)
    /// below `root` and returns the leaf node.
    ///
    /// `None` means the arena is exhausted; the caller disables sampling.
    pub fn insert_backtrace(
        &mut self,
        arena: &Arena,
        root: NodeRef,
        frames: &[Frame],
        fold_recursion: bool,
    ) -> Option<NodeRef> {
        self.insert_frames_under(arena, root, frames.iter().rev(), fold_recursion)
    }

    /// Inserts frames ordered outermost first below `node`.
    pub fn insert_frames_under<'f>(
        &mut self,
        arena: &Arena,
        mut node: NodeRef,
        frames: impl Iterator<Item = &'f Frame>,
        fold_recursion: bool,
    ) -> Option<NodeRef> {
        for frame in frames {
            let current = self.node(node);
            // Consecutive frames in the same function share one node, so
            // deep recursion cannot grow the tree without bound.
            if fold_recursion
                && current.kind == NodeKind::Call
                && !frame.the_function.is_placeholder()
                && current.function == frame.the_function
            {
                continue;
            }
            node = self.find_or_add_child(arena, node, frame.ip_norm, frame.the_function)?;
        }
        Some(node)
    }

    /// Adds `increment` to the leaf's value for `metric`.
    ///
    /// NaN increments are discarded: metric vectors never hold NaN.
    pub fn add_metric(
        &mut self,
        arena: &Arena,
        node: NodeRef,
        metric: MetricId,
        increment: f64,
    ) -> bool {
        if increment.is_nan() {
            return false;
        }
        let n = self.node(node);
        let (slots, len, cap) = (n.metrics, n.metrics_len as usize, n.metrics_cap as usize);
        let search = if len == 0 {
            Err(0)
        } else {
            let values = unsafe { std::slice::from_raw_parts(slots, len) };
            values.binary_search_by_key(&metric, |&(id, _)| id)
        };
        match search {
            Ok(idx) => {
                let values = unsafe { std::slice::from_raw_parts_mut(slots, len) };
                values[idx].1 += increment;
                true
            }
            Err(idx) => {
                if len == cap {
                    let new_cap = (cap * 2).max(4);
                    let bytes = new_cap * std::mem::size_of::<(MetricId, f64)>();
                    let Some(fresh) = arena.alloc_freeable(bytes) else {
                        return false;
                    };
                    let fresh = fresh.cast::<(MetricId, f64)>();
                    if len > 0 {
                        unsafe {
                            std::ptr::copy_nonoverlapping(slots, fresh.as_ptr(), len);
                        }
                    }
                    let n = self.node_mut(node);
                    n.metrics = fresh.as_ptr();
                    n.metrics_cap = new_cap as u16;
                }
                let n = self.node_mut(node);
                unsafe {
                    let base = n.metrics;
                    std::ptr::copy(base.add(idx), base.add(idx + 1), len - idx);
                    base.add(idx).write((metric, increment));
                }
                n.metrics_len += 1;
                true
            }
        }
    }

    pub fn metric_values(&self, node: NodeRef) -> &[(MetricId, f64)] {
        self.node(node).metrics()
    }

    /// Depth-first pre-order walk from `root`. The visitor sees every
    /// node after its parent.
    pub fn walk_preorder(&self, root: NodeRef, visitor: &mut impl FnMut(&CctNode)) {
        let mut stack = vec![root];
        while let Some(node_ref) = stack.pop() {
            let node = self.node(node_ref);
            visitor(node);
            let mut child = node.first_child;
            while !child.is_null() {
                stack.push(child);
                child = self.node(child).next_sibling;
            }
        }
    }

    /// The leaf for threads that never ran between samples.
    pub fn no_activity_node(&mut self, arena: &Arena) -> Option<NodeRef> {
        let top = self.top;
        self.find_or_add_child(arena, top, NormalizedIp::NO_ACTIVITY, NormalizedIp::NO_ACTIVITY)
    }

    fn find_or_add_child(
        &mut self,
        arena: &Arena,
        parent: NodeRef,
        addr: NormalizedIp,
        function: NormalizedIp,
    ) -> Option<NodeRef> {
        let p = self.node(parent);
        let table = p.child_table;
        if !table.is_null() {
            if let Some(found) = table_lookup(table, addr) {
                return Some(found);
            }
        } else {
            let mut child = p.first_child;
            while !child.is_null() {
                let c = self.node(child);
                if c.addr == addr {
                    return Some(child);
                }
                child = c.next_sibling;
            }
        }

        let child = self.new_node(arena, NodeKind::Call, addr, parent)?;
        self.node_mut(child).function = function;
        let prev_head = self.node(parent).first_child;
        self.node_mut(child).next_sibling = prev_head;
        let p = self.node_mut(parent);
        p.first_child = child;
        p.child_count += 1;

        let table = self.node(parent).child_table;
        if !table.is_null() {
            self.table_insert(arena, parent, addr, child);
        } else if self.node(parent).child_count > CHILD_TABLE_THRESHOLD {
            self.escalate_children(arena, parent);
        }
        Some(child)
    }

    /// Builds the open-addressing child table from the sibling list.
    fn escalate_children(&mut self, arena: &Arena, parent: NodeRef) {
        let count = self.node(parent).child_count;
        let capacity = (count * 4).next_power_of_two().max(32);
        let Some(table) = new_table(arena, capacity) else {
            return; // keep linear lookups; correctness is unaffected
        };
        self.node_mut(parent).child_table = table;
        let mut child = self.node(parent).first_child;
        while !child.is_null() {
            let c = self.node(child);
            let (addr, next) = (c.addr, c.next_sibling);
            self.table_insert(arena, parent, addr, child);
            child = next;
        }
    }

    fn table_insert(&mut self, arena: &Arena, parent: NodeRef, addr: NormalizedIp, node: NodeRef) {
        let table = self.node(parent).child_table;
        debug_assert!(!table.is_null());
        unsafe {
            if (*table).len * 10 >= (*table).capacity * 7 {
                let capacity = (*table).capacity * 2;
                let Some(bigger) = new_table(arena, capacity) else {
                    return;
                };
                for i in 0..(*table).capacity {
                    let (a, r) = *(*table).slots.add(i as usize);
                    if !r.is_null() {
                        raw_table_insert(bigger, a, r);
                    }
                }
                self.node_mut(parent).child_table = bigger;
                return self.table_insert(arena, parent, addr, node);
            }
            raw_table_insert(table, addr, node);
        }
    }

    fn new_node(
        &mut self,
        arena: &Arena,
        kind: NodeKind,
        addr: NormalizedIp,
        parent: NodeRef,
    ) -> Option<NodeRef> {
        if self.fill == NODES_PER_SEGMENT {
            if self.nsegments == MAX_SEGMENTS {
                return None;
            }
            let bytes = NODES_PER_SEGMENT * std::mem::size_of::<CctNode>();
            let segment = arena.alloc_freeable(bytes)?.cast::<CctNode>();
            self.segments[self.nsegments] = segment.as_ptr();
            self.nsegments += 1;
            self.fill = 0;
        }
        let r = NodeRef::new(self.nsegments - 1, self.fill);
        self.fill += 1;
        let persistent_id = self.num_nodes;
        self.num_nodes += 1;
        unsafe {
            self.segments[r.segment()].add(r.slot()).write(CctNode {
                addr,
                function: addr,
                kind,
                persistent_id,
                parent,
                first_child: NodeRef::NULL,
                next_sibling: NodeRef::NULL,
                child_count: 0,
                child_table: std::ptr::null_mut(),
                metrics: std::ptr::null_mut(),
                metrics_len: 0,
                metrics_cap: 0,
            });
        }
        Some(r)
    }
}

fn hash_ip(addr: NormalizedIp) -> u64 {
    let mut hasher = FxHasher::default();
    addr.hash(&mut hasher);
    hasher.finish()
}

fn new_table(arena: &Arena, capacity: u32) -> Option<*mut ChildTable> {
    let slots_bytes = capacity as usize * std::mem::size_of::<(NormalizedIp, NodeRef)>();
    let slots = arena
        .alloc_freeable(slots_bytes)?
        .cast::<(NormalizedIp, NodeRef)>()
        .as_ptr();
    for i in 0..capacity as usize {
        unsafe { slots.add(i).write((NormalizedIp::UNNORMALIZED, NodeRef::NULL)) };
    }
    let table = arena
        .alloc_freeable(std::mem::size_of::<ChildTable>())?
        .cast::<ChildTable>()
        .as_ptr();
    unsafe {
        table.write(ChildTable {
            capacity,
            len: 0,
            slots,
        });
    }
    Some(table)
}

fn table_lookup(table: *const ChildTable, addr: NormalizedIp) -> Option<NodeRef> {
    unsafe {
        let capacity = (*table).capacity as u64;
        let mut index = hash_ip(addr) % capacity;
        loop {
            let (slot_addr, slot_ref) = *(*table).slots.add(index as usize);
            if slot_ref.is_null() {
                return None;
            }
            if slot_addr == addr {
                return Some(slot_ref);
            }
            index = (index + 1) % capacity;
        }
    }
}

fn raw_table_insert(table: *mut ChildTable, addr: NormalizedIp, node: NodeRef) {
    unsafe {
        let capacity = (*table).capacity as u64;
        let mut index = hash_ip(addr) % capacity;
        loop {
            let slot = (*table).slots.add(index as usize);
            if (*slot).1.is_null() {
                slot.write((addr, node));
                (*table).len += 1;
                return;
            }
            index = (index + 1) % capacity;
        }
    }
}
