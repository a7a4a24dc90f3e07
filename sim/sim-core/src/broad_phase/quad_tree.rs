//! Bounding volume hierarchy with four children per node.
//!
//! Every node stores the bounds of its four children, so a query looks at a
//! node once and decides for all children. A child slot holds nothing, a body
//! or another node. Bodies are only ever leaves.
//!
//! The tree is double-buffered: a rebuild allocates a complete new tree from
//! the same node pool, publishes it by flipping the root index and keeps the
//! old nodes alive until [`QuadTree::discard_old_tree`], so queries that still
//! walk the old root never see freed nodes. The pool is sized for two trees.

use sim_types::{Aabb, BodyId, Result, SimError};
use smallvec::SmallVec;

use super::BodyTracker;

pub(crate) const INVALID_NODE: u32 = u32::MAX;

/// Content of a child slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum NodeRef {
    #[default]
    Empty,
    Body(BodyId),
    Node(u32),
}

#[derive(Debug, Clone)]
struct Node {
    bounds: [Aabb; 4],
    children: [NodeRef; 4],
    parent: u32,
    /// Set when anything below this node was inserted, removed or moved
    /// since the last rebuild.
    changed: bool,
}

impl Node {
    fn new(changed: bool) -> Self {
        Self {
            bounds: [Aabb::invalid(); 4],
            children: [NodeRef::Empty; 4],
            parent: INVALID_NODE,
            changed,
        }
    }

    fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::invalid();
        for (child, child_bounds) in self.children.iter().zip(&self.bounds) {
            if *child != NodeRef::Empty {
                bounds.encapsulate(child_bounds);
            }
        }
        bounds
    }
}

/// Walks the tree on behalf of a query.
pub(crate) trait TreeVisitor {
    /// Stop the walk.
    fn should_abort(&self) -> bool {
        false
    }

    /// Whether a child with these bounds can contain hits.
    fn should_visit(&mut self, bounds: &Aabb) -> bool;

    /// A body whose bounds passed [`TreeVisitor::should_visit`].
    fn visit_body(&mut self, body: BodyId, bounds: &Aabb);
}

/// A prepared subtree that is not linked to the root yet.
#[derive(Debug)]
pub(crate) struct PreparedLeaf {
    pub leaf: NodeRef,
    pub bounds: Aabb,
    pub num_bodies: u32,
    /// Nodes allocated for the subtree, plus one spare for a new root.
    nodes: Vec<u32>,
    spare_root: u32,
}

/// A rebuilt tree waiting to be published.
#[derive(Debug)]
pub(crate) struct RebuiltTree {
    root: u32,
    old_nodes: Vec<u32>,
}

#[derive(Debug)]
pub(crate) struct QuadTree {
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    max_nodes: usize,
    roots: [u32; 2],
    root_index: usize,
    old_tree: Vec<u32>,
    num_bodies: u32,
}

impl QuadTree {
    /// A tree whose pool can hold the nodes of two trees over `max_bodies`.
    pub fn new(max_bodies: usize) -> Self {
        // Room for the published tree and one being rebuilt.
        let max_nodes = 2 * (max_bodies + 1);
        let mut nodes = Vec::with_capacity(max_nodes);
        nodes.push(Node::new(false));
        Self {
            nodes,
            free_nodes: Vec::new(),
            max_nodes,
            roots: [0, INVALID_NODE],
            root_index: 0,
            old_tree: Vec::new(),
            num_bodies: 0,
        }
    }

    fn root(&self) -> u32 {
        self.roots[self.root_index]
    }

    pub fn num_bodies(&self) -> u32 {
        self.num_bodies
    }

    pub fn has_bodies(&self) -> bool {
        self.num_bodies != 0
    }

    /// True if the tree changed since it was last rebuilt.
    pub fn is_dirty(&self) -> bool {
        self.nodes[self.root() as usize].changed
    }

    /// False while an old tree still waits to be discarded.
    pub fn can_be_updated(&self) -> bool {
        self.old_tree.is_empty()
    }

    /// Number of nodes in use, including an old tree not yet discarded.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len() - self.free_nodes.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes[self.root() as usize].bounds()
    }

    fn allocate_node(&mut self, changed: bool) -> Result<u32> {
        if let Some(index) = self.free_nodes.pop() {
            self.nodes[index as usize] = Node::new(changed);
            return Ok(index);
        }
        if self.nodes.len() >= self.max_nodes {
            return Err(SimError::capacity_exceeded(
                "quad tree nodes",
                self.nodes.len() + 1,
                self.max_nodes,
            ));
        }
        let index = u32::try_from(self.nodes.len()).map_err(|_| {
            SimError::capacity_exceeded("quad tree nodes", self.nodes.len(), self.max_nodes)
        })?;
        self.nodes.push(Node::new(changed));
        Ok(index)
    }

    fn free_nodes(&mut self, nodes: &[u32]) {
        for &index in nodes {
            debug_assert!(!self.free_nodes.contains(&index), "node {index} freed twice");
            self.nodes[index as usize] = Node::new(false);
            self.free_nodes.push(index);
        }
    }

    fn set_child(
        &mut self,
        node: u32,
        child: usize,
        content: NodeRef,
        bounds: Aabb,
        trackers: &mut [BodyTracker],
    ) {
        let slot = &mut self.nodes[node as usize];
        slot.children[child] = content;
        slot.bounds[child] = bounds;
        match content {
            NodeRef::Body(body) => trackers[body.index() as usize].set_location(node, child),
            NodeRef::Node(index) => self.nodes[index as usize].parent = node,
            NodeRef::Empty => {}
        }
    }

    fn mark_changed(&mut self, mut node: u32) {
        while node != INVALID_NODE {
            let slot = &mut self.nodes[node as usize];
            if slot.changed {
                break;
            }
            slot.changed = true;
            node = slot.parent;
        }
    }

    fn child_slot(&self, parent: u32, child: u32) -> Option<usize> {
        self.nodes[parent as usize]
            .children
            .iter()
            .position(|c| *c == NodeRef::Node(child))
    }

    /// Build a subtree over `leaves` with new nodes. Body locations are
    /// written to `trackers`; the subtree root is returned unlinked.
    fn build(
        &mut self,
        leaves: &mut [(BodyId, Aabb)],
        trackers: &mut [BodyTracker],
        allocated: &mut Vec<u32>,
        changed: bool,
    ) -> Result<(NodeRef, Aabb)> {
        match leaves {
            [] => return Ok((NodeRef::Empty, Aabb::invalid())),
            [(body, bounds)] => return Ok((NodeRef::Body(*body), *bounds)),
            _ => {}
        }

        let mid = partition(leaves);
        let (left, right) = leaves.split_at_mut(mid);
        let q1 = partition(left);
        let q3 = partition(right);
        let (a, b) = left.split_at_mut(q1);
        let (c, d) = right.split_at_mut(q3);

        let node = self.allocate_node(changed)?;
        allocated.push(node);
        let mut child = 0;
        let mut node_bounds = Aabb::invalid();
        for group in [a, b, c, d] {
            let (content, bounds) = self.build(group, trackers, allocated, changed)?;
            if content == NodeRef::Empty {
                continue;
            }
            self.set_child(node, child, content, bounds, trackers);
            node_bounds.encapsulate(&bounds);
            child += 1;
        }
        Ok((NodeRef::Node(node), node_bounds))
    }

    /// Build a subtree for bodies about to be added. Trackers already point
    /// into the subtree; nothing is reachable from the root yet.
    pub fn add_bodies_prepare(
        &mut self,
        leaves: &mut [(BodyId, Aabb)],
        trackers: &mut [BodyTracker],
    ) -> Result<PreparedLeaf> {
        let mut nodes = Vec::new();
        let built = self
            .build(leaves, trackers, &mut nodes, true)
            .and_then(|built| self.allocate_node(true).map(|spare| (built, spare)));
        match built {
            Ok(((leaf, bounds), spare_root)) => Ok(PreparedLeaf {
                leaf,
                bounds,
                num_bodies: u32::try_from(leaves.len()).unwrap_or(u32::MAX),
                nodes,
                spare_root,
            }),
            Err(e) => {
                self.free_nodes(&nodes);
                Err(e)
            }
        }
    }

    /// Link a prepared subtree under the root. When the root is full a new
    /// root is made from the spare node.
    pub fn add_bodies_finalize(&mut self, prepared: PreparedLeaf, trackers: &mut [BodyTracker]) {
        let root = self.root();
        let free_slot = self.nodes[root as usize]
            .children
            .iter()
            .position(|c| *c == NodeRef::Empty);
        if let Some(slot) = free_slot {
            self.set_child(root, slot, prepared.leaf, prepared.bounds, trackers);
            self.free_nodes(&[prepared.spare_root]);
            self.mark_changed(root);
        } else {
            let new_root = prepared.spare_root;
            let old_bounds = self.nodes[root as usize].bounds();
            self.set_child(new_root, 0, NodeRef::Node(root), old_bounds, trackers);
            self.set_child(new_root, 1, prepared.leaf, prepared.bounds, trackers);
            self.roots[self.root_index] = new_root;
        }
        self.num_bodies += prepared.num_bodies;
    }

    /// Throw away a prepared subtree.
    pub fn add_bodies_abort(&mut self, prepared: PreparedLeaf) {
        self.free_nodes(&prepared.nodes);
        self.free_nodes(&[prepared.spare_root]);
    }

    /// Empty the slot of a body. The node stays until the next rebuild.
    pub fn remove_body(&mut self, body: BodyId, trackers: &mut [BodyTracker]) {
        let tracker = &mut trackers[body.index() as usize];
        let Some((node, child)) = tracker.location() else {
            return;
        };
        tracker.invalidate_location();
        let slot = &mut self.nodes[node as usize];
        debug_assert_eq!(slot.children[child], NodeRef::Body(body), "tracker out of sync");
        slot.children[child] = NodeRef::Empty;
        slot.bounds[child] = Aabb::invalid();
        self.mark_changed(node);
        self.num_bodies -= 1;
    }

    /// Set the bounds of a body and widen every ancestor to contain them.
    pub fn update_body_bounds(&mut self, body: BodyId, bounds: &Aabb, trackers: &[BodyTracker]) {
        let Some((node, child)) = trackers[body.index() as usize].location() else {
            return;
        };
        self.nodes[node as usize].bounds[child] = *bounds;

        let mut current = node;
        loop {
            let parent = self.nodes[current as usize].parent;
            if parent == INVALID_NODE {
                break;
            }
            let Some(slot) = self.child_slot(parent, current) else {
                break;
            };
            let parent_bounds = &mut self.nodes[parent as usize].bounds[slot];
            if parent_bounds.contains(bounds) {
                break;
            }
            parent_bounds.encapsulate(bounds);
            current = parent;
        }
        self.mark_changed(node);
    }

    fn collect_bodies(&self, root: u32, leaves: &mut Vec<(BodyId, Aabb)>, nodes: &mut Vec<u32>) {
        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(root);
        while let Some(index) = stack.pop() {
            nodes.push(index);
            let node = &self.nodes[index as usize];
            for (child, bounds) in node.children.iter().zip(&node.bounds) {
                match *child {
                    NodeRef::Empty => {}
                    NodeRef::Body(body) => leaves.push((body, *bounds)),
                    NodeRef::Node(n) => stack.push(n),
                }
            }
        }
    }

    fn relink(&mut self, root: u32, trackers: &mut [BodyTracker]) {
        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(root);
        while let Some(index) = stack.pop() {
            let children = self.nodes[index as usize].children;
            for (child, content) in children.iter().enumerate() {
                match *content {
                    NodeRef::Empty => {}
                    NodeRef::Body(body) => {
                        trackers[body.index() as usize].set_location(index, child);
                    }
                    NodeRef::Node(n) => stack.push(n),
                }
            }
        }
    }

    /// Build a complete new tree from the bodies of the current one.
    ///
    /// Returns `None` when the tree is clean or the previous old tree has not
    /// been discarded. Trackers point into the new tree afterwards.
    pub fn update_prepare(&mut self, trackers: &mut [BodyTracker]) -> Result<Option<RebuiltTree>> {
        if !self.is_dirty() || !self.can_be_updated() {
            return Ok(None);
        }

        let mut leaves = Vec::with_capacity(self.num_bodies as usize);
        let mut old_nodes = Vec::new();
        self.collect_bodies(self.root(), &mut leaves, &mut old_nodes);
        // Visit order depends on the tree shape; sort so the rebuilt tree
        // depends only on the bodies.
        leaves.sort_unstable_by_key(|(body, _)| *body);

        let mut allocated = Vec::new();
        let built = self
            .build(&mut leaves, trackers, &mut allocated, false)
            .and_then(|(content, bounds)| match content {
                NodeRef::Node(root) => Ok(root),
                _ => {
                    let root = self.allocate_node(false)?;
                    allocated.push(root);
                    if content != NodeRef::Empty {
                        self.set_child(root, 0, content, bounds, trackers);
                    }
                    Ok(root)
                }
            });

        match built {
            Ok(root) => Ok(Some(RebuiltTree { root, old_nodes })),
            Err(e) => {
                self.free_nodes(&allocated);
                self.relink(self.root(), trackers);
                Err(e)
            }
        }
    }

    /// Publish a rebuilt tree. The previous tree stays allocated until
    /// [`QuadTree::discard_old_tree`].
    pub fn update_finalize(&mut self, rebuilt: RebuiltTree) {
        debug_assert!(self.can_be_updated(), "old tree not discarded");
        let next = self.root_index ^ 1;
        self.roots[next] = rebuilt.root;
        self.root_index = next;
        self.old_tree = rebuilt.old_nodes;
    }

    /// Free the nodes of the tree replaced by the last rebuild.
    pub fn discard_old_tree(&mut self) {
        let old = std::mem::take(&mut self.old_tree);
        self.free_nodes(&old);
        self.roots[self.root_index ^ 1] = INVALID_NODE;
    }

    /// Visit the current tree depth first.
    pub fn walk(&self, visitor: &mut impl TreeVisitor) {
        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(self.root());
        while let Some(index) = stack.pop() {
            if visitor.should_abort() {
                return;
            }
            let node = &self.nodes[index as usize];
            for (child, bounds) in node.children.iter().zip(&node.bounds) {
                match *child {
                    NodeRef::Empty => {}
                    NodeRef::Body(body) => {
                        if visitor.should_visit(bounds) {
                            visitor.visit_body(body, bounds);
                            if visitor.should_abort() {
                                return;
                            }
                        }
                    }
                    NodeRef::Node(n) => {
                        if visitor.should_visit(bounds) {
                            stack.push(n);
                        }
                    }
                }
            }
        }
    }

    /// Depth of the current tree, 1 for a lone root.
    pub fn max_depth(&self) -> u32 {
        let mut depth = 0;
        let mut stack: SmallVec<[(u32, u32); 64]> = SmallVec::new();
        stack.push((self.root(), 1));
        while let Some((index, level)) = stack.pop() {
            depth = depth.max(level);
            for child in &self.nodes[index as usize].children {
                if let NodeRef::Node(n) = *child {
                    stack.push((n, level + 1));
                }
            }
        }
        depth
    }
}

/// Split `leaves` in two halves around the median center on the axis along
/// which the centers spread the most. Returns the split index.
fn partition(leaves: &mut [(BodyId, Aabb)]) -> usize {
    let mid = leaves.len() / 2;
    if leaves.len() < 2 {
        return mid;
    }

    let mut centers = Aabb::invalid();
    for (_, bounds) in leaves.iter() {
        let c = bounds.center();
        centers.encapsulate(&Aabb::new(c, c));
    }
    let axis = centers.longest_axis().index();
    leaves.select_nth_unstable_by(mid, |(id_a, a), (id_b, b)| {
        a.center()[axis]
            .total_cmp(&b.center()[axis])
            .then(id_a.cmp(id_b))
    });
    mid
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    struct Collect {
        query: Aabb,
        hits: Vec<BodyId>,
    }

    impl TreeVisitor for Collect {
        fn should_visit(&mut self, bounds: &Aabb) -> bool {
            bounds.overlaps(&self.query)
        }

        fn visit_body(&mut self, body: BodyId, _: &Aabb) {
            self.hits.push(body);
        }
    }

    fn unit_box(x: f64) -> Aabb {
        Aabb::from_center(Point3::new(x, 0.0, 0.0), Vector3::new(0.5, 0.5, 0.5))
    }

    fn leaves(n: u32) -> Vec<(BodyId, Aabb)> {
        (0..n)
            .map(|i| (BodyId::new(i, 0), unit_box(f64::from(i) * 2.0)))
            .collect()
    }

    fn tree_with(n: u32) -> (QuadTree, Vec<BodyTracker>) {
        let mut tree = QuadTree::new(n as usize);
        let mut trackers = vec![BodyTracker::INVALID; n as usize];
        let mut bodies = leaves(n);
        let prepared = tree.add_bodies_prepare(&mut bodies, &mut trackers).unwrap();
        tree.add_bodies_finalize(prepared, &mut trackers);
        (tree, trackers)
    }

    fn query(tree: &QuadTree, aabb: Aabb) -> Vec<BodyId> {
        let mut visitor = Collect {
            query: aabb,
            hits: Vec::new(),
        };
        tree.walk(&mut visitor);
        visitor.hits.sort();
        visitor.hits
    }

    #[test]
    fn test_added_bodies_are_found() {
        let (tree, trackers) = tree_with(20);
        assert_eq!(tree.num_bodies(), 20);
        assert!(trackers.iter().all(|t| t.location().is_some()));

        let hits = query(&tree, unit_box(10.0));
        assert_eq!(hits, vec![BodyId::new(5, 0)]);
    }

    #[test]
    fn test_remove_empties_slot_and_marks_dirty() {
        let (mut tree, mut trackers) = tree_with(8);
        let mut rebuilt = tree.update_prepare(&mut trackers).unwrap().unwrap();
        tree.update_finalize(rebuilt);
        tree.discard_old_tree();
        assert!(!tree.is_dirty());

        tree.remove_body(BodyId::new(3, 0), &mut trackers);
        assert!(tree.is_dirty());
        assert_eq!(tree.num_bodies(), 7);
        assert!(trackers[3].location().is_none());
        assert!(query(&tree, unit_box(6.0)).is_empty());

        rebuilt = tree.update_prepare(&mut trackers).unwrap().unwrap();
        tree.update_finalize(rebuilt);
        let everything = Aabb::from_center(Point3::origin(), Vector3::repeat(100.0));
        assert_eq!(query(&tree, everything).len(), 7);
    }

    #[test]
    fn test_moved_body_widens_ancestors() {
        let (mut tree, trackers) = tree_with(16);
        let moved = unit_box(100.0);
        tree.update_body_bounds(BodyId::new(0, 0), &moved, &trackers);

        assert_eq!(query(&tree, moved), vec![BodyId::new(0, 0)]);
        assert!(tree.bounds().contains(&moved));
    }

    #[test]
    fn test_full_root_grows_new_root() {
        let mut tree = QuadTree::new(16);
        let mut trackers = vec![BodyTracker::INVALID; 16];
        for i in 0..5 {
            let mut single = vec![(BodyId::new(i, 0), unit_box(f64::from(i)))];
            let prepared = tree.add_bodies_prepare(&mut single, &mut trackers).unwrap();
            tree.add_bodies_finalize(prepared, &mut trackers);
        }
        assert_eq!(tree.num_bodies(), 5);
        assert_eq!(tree.max_depth(), 2);
        assert_eq!(query(&tree, unit_box(4.0)).len(), 2);
    }

    #[test]
    fn test_rebuild_keeps_old_tree_until_discarded() {
        let (mut tree, mut trackers) = tree_with(40);
        let before = tree.num_nodes();
        let rebuilt = tree.update_prepare(&mut trackers).unwrap().unwrap();
        tree.update_finalize(rebuilt);

        assert!(!tree.can_be_updated());
        assert!(tree.update_prepare(&mut trackers).unwrap().is_none());
        assert!(tree.num_nodes() > before);

        tree.discard_old_tree();
        assert!(tree.can_be_updated());
        assert!(tree.num_nodes() < before + 2);
        assert_eq!(query(&tree, unit_box(78.0)), vec![BodyId::new(39, 0)]);
    }

    #[test]
    fn test_rebuilt_tree_is_shallow() {
        let (mut tree, mut trackers) = tree_with(64);
        let rebuilt = tree.update_prepare(&mut trackers).unwrap().unwrap();
        tree.update_finalize(rebuilt);
        // 64 leaves, four per node: three levels.
        assert_eq!(tree.max_depth(), 3);
    }

    #[test]
    fn test_abort_returns_nodes() {
        let mut tree = QuadTree::new(32);
        let mut trackers = vec![BodyTracker::INVALID; 32];
        let mut bodies = leaves(32);
        let prepared = tree.add_bodies_prepare(&mut bodies, &mut trackers).unwrap();
        assert!(tree.num_nodes() > 1);

        tree.add_bodies_abort(prepared);
        assert_eq!(tree.num_nodes(), 1);
        assert!(!tree.has_bodies());
    }

    #[test]
    fn test_node_pool_exhaustion_is_an_error() {
        let mut tree = QuadTree::new(1);
        let mut trackers = vec![BodyTracker::INVALID; 64];
        let mut bodies = leaves(64);
        let err = tree.add_bodies_prepare(&mut bodies, &mut trackers).unwrap_err();
        assert!(err.is_capacity_error());
        assert_eq!(tree.num_nodes(), 1);
    }
}
