//! Hierarchical R-tree index and the angle/distance-pruned handlers.
//!
//! Nodes live in a generational arena; each caches an aggregate bounding
//! sphere over descendant object *centers*, the largest member radius
//! beneath it, and a descendant count. The center-bound plus max-member
//! split is what makes solid-angle pruning exact at the node boundary:
//! no member can subtend more than `max_member / (dist - bound.radius)`.
//!
//! Invariants:
//! * Every interior node's cached bound contains all leaf bounds beneath it;
//!   any mutation re-aggregates the leaf-to-root path.
//! * `leaf_of` maps every indexed object to the leaf currently holding it.
//! * Node counts sum exactly: an interior count equals the sum of its
//!   children's counts. The cut handlers rely on this for cheap coverage
//!   validation.
//!
//! Moving objects drift away from the bounds captured at insert time, so
//! `refresh` recomputes all aggregates bottom-up at the evaluation instant
//! before queries run. Pruning then stays conservative under velocity
//! without motion-expanded bounds.

use crate::common::{ObjState, ObjectMirror, QueryData, QueryRegistry};
use crate::query::{Query, QueryEvent, QueryHandler, QueryId, QueryState};
use ahash::{AHashMap, AHashSet};
use core_cache::{LocationCache, LocationCacheListener};
use core_motion::solid_angle::max_subtendable;
use core_motion::{BoundingSphere, ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};

pub const DEFAULT_BRANCHING: usize = 10;

/// Synthetic object id carried by a tree node, used when nodes surface in
/// result streams (cut movement, aggregate imposters). Distinguishable from
/// world ids by the marker byte.
pub fn node_object_id(tag: u64) -> ObjectId {
    let mut b = [0u8; 16];
    b[0] = 0xA8;
    b[8..].copy_from_slice(&tag.to_be_bytes());
    ObjectId::from_bytes(b)
}

pub fn is_node_object_id(id: ObjectId) -> bool {
    id.as_bytes()[0] == 0xA8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    idx: u32,
    generation: u32,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Leaf(Vec<ObjectId>),
    Interior(Vec<NodeId>),
}

#[derive(Debug)]
pub(crate) struct RNode {
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub bound: BoundingSphere,
    pub max_member: f32,
    pub count: usize,
    pub tag: ObjectId,
}

impl RNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }
}

#[derive(Debug)]
struct NodeSlot {
    generation: u32,
    node: Option<RNode>,
}

/// Which bound test the descent uses. Mathematically the two prune the same
/// subtrees; the distance form skips the per-node division and exists as its
/// own handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneKind {
    Angle,
    Distance,
}

#[derive(Debug)]
pub(crate) struct RTree {
    slots: Vec<NodeSlot>,
    free: Vec<u32>,
    root: Option<NodeId>,
    branching: usize,
    leaf_of: AHashMap<ObjectId, NodeId>,
    next_tag: u64,
}

impl RTree {
    pub fn new(branching: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            branching: branching.max(2),
            leaf_of: AHashMap::new(),
            next_tag: 0,
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn object_count(&self) -> usize {
        self.root
            .and_then(|r| self.node(r))
            .map(|n| n.count)
            .unwrap_or(0)
    }

    pub fn node(&self, id: NodeId) -> Option<&RNode> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut RNode {
        let slot = &mut self.slots[id.idx as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node.as_mut().expect("node freed while referenced")
    }

    fn alloc(&mut self, node: RNode) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.node = Some(node);
                NodeId {
                    idx,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(NodeSlot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    idx: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let slot = &mut self.slots[id.idx as usize];
        debug_assert_eq!(slot.generation, id.generation);
        slot.node = None;
        self.free.push(id.idx);
    }

    fn fresh_tag(&mut self) -> ObjectId {
        self.next_tag += 1;
        node_object_id(self.next_tag)
    }

    fn new_leaf(&mut self, members: Vec<ObjectId>, parent: Option<NodeId>) -> NodeId {
        let tag = self.fresh_tag();
        self.alloc(RNode {
            parent,
            kind: NodeKind::Leaf(members),
            bound: BoundingSphere::default(),
            max_member: 0.0,
            count: 0,
            tag,
        })
    }

    /// Insert an object currently described by `objects`. The caller owns
    /// keeping the mirror in sync; the tree only reads geometry from it.
    pub fn insert(&mut self, id: ObjectId, objects: &ObjectMirror, now: Time) {
        debug_assert!(!self.leaf_of.contains_key(&id), "double insert of {id}");
        let center = match objects.get(id) {
            Some(st) => st.center_at(now),
            None => return,
        };
        let leaf = match self.root {
            None => {
                let leaf = self.new_leaf(Vec::new(), None);
                self.root = Some(leaf);
                leaf
            }
            Some(root) => self.choose_leaf(root, center),
        };
        match &mut self.node_mut(leaf).kind {
            NodeKind::Leaf(members) => members.push(id),
            NodeKind::Interior(_) => unreachable!("choose_leaf returned interior"),
        }
        self.leaf_of.insert(id, leaf);
        self.reaggregate_path(leaf, objects, now);
        self.split_if_overflowing(leaf, objects, now);
    }

    fn choose_leaf(&self, mut at: NodeId, center: Vector3) -> NodeId {
        loop {
            let node = self.node(at).expect("descent through live nodes");
            match &node.kind {
                NodeKind::Leaf(_) => return at,
                NodeKind::Interior(children) => {
                    // Least-enlargement child; ties break toward the tighter
                    // bound.
                    let mut best: Option<(NodeId, f32, f32)> = None;
                    for &child in children {
                        let b = self.node(child).expect("live child").bound;
                        let merged = b.merged(&BoundingSphere::new(center, 0.0));
                        let enlargement = merged.radius - b.radius;
                        let better = match best {
                            None => true,
                            Some((_, e, r)) => {
                                enlargement < e || (enlargement == e && b.radius < r)
                            }
                        };
                        if better {
                            best = Some((child, enlargement, b.radius));
                        }
                    }
                    at = best.expect("interior node has children").0;
                }
            }
        }
    }

    pub fn remove(&mut self, id: ObjectId, objects: &ObjectMirror, now: Time) {
        let Some(leaf) = self.leaf_of.remove(&id) else {
            return;
        };
        match &mut self.node_mut(leaf).kind {
            NodeKind::Leaf(members) => members.retain(|m| *m != id),
            NodeKind::Interior(_) => unreachable!("leaf_of mapped to interior"),
        }
        self.condense(leaf, objects, now);
    }

    /// Remove empty nodes upward, collapse single-child roots, and
    /// re-aggregate whatever survives.
    fn condense(&mut self, from: NodeId, objects: &ObjectMirror, now: Time) {
        let mut at = from;
        loop {
            let node = self.node(at).expect("condense over live nodes");
            let empty = match &node.kind {
                NodeKind::Leaf(members) => members.is_empty(),
                NodeKind::Interior(children) => children.is_empty(),
            };
            let parent = node.parent;
            if !empty {
                self.reaggregate_path(at, objects, now);
                break;
            }
            match parent {
                Some(p) => {
                    if let NodeKind::Interior(children) = &mut self.node_mut(p).kind {
                        children.retain(|c| *c != at);
                    }
                    self.release(at);
                    at = p;
                }
                None => {
                    self.release(at);
                    self.root = None;
                    return;
                }
            }
        }
        // Collapse interior roots left with a single child.
        while let Some(root) = self.root {
            let node = self.node(root).expect("live root");
            let only = match &node.kind {
                NodeKind::Interior(children) if children.len() == 1 => Some(children[0]),
                _ => None,
            };
            match only {
                Some(child) => {
                    self.node_mut(child).parent = None;
                    self.release(root);
                    self.root = Some(child);
                }
                None => break,
            }
        }
    }

    /// Relocate an object whose geometry changed.
    pub fn relocate(&mut self, id: ObjectId, objects: &ObjectMirror, now: Time) {
        if self.leaf_of.contains_key(&id) {
            self.remove(id, objects, now);
            self.insert(id, objects, now);
        }
    }

    fn split_if_overflowing(&mut self, id: NodeId, objects: &ObjectMirror, now: Time) {
        let (len, is_leaf) = {
            let node = self.node(id).expect("live node");
            match &node.kind {
                NodeKind::Leaf(m) => (m.len(), true),
                NodeKind::Interior(c) => (c.len(), false),
            }
        };
        if len <= self.branching {
            return;
        }

        // Quadratic-lite split: seed with the farthest pair of member
        // centers, assign the rest to the nearer seed.
        let centers: Vec<(usize, Vector3)> = if is_leaf {
            let NodeKind::Leaf(members) = &self.node(id).expect("live").kind else {
                unreachable!()
            };
            members
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let c = objects
                        .get(*m)
                        .map(|st| st.center_at(now))
                        .unwrap_or_default();
                    (i, c)
                })
                .collect()
        } else {
            let NodeKind::Interior(children) = &self.node(id).expect("live").kind else {
                unreachable!()
            };
            children
                .iter()
                .enumerate()
                .map(|(i, ch)| (i, self.node(*ch).expect("live child").bound.center))
                .collect()
        };

        let (seed_a, seed_b) = farthest_pair(&centers);
        let mut keep_idx = Vec::new();
        let mut move_idx = Vec::new();
        for (i, c) in centers.iter() {
            if *i == seed_a {
                keep_idx.push(*i);
            } else if *i == seed_b {
                move_idx.push(*i);
            } else {
                let da = c.distance(centers[seed_a].1);
                let db = c.distance(centers[seed_b].1);
                // Balance ties toward the smaller side.
                if da < db || (da == db && keep_idx.len() <= move_idx.len()) {
                    keep_idx.push(*i);
                } else {
                    move_idx.push(*i);
                }
            }
        }

        let sibling = if is_leaf {
            let moved: Vec<ObjectId> = {
                let NodeKind::Leaf(members) = &self.node(id).expect("live").kind else {
                    unreachable!()
                };
                move_idx.iter().map(|i| members[*i]).collect()
            };
            if let NodeKind::Leaf(members) = &mut self.node_mut(id).kind {
                members.retain(|m| !moved.contains(m));
            }
            let sibling = self.new_leaf(moved.clone(), None);
            for m in moved {
                self.leaf_of.insert(m, sibling);
            }
            sibling
        } else {
            let moved: Vec<NodeId> = {
                let NodeKind::Interior(children) = &self.node(id).expect("live").kind else {
                    unreachable!()
                };
                move_idx.iter().map(|i| children[*i]).collect()
            };
            if let NodeKind::Interior(children) = &mut self.node_mut(id).kind {
                children.retain(|c| !moved.contains(c));
            }
            let tag = self.fresh_tag();
            let sibling = self.alloc(RNode {
                parent: None,
                kind: NodeKind::Interior(moved.clone()),
                bound: BoundingSphere::default(),
                max_member: 0.0,
                count: 0,
                tag,
            });
            for ch in moved {
                self.node_mut(ch).parent = Some(sibling);
            }
            sibling
        };

        self.recompute(id, objects, now);
        self.recompute(sibling, objects, now);

        let parent = self.node(id).expect("live").parent;
        match parent {
            None => {
                // Root split: grow the tree by one level.
                let tag = self.fresh_tag();
                let new_root = self.alloc(RNode {
                    parent: None,
                    kind: NodeKind::Interior(vec![id, sibling]),
                    bound: BoundingSphere::default(),
                    max_member: 0.0,
                    count: 0,
                    tag,
                });
                self.node_mut(id).parent = Some(new_root);
                self.node_mut(sibling).parent = Some(new_root);
                self.root = Some(new_root);
                self.recompute(new_root, objects, now);
            }
            Some(parent) => {
                self.node_mut(sibling).parent = Some(parent);
                if let NodeKind::Interior(children) = &mut self.node_mut(parent).kind {
                    children.push(sibling);
                }
                self.reaggregate_path(parent, objects, now);
                self.split_if_overflowing(parent, objects, now);
            }
        }
    }

    /// Recompute one node's cached aggregate from its immediate members.
    fn recompute(&mut self, id: NodeId, objects: &ObjectMirror, now: Time) {
        let (bound, max_member, count) = {
            let node = self.node(id).expect("live node");
            match &node.kind {
                NodeKind::Leaf(members) => {
                    let mut bound: Option<BoundingSphere> = None;
                    let mut max_member = 0.0f32;
                    for m in members {
                        if let Some(st) = objects.get(*m) {
                            let point = BoundingSphere::new(st.center_at(now), 0.0);
                            bound = Some(match bound {
                                None => point,
                                Some(b) => b.merged(&point),
                            });
                            max_member = max_member.max(st.radius());
                        }
                    }
                    (bound.unwrap_or_default(), max_member, members.len())
                }
                NodeKind::Interior(children) => {
                    let mut bound: Option<BoundingSphere> = None;
                    let mut max_member = 0.0f32;
                    let mut count = 0;
                    for ch in children {
                        let c = self.node(*ch).expect("live child");
                        bound = Some(match bound {
                            None => c.bound,
                            Some(b) => b.merged(&c.bound),
                        });
                        max_member = max_member.max(c.max_member);
                        count += c.count;
                    }
                    (bound.unwrap_or_default(), max_member, count)
                }
            }
        };
        let node = self.node_mut(id);
        // Absorb accumulated float error from sphere merging; pruning must
        // stay conservative at the boundary.
        node.bound = BoundingSphere::new(bound.center, bound.radius + bound.radius * 1e-5 + 1e-4);
        node.max_member = max_member;
        node.count = count;
    }

    fn reaggregate_path(&mut self, from: NodeId, objects: &ObjectMirror, now: Time) {
        let mut at = Some(from);
        while let Some(id) = at {
            self.recompute(id, objects, now);
            at = self.node(id).expect("live node").parent;
        }
    }

    /// Bottom-up refresh of every cached aggregate at `now`. Run before
    /// evaluation so velocity drift cannot invalidate pruning.
    pub fn refresh(&mut self, objects: &ObjectMirror, now: Time) {
        if let Some(root) = self.root {
            self.refresh_rec(root, objects, now);
        }
    }

    fn refresh_rec(&mut self, id: NodeId, objects: &ObjectMirror, now: Time) {
        let children: Vec<NodeId> = match &self.node(id).expect("live node").kind {
            NodeKind::Leaf(_) => Vec::new(),
            NodeKind::Interior(c) => c.clone(),
        };
        for ch in children {
            self.refresh_rec(ch, objects, now);
        }
        self.recompute(id, objects, now);
    }

    /// Could any descendant of `id` satisfy `angle` from `position`? Exact
    /// at the node boundary: false only when no member geometry could match.
    pub fn could_match(
        &self,
        id: NodeId,
        position: Vector3,
        angle: SolidAngle,
        prune: PruneKind,
    ) -> bool {
        let node = self.node(id).expect("live node");
        let dist = position.distance(node.bound.center);
        match prune {
            PruneKind::Angle => {
                max_subtendable(dist, node.bound.radius, node.max_member) >= angle.min_ratio()
            }
            PruneKind::Distance => {
                let s = angle.min_ratio();
                if s == 0.0 {
                    return true;
                }
                // Any member sits at distance >= dist - bound.radius and has
                // radius <= max_member, so it can only match within
                // max_member / s of the viewpoint.
                dist - node.bound.radius <= node.max_member / s
            }
        }
    }

    /// Pruned descent collecting matching objects.
    pub fn evaluate(
        &self,
        objects: &ObjectMirror,
        query: &Query,
        now: Time,
        prune: PruneKind,
    ) -> AHashSet<ObjectId> {
        let mut out = AHashSet::new();
        let Some(root) = self.root else {
            return out;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !self.could_match(id, query.position, query.angle, prune) {
                continue;
            }
            match &self.node(id).expect("live node").kind {
                NodeKind::Leaf(members) => {
                    for m in members {
                        if let Some(st) = objects.get(*m) {
                            if st.matches(query.position, query.angle, now) {
                                out.insert(*m);
                            }
                        }
                    }
                }
                NodeKind::Interior(children) => stack.extend(children.iter().copied()),
            }
        }
        out
    }

    /// Verify the containment invariant (tests and debug assertions).
    #[cfg(test)]
    pub fn check_invariants(&self, objects: &ObjectMirror, now: Time) {
        if let Some(root) = self.root {
            self.check_rec(root, objects, now);
        }
        for (id, leaf) in self.leaf_of.iter() {
            let node = self.node(*leaf).expect("leaf_of points at live node");
            match &node.kind {
                NodeKind::Leaf(members) => assert!(members.contains(id)),
                NodeKind::Interior(_) => panic!("leaf_of points at interior"),
            }
        }
    }

    #[cfg(test)]
    fn check_rec(&self, id: NodeId, objects: &ObjectMirror, now: Time) {
        let node = self.node(id).expect("live node");
        match &node.kind {
            NodeKind::Leaf(members) => {
                assert_eq!(node.count, members.len());
                for m in members {
                    let st = objects.get(*m).expect("member mirrored");
                    let c = st.center_at(now);
                    assert!(
                        node.bound.contains(&BoundingSphere::new(c, 0.0)),
                        "leaf bound must contain member centers"
                    );
                    assert!(node.max_member >= st.radius());
                }
            }
            NodeKind::Interior(children) => {
                let mut count = 0;
                for ch in children {
                    let c = self.node(*ch).expect("live child");
                    assert_eq!(c.parent, Some(id));
                    assert!(
                        node.bound.contains(&c.bound),
                        "interior bound must contain child bounds"
                    );
                    assert!(node.max_member >= c.max_member);
                    count += c.count;
                    self.check_rec(*ch, objects, now);
                }
                assert_eq!(node.count, count);
            }
        }
    }
}

fn farthest_pair(centers: &[(usize, Vector3)]) -> (usize, usize) {
    let mut best = (centers[0].0, centers[centers.len() - 1].0);
    let mut best_d = -1.0f32;
    for (i, (ia, ca)) in centers.iter().enumerate() {
        for (ib, cb) in centers.iter().skip(i + 1) {
            let d = ca.distance(*cb);
            if d > best_d {
                best_d = d;
                best = (*ia, *ib);
            }
        }
    }
    best
}

/// R-tree handler with angle or distance pruning.
#[derive(Debug)]
pub struct RTreeHandler {
    tree: RTree,
    objects: ObjectMirror,
    queries: QueryRegistry,
    prune: PruneKind,
}

impl RTreeHandler {
    pub fn new(branching: usize, prune: PruneKind) -> Self {
        Self {
            tree: RTree::new(branching),
            objects: ObjectMirror::new(),
            queries: QueryRegistry::new(),
            prune,
        }
    }

    pub fn seeded(cache: &LocationCache, branching: usize, prune: PruneKind) -> Self {
        let mut handler = Self::new(branching, prune);
        handler.objects.seed(cache);
        let ids: Vec<ObjectId> = handler.objects.iter().map(|(id, _)| id).collect();
        for id in ids {
            handler.tree.insert(id, &handler.objects, Time::null());
        }
        handler
    }

}

impl LocationCacheListener for RTreeHandler {
    fn location_connected(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        aggregate: bool,
        _local: bool,
    ) {
        if aggregate {
            return;
        }
        if let Some(entry) = cache.get(id) {
            self.objects.insert(id, ObjState::from_entry(entry));
            self.tree.insert(id, &self.objects, entry.location.time);
        }
    }

    fn location_disconnected(&mut self, id: ObjectId) {
        self.tree.remove(id, &self.objects, Time::null());
        if self.objects.remove(id).is_some() {
            self.queries.evict_object(id);
        }
    }

    fn location_position_updated(
        &mut self,
        _cache: &LocationCache,
        id: ObjectId,
        _old: TimedMotionVector3,
        new: TimedMotionVector3,
    ) {
        if let Some(st) = self.objects.get_mut(id) {
            st.loc = new;
            self.tree.relocate(id, &self.objects, new.time);
        }
    }

    fn location_region_updated(
        &mut self,
        _cache: &LocationCache,
        id: ObjectId,
        _old: BoundingSphere,
        new: BoundingSphere,
    ) {
        if let Some(st) = self.objects.get_mut(id) {
            st.center_offset = new.center;
            st.center_bounds_radius = new.radius;
            let t = st.loc.time;
            self.tree.relocate(id, &self.objects, t);
        }
    }

    fn location_max_size_updated(
        &mut self,
        _cache: &LocationCache,
        id: ObjectId,
        _old: f32,
        new: f32,
    ) {
        if let Some(st) = self.objects.get_mut(id) {
            st.max_size = new;
            let t = st.loc.time;
            self.tree.relocate(id, &self.objects, t);
        }
    }
}

impl QueryHandler for RTreeHandler {
    fn handler_type(&self) -> &'static str {
        match self.prune {
            PruneKind::Angle => "rtree",
            PruneKind::Distance => "rtreedist",
        }
    }

    fn register_query(&mut self, _cache: &LocationCache, query: Query) {
        self.queries.insert(QueryData::fresh(query));
    }

    fn import_query(&mut self, _cache: &LocationCache, state: QueryState) {
        self.queries.insert(QueryData::from_state(state));
    }

    fn unregister_query(&mut self, id: QueryId) -> Option<QueryState> {
        self.queries.remove(id).map(QueryData::into_state)
    }

    fn move_query(&mut self, id: QueryId, position: Vector3, angle: SolidAngle) {
        if let Some(data) = self.queries.get_mut(id) {
            data.query.position = position;
            data.query.angle = angle;
        }
    }

    fn tick(&mut self, _cache: &LocationCache, now: Time) {
        self.tree.refresh(&self.objects, now);
        let Self {
            tree,
            objects,
            queries,
            prune,
        } = self;
        for data in queries.iter_mut() {
            let new = tree.evaluate(objects, &data.query, now, *prune);
            data.commit_results(new);
        }
    }

    fn drain_events(&mut self, id: QueryId) -> Vec<QueryEvent> {
        self.queries.drain_events(id)
    }

    fn contains_query(&self, id: QueryId) -> bool {
        self.queries.contains(id)
    }

    fn query_ids(&self) -> Vec<QueryId> {
        self.queries.ids()
    }

    fn query_count(&self) -> usize {
        self.queries.len()
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn results(&self, id: QueryId) -> Option<&AHashSet<ObjectId>> {
        self.queries.get(id).map(|d| &d.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_cache::CacheEntry;
    use core_motion::MotionVector3;

    fn entry(id: u64, pos: Vector3, radius: f32) -> CacheEntry {
        CacheEntry {
            id: ObjectId::from_index(id),
            location: TimedMotionVector3::new(Time::null(), MotionVector3::stationary(pos)),
            center_offset: Vector3::zero(),
            center_bounds_radius: 0.0,
            max_size: radius,
            mesh: String::new(),
            zernike: None,
            aggregate: false,
            local: true,
        }
    }

    fn populate(n: u64, spread: f32) -> (LocationCache, RTreeHandler) {
        let mut cache = LocationCache::new();
        let mut handler = RTreeHandler::new(4, PruneKind::Angle);
        for i in 0..n {
            // Deterministic scatter.
            let x = ((i * 37) % 100) as f32 / 100.0 * spread;
            let y = ((i * 61) % 100) as f32 / 100.0 * spread;
            let z = ((i * 13) % 100) as f32 / 100.0 * spread;
            let r = 0.5 + ((i * 7) % 10) as f32 / 10.0;
            let e = entry(i, Vector3::new(x, y, z), r);
            cache.connect(e);
            handler.location_connected(&cache, ObjectId::from_index(i), false, true);
        }
        (cache, handler)
    }

    #[test]
    fn invariants_hold_under_inserts_and_removes() {
        let (cache, mut handler) = populate(50, 200.0);
        handler.tree.check_invariants(&handler.objects, Time::null());
        assert_eq!(handler.tree.object_count(), 50);

        for i in (0..50).step_by(3) {
            handler.location_disconnected(ObjectId::from_index(i));
        }
        handler.tree.check_invariants(&handler.objects, Time::null());
        assert_eq!(handler.tree.object_count(), 50 - 17);
        drop(cache);
    }

    #[test]
    fn evaluation_matches_linear_scan() {
        let (cache, mut handler) = populate(80, 300.0);
        let q = Query::new(
            QueryId(1),
            Vector3::new(150.0, 150.0, 150.0),
            SolidAngle::new(0.02),
        );
        handler.register_query(&cache, q);
        handler.tick(&cache, Time::null());

        let tree_results = handler.results(QueryId(1)).unwrap().clone();
        let expected: AHashSet<ObjectId> = handler
            .objects
            .iter()
            .filter(|(_, st)| st.matches(q.position, q.angle, Time::null()))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(tree_results, expected);
        assert!(!expected.is_empty(), "test world should produce matches");
    }

    #[test]
    fn single_add_single_query_scenario() {
        let mut cache = LocationCache::new();
        let mut handler = RTreeHandler::new(DEFAULT_BRANCHING, PruneKind::Angle);
        let a = ObjectId::from_index(1);
        cache.connect(entry(1, Vector3::new(0.0, 0.0, 0.0), 1.0));
        handler.location_connected(&cache, a, false, true);

        let q = QueryId(1);
        handler.register_query(
            &cache,
            Query::new(q, Vector3::new(10.0, 0.0, 0.0), SolidAngle::new(0.2)),
        );
        handler.tick(&cache, Time::null());
        assert_eq!(handler.drain_events(q), vec![QueryEvent::Added { object: a }]);

        let far = TimedMotionVector3::new(
            Time::null(),
            MotionVector3::stationary(Vector3::new(100.0, 0.0, 0.0)),
        );
        cache.update_location(a, far);
        handler.location_position_updated(&cache, a, far, far);
        handler.tick(&cache, Time::null());
        assert_eq!(handler.drain_events(q), vec![QueryEvent::Removed { object: a }]);
    }

    #[test]
    fn distance_prune_agrees_with_angle_prune() {
        let (cache, mut angle) = populate(60, 250.0);
        let mut dist = RTreeHandler::new(4, PruneKind::Distance);
        for (id, st) in angle.objects.iter() {
            dist.objects.insert(id, st.clone());
        }
        let ids: Vec<ObjectId> = dist.objects.iter().map(|(id, _)| id).collect();
        for id in ids {
            dist.tree.insert(id, &dist.objects, Time::null());
        }

        let q = Query::new(QueryId(1), Vector3::new(10.0, 40.0, 70.0), SolidAngle::new(0.05));
        angle.register_query(&cache, q);
        dist.register_query(&cache, q);
        angle.tick(&cache, Time::null());
        dist.tick(&cache, Time::null());
        assert_eq!(
            angle.results(QueryId(1)).unwrap(),
            dist.results(QueryId(1)).unwrap()
        );
    }

    #[test]
    fn zero_theta_matches_everything_including_points() {
        let mut cache = LocationCache::new();
        let mut handler = RTreeHandler::new(4, PruneKind::Angle);
        cache.connect(entry(1, Vector3::new(5.0, 0.0, 0.0), 0.0));
        handler.location_connected(&cache, ObjectId::from_index(1), false, true);

        let q = QueryId(1);
        handler.register_query(&cache, Query::new(q, Vector3::zero(), SolidAngle::new(0.0)));
        handler.tick(&cache, Time::null());
        assert_eq!(handler.results(q).unwrap().len(), 1);

        // With any positive threshold the zero-radius object never matches.
        handler.move_query(q, Vector3::zero(), SolidAngle::new(0.01));
        handler.tick(&cache, Time::null());
        assert_eq!(handler.results(q).unwrap().len(), 0);
    }

    #[test]
    fn synthetic_node_ids_are_marked() {
        assert!(is_node_object_id(node_object_id(1)));
        assert!(!is_node_object_id(ObjectId::from_index(1)));
    }
}
