//! Cut-maintaining R-tree handler.
//!
//! Each query owns a *cut*: the set of tree nodes where its descent
//! currently stops. The cut partitions the indexed world: every object
//! lies under exactly one cut node. Per tick the cut settles in place:
//!
//! * a cut node whose bound could still contain an individually matching
//!   member is *refined* (replaced by its children);
//! * a complete sibling group whose parent could not contain a match is
//!   *coarsened* back into the parent.
//!
//! Both tests are stable within a tick, so settling terminates. Results are
//! then read off the cut: leaves in the cut test members individually;
//! interior cut nodes contribute nothing (no member can match), except in
//! aggregate mode, where an interior cut node whose own bounding blob
//! subtends the threshold surfaces as an imposter result under its
//! synthetic node id.
//!
//! Structural edits (splits, condenses) can orphan node ids held by cuts.
//! Validation at tick start drops dead ids and falls back to `{root}` when
//! the partition is broken, detected in O(cut) via descendant counts. A
//! reset costs one settling pass, never a spurious event: events only ever
//! come from diffing result sets and cut membership.

use crate::common::{ObjState, ObjectMirror, QueryData, QueryRegistry};
use crate::query::{Query, QueryEvent, QueryHandler, QueryId, QueryState};
use crate::rtree::{NodeId, NodeKind, PruneKind, RTree};
use ahash::{AHashMap, AHashSet};
use core_cache::{LocationCache, LocationCacheListener};
use core_motion::{BoundingSphere, ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};

#[derive(Debug, Default)]
struct CutState {
    nodes: AHashSet<NodeId>,
}

#[derive(Debug)]
pub struct RTreeCutHandler {
    tree: RTree,
    objects: ObjectMirror,
    queries: QueryRegistry,
    cuts: AHashMap<QueryId, CutState>,
    with_aggregates: bool,
}

impl RTreeCutHandler {
    pub fn new(branching: usize, with_aggregates: bool) -> Self {
        Self {
            tree: RTree::new(branching),
            objects: ObjectMirror::new(),
            queries: QueryRegistry::new(),
            cuts: AHashMap::new(),
            with_aggregates,
        }
    }

    pub fn seeded(cache: &LocationCache, branching: usize, with_aggregates: bool) -> Self {
        let mut handler = Self::new(branching, with_aggregates);
        handler.objects.seed(cache);
        let ids: Vec<ObjectId> = handler.objects.iter().map(|(id, _)| id).collect();
        for id in ids {
            handler.tree.insert(id, &handler.objects, Time::null());
        }
        handler
    }

    /// Drop dead ids; reset to `{root}` when the survivors no longer
    /// partition the world.
    fn validate_cut(tree: &RTree, cut: &mut CutState) {
        cut.nodes.retain(|id| tree.node(*id).is_some());
        let covered: usize = cut
            .nodes
            .iter()
            .map(|id| tree.node(*id).expect("retained above").count)
            .sum();
        if covered != tree.object_count() {
            cut.nodes.clear();
            if let Some(root) = tree.root() {
                cut.nodes.insert(root);
            }
        }
    }

    /// Settle the cut against the current world: refine where matches could
    /// hide, coarsen where whole sibling groups went quiet.
    fn settle_cut(tree: &RTree, cut: &mut CutState, position: Vector3, angle: SolidAngle) {
        loop {
            let mut changed = false;

            // Refinement sweep.
            let snapshot: Vec<NodeId> = cut.nodes.iter().copied().collect();
            for id in snapshot {
                let node = tree.node(id).expect("validated cut node");
                if let NodeKind::Interior(children) = &node.kind {
                    if tree.could_match(id, position, angle, PruneKind::Angle) {
                        cut.nodes.remove(&id);
                        cut.nodes.extend(children.iter().copied());
                        changed = true;
                    }
                }
            }

            // Coarsening sweep: group by parent, pull complete quiet groups
            // up one level.
            let mut by_parent: AHashMap<NodeId, Vec<NodeId>> = AHashMap::new();
            for id in cut.nodes.iter() {
                if let Some(parent) = tree.node(*id).expect("validated cut node").parent {
                    by_parent.entry(parent).or_default().push(*id);
                }
            }
            for (parent, group) in by_parent {
                let pnode = tree.node(parent).expect("live parent");
                let NodeKind::Interior(children) = &pnode.kind else {
                    continue;
                };
                if group.len() == children.len()
                    && !tree.could_match(parent, position, angle, PruneKind::Angle)
                {
                    for id in &group {
                        cut.nodes.remove(id);
                    }
                    cut.nodes.insert(parent);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Read the result set off a settled cut.
    fn results_from_cut(
        &self,
        cut: &CutState,
        position: Vector3,
        angle: SolidAngle,
        now: Time,
    ) -> AHashSet<ObjectId> {
        let mut out = AHashSet::new();
        for id in cut.nodes.iter() {
            let node = self.tree.node(*id).expect("settled cut node");
            match &node.kind {
                NodeKind::Leaf(members) => {
                    for m in members {
                        if let Some(st) = self.objects.get(*m) {
                            if st.matches(position, angle, now) {
                                out.insert(*m);
                            }
                        }
                    }
                }
                NodeKind::Interior(_) => {
                    if self.with_aggregates {
                        // The subtree holds no individually matching member
                        // (or the cut would have refined), but the combined
                        // blob may still subtend the threshold.
                        let blob = node.bound.radius + node.max_member;
                        let dist = position.distance(node.bound.center);
                        if angle.subtended_by(blob, dist) {
                            out.insert(node.tag);
                        }
                    }
                }
            }
        }
        out
    }

    fn tick_query(&mut self, id: QueryId, now: Time) {
        let Some(data) = self.queries.get(id) else {
            return;
        };
        let (position, angle) = (data.query.position, data.query.angle);

        let mut cut = self.cuts.remove(&id).unwrap_or_default();
        if cut.nodes.is_empty() {
            if let Some(root) = self.tree.root() {
                cut.nodes.insert(root);
            }
        }
        Self::validate_cut(&self.tree, &mut cut);
        let before: AHashSet<NodeId> = cut.nodes.clone();
        Self::settle_cut(&self.tree, &mut cut, position, angle);

        let results = self.results_from_cut(&cut, position, angle, now);

        let data = self.queries.get_mut(id).expect("checked above");
        // Cut movement surfaces as node events, keyed by synthetic ids.
        for exited in before.difference(&cut.nodes) {
            if let Some(node) = self.tree.node(*exited) {
                data.pending.push(QueryEvent::NodeExited { node: node.tag });
            }
        }
        for entered in cut.nodes.difference(&before) {
            let node = self.tree.node(*entered).expect("settled cut node");
            data.pending.push(QueryEvent::NodeEntered { node: node.tag });
        }
        data.commit_results(results);

        self.cuts.insert(id, cut);
    }
}

impl LocationCacheListener for RTreeCutHandler {
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

impl QueryHandler for RTreeCutHandler {
    fn handler_type(&self) -> &'static str {
        if self.with_aggregates {
            "rtreecutagg"
        } else {
            "rtreecut"
        }
    }

    fn register_query(&mut self, _cache: &LocationCache, query: Query) {
        let id = query.id;
        self.queries.insert(QueryData::fresh(query));
        self.cuts.insert(id, CutState::default());
    }

    fn import_query(&mut self, _cache: &LocationCache, state: QueryState) {
        let id = state.query.id;
        self.queries.insert(QueryData::from_state(state));
        // Adopted cuts start at the root of the adopting tree; the next
        // settle refines them without touching the inherited result set.
        self.cuts.insert(id, CutState::default());
    }

    fn unregister_query(&mut self, id: QueryId) -> Option<QueryState> {
        self.cuts.remove(&id);
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
        for id in self.queries.ids() {
            self.tick_query(id, now);
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
