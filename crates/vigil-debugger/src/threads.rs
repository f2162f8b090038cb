//! Thread / thread-group tree reconciliation.
//!
//! The tree mirrors the backend's live thread hierarchy. Each refresh diffs
//! a freshly captured snapshot against the cached tree: nodes matching a
//! still-live backend handle are updated in place (never replaced, so
//! observers keep stable identities), vanished handles are removed
//! recursively, and new handles get new wrapper nodes under their correct
//! parent. Local-variable slots are reused by name across refreshes and
//! carry a `changed` flag so only real value changes propagate.

use std::collections::HashMap;

use vigil_backend::{
    BackendError, DebugBackend, FrameInfo, GroupId, LocalVariable, ThreadId, ThreadInfo,
    ThreadStatus, Value,
};

use crate::classify::ThreadStepState;

/// Stable wrapper identity, unique within one tree for its lifetime.
pub type NodeId = u64;

#[derive(Clone, Debug, PartialEq)]
pub struct TreeSnapshot {
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupSnapshot {
    pub handle: GroupId,
    pub name: String,
    pub groups: Vec<GroupSnapshot>,
    pub threads: Vec<ThreadSnapshot>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadSnapshot {
    pub handle: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub frames: Vec<FrameInfo>,
    pub locals: Vec<LocalVariable>,
}

impl TreeSnapshot {
    /// Walk the backend's live hierarchy. Threads reporting zombie status
    /// are skipped outright; they are gone whether or not a death event
    /// has been delivered yet. Frames and top-frame locals are captured
    /// only when `with_frames` is set (i.e. while stopped).
    pub fn capture(
        backend: &mut dyn DebugBackend,
        with_frames: bool,
    ) -> Result<Self, BackendError> {
        let mut groups = Vec::new();
        for id in backend.top_level_groups()? {
            groups.push(capture_group(backend, id, with_frames)?);
        }
        Ok(Self { groups })
    }
}

fn capture_group(
    backend: &mut dyn DebugBackend,
    group: GroupId,
    with_frames: bool,
) -> Result<GroupSnapshot, BackendError> {
    let info = backend.group_info(group)?;

    let mut threads = Vec::new();
    for thread in info.child_threads {
        let t = backend.thread_info(thread)?;
        if t.status == ThreadStatus::Zombie {
            continue;
        }
        let (frames, locals) = if with_frames {
            let frames = backend.frames(thread)?;
            let locals = if frames.is_empty() {
                Vec::new()
            } else {
                backend.frame_locals(thread, 0).unwrap_or_default()
            };
            (frames, locals)
        } else {
            (Vec::new(), Vec::new())
        };
        threads.push(ThreadSnapshot {
            handle: thread,
            name: t.name,
            status: t.status,
            frames,
            locals,
        });
    }

    let mut groups = Vec::new();
    for child in info.child_groups {
        groups.push(capture_group(backend, child, with_frames)?);
    }

    Ok(GroupSnapshot {
        handle: group,
        name: info.name,
        groups,
        threads,
    })
}

/// One local-variable slot, reused by name across refreshes.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalSlot {
    pub node_id: NodeId,
    pub name: String,
    pub type_name: String,
    pub value: Value,
    /// Set when the value differed from the previous refresh.
    pub changed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadNode {
    pub node_id: NodeId,
    pub handle: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub is_current: bool,
    /// Mirrored from the session's authoritative step-state map at refresh.
    pub step: Option<ThreadStepState>,
    pub frames: Vec<FrameInfo>,
    pub locals: Vec<LocalSlot>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupNode {
    pub node_id: NodeId,
    /// `None` only for the synthetic root.
    pub handle: Option<GroupId>,
    pub name: String,
    pub groups: Vec<GroupNode>,
    pub threads: Vec<ThreadNode>,
}

impl GroupNode {
    fn find_thread(&self, handle: ThreadId) -> Option<&ThreadNode> {
        self.threads
            .iter()
            .find(|t| t.handle == handle)
            .or_else(|| self.groups.iter().find_map(|g| g.find_thread(handle)))
    }

    fn find_thread_mut(&mut self, handle: ThreadId) -> Option<&mut ThreadNode> {
        if let Some(idx) = self.threads.iter().position(|t| t.handle == handle) {
            return self.threads.get_mut(idx);
        }
        self.groups
            .iter_mut()
            .find_map(|g| g.find_thread_mut(handle))
    }

    fn for_each_thread_mut(&mut self, f: &mut impl FnMut(&mut ThreadNode)) {
        for thread in &mut self.threads {
            f(thread);
        }
        for group in &mut self.groups {
            group.for_each_thread_mut(f);
        }
    }

    fn collect_threads<'a>(&'a self, out: &mut Vec<&'a ThreadNode>) {
        out.extend(self.threads.iter());
        for group in &self.groups {
            group.collect_threads(out);
        }
    }
}

pub struct ThreadTree {
    next_node: NodeId,
    root: GroupNode,
}

impl ThreadTree {
    pub fn new() -> Self {
        Self {
            next_node: 2,
            root: GroupNode {
                node_id: 1,
                handle: None,
                name: "system".to_string(),
                groups: Vec::new(),
                threads: Vec::new(),
            },
        }
    }

    pub fn root(&self) -> &GroupNode {
        &self.root
    }

    pub fn find_thread(&self, handle: ThreadId) -> Option<&ThreadNode> {
        self.root.find_thread(handle)
    }

    pub fn find_thread_mut(&mut self, handle: ThreadId) -> Option<&mut ThreadNode> {
        self.root.find_thread_mut(handle)
    }

    /// All thread wrappers, preorder.
    pub fn threads(&self) -> Vec<&ThreadNode> {
        let mut out = Vec::new();
        self.root.collect_threads(&mut out);
        out
    }

    pub fn for_each_thread_mut(&mut self, mut f: impl FnMut(&mut ThreadNode)) {
        self.root.for_each_thread_mut(&mut f);
    }

    /// Mark one thread as the current debug context, clearing the rest.
    pub fn set_current(&mut self, handle: Option<ThreadId>) {
        self.for_each_thread_mut(|t| t.is_current = Some(t.handle) == handle);
    }

    /// Insert a wrapper for a thread first observed via an event, before
    /// any reconciliation pass has seen it. It lands under the root and
    /// moves to its real group on the next refresh.
    pub fn adopt(&mut self, info: ThreadInfo) -> NodeId {
        if let Some(existing) = self.root.find_thread(info.id) {
            return existing.node_id;
        }
        let node_id = self.alloc();
        self.root.threads.push(ThreadNode {
            node_id,
            handle: info.id,
            name: info.name,
            status: info.status,
            is_current: false,
            step: None,
            frames: Vec::new(),
            locals: Vec::new(),
        });
        node_id
    }

    pub fn remove_thread(&mut self, handle: ThreadId) {
        fn remove_in(group: &mut GroupNode, handle: ThreadId) {
            group.threads.retain(|t| t.handle != handle);
            for child in &mut group.groups {
                remove_in(child, handle);
            }
        }
        remove_in(&mut self.root, handle);
    }

    pub fn clear(&mut self) {
        self.root.groups.clear();
        self.root.threads.clear();
    }

    /// Reconcile the cached tree against a fresh snapshot.
    pub fn refresh(&mut self, snapshot: &TreeSnapshot) {
        // Event-adopted strays directly under the root move into the group
        // the snapshot places them in, wrapper identity intact. Strays the
        // snapshot no longer reports are gone from the backend and drop.
        let mut strays: HashMap<ThreadId, ThreadNode> = std::mem::take(&mut self.root.threads)
            .into_iter()
            .map(|t| (t.handle, t))
            .collect();

        let old_groups = std::mem::take(&mut self.root.groups);
        self.root.groups = self.reconcile_groups(old_groups, &snapshot.groups, &mut strays);
    }

    fn alloc(&mut self) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        id
    }

    fn reconcile_groups(
        &mut self,
        old: Vec<GroupNode>,
        snaps: &[GroupSnapshot],
        strays: &mut HashMap<ThreadId, ThreadNode>,
    ) -> Vec<GroupNode> {
        let mut by_handle: HashMap<GroupId, GroupNode> = old
            .into_iter()
            .filter_map(|g| g.handle.map(|h| (h, g)))
            .collect();

        let mut out = Vec::with_capacity(snaps.len());
        for snap in snaps {
            let mut node = match by_handle.remove(&snap.handle) {
                Some(node) => node,
                None => GroupNode {
                    node_id: self.alloc(),
                    handle: Some(snap.handle),
                    name: snap.name.clone(),
                    groups: Vec::new(),
                    threads: Vec::new(),
                },
            };
            node.name.clone_from(&snap.name);
            let old_groups = std::mem::take(&mut node.groups);
            node.groups = self.reconcile_groups(old_groups, &snap.groups, strays);
            let old_threads = std::mem::take(&mut node.threads);
            node.threads = self.reconcile_threads(old_threads, &snap.threads, strays);
            out.push(node);
        }
        // Anything left in `by_handle` vanished from the backend and drops
        // here, children included.
        out
    }

    fn reconcile_threads(
        &mut self,
        old: Vec<ThreadNode>,
        snaps: &[ThreadSnapshot],
        strays: &mut HashMap<ThreadId, ThreadNode>,
    ) -> Vec<ThreadNode> {
        let mut by_handle: HashMap<ThreadId, ThreadNode> =
            old.into_iter().map(|t| (t.handle, t)).collect();

        let mut out = Vec::with_capacity(snaps.len());
        for snap in snaps {
            let node = match by_handle
                .remove(&snap.handle)
                .or_else(|| strays.remove(&snap.handle))
            {
                Some(mut node) => {
                    node.name.clone_from(&snap.name);
                    node.status = snap.status;
                    node.frames.clone_from(&snap.frames);
                    let old_locals = std::mem::take(&mut node.locals);
                    node.locals = self.reconcile_locals(old_locals, &snap.locals);
                    node
                }
                None => {
                    let node_id = self.alloc();
                    ThreadNode {
                        node_id,
                        handle: snap.handle,
                        name: snap.name.clone(),
                        status: snap.status,
                        is_current: false,
                        step: None,
                        frames: snap.frames.clone(),
                        locals: snap
                            .locals
                            .iter()
                            .map(|var| {
                                let node_id = self.alloc();
                                LocalSlot {
                                    node_id,
                                    name: var.name.clone(),
                                    type_name: var.type_name.clone(),
                                    value: var.value.clone(),
                                    changed: false,
                                }
                            })
                            .collect(),
                    }
                }
            };
            out.push(node);
        }
        out
    }

    fn reconcile_locals(&mut self, old: Vec<LocalSlot>, vars: &[LocalVariable]) -> Vec<LocalSlot> {
        let mut by_name: HashMap<String, LocalSlot> =
            old.into_iter().map(|s| (s.name.clone(), s)).collect();

        let mut out = Vec::with_capacity(vars.len());
        for var in vars {
            let slot = match by_name.remove(&var.name) {
                Some(mut slot) => {
                    slot.changed = slot.value != var.value;
                    slot.type_name.clone_from(&var.type_name);
                    slot.value = var.value.clone();
                    slot
                }
                None => {
                    let node_id = self.alloc();
                    LocalSlot {
                        node_id,
                        name: var.name.clone(),
                        type_name: var.type_name.clone(),
                        value: var.value.clone(),
                        changed: false,
                    }
                }
            };
            out.push(slot);
        }
        out
    }
}

impl Default for ThreadTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Display label for a thread's status column.
pub fn status_label(status: ThreadStatus) -> &'static str {
    match status {
        ThreadStatus::Running => "running",
        ThreadStatus::Suspended => "suspended",
        ThreadStatus::AtBreakpoint => "at breakpoint",
        ThreadStatus::Zombie => "zombie",
        ThreadStatus::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(handle: ThreadId, name: &str) -> ThreadSnapshot {
        ThreadSnapshot {
            handle,
            name: name.to_string(),
            status: ThreadStatus::Running,
            frames: Vec::new(),
            locals: Vec::new(),
        }
    }

    fn group(
        handle: GroupId,
        name: &str,
        groups: Vec<GroupSnapshot>,
        threads: Vec<ThreadSnapshot>,
    ) -> GroupSnapshot {
        GroupSnapshot {
            handle,
            name: name.to_string(),
            groups,
            threads,
        }
    }

    /// Structure projection that forgets wrapper identities, for
    /// equivalence checks between incrementally refreshed and freshly
    /// built trees.
    #[derive(Debug, PartialEq)]
    struct Shape {
        handle: Option<GroupId>,
        name: String,
        threads: Vec<(ThreadId, String)>,
        groups: Vec<Shape>,
    }

    fn shape(node: &GroupNode) -> Shape {
        Shape {
            handle: node.handle,
            name: node.name.clone(),
            threads: node
                .threads
                .iter()
                .map(|t| (t.handle, t.name.clone()))
                .collect(),
            groups: node.groups.iter().map(shape).collect(),
        }
    }

    #[test]
    fn incremental_refresh_equals_fresh_build() {
        let s1 = TreeSnapshot {
            groups: vec![group(
                1,
                "main",
                vec![group(2, "workers", vec![], vec![thread(10, "w1"), thread(11, "w2")])],
                vec![thread(1, "main")],
            )],
        };
        let s2 = TreeSnapshot {
            groups: vec![group(
                1,
                "main",
                vec![
                    group(2, "workers", vec![], vec![thread(11, "w2"), thread(12, "w3")]),
                    group(3, "io", vec![], vec![thread(20, "io-1")]),
                ],
                vec![thread(1, "main")],
            )],
        };

        let mut incremental = ThreadTree::new();
        incremental.refresh(&s1);
        incremental.refresh(&s2);

        let mut fresh = ThreadTree::new();
        fresh.refresh(&s2);

        assert_eq!(shape(incremental.root()), shape(fresh.root()));
    }

    #[test]
    fn surviving_nodes_keep_their_identity() {
        let s1 = TreeSnapshot {
            groups: vec![group(1, "main", vec![], vec![thread(1, "main"), thread(2, "aux")])],
        };
        let s2 = TreeSnapshot {
            groups: vec![group(1, "main", vec![], vec![thread(1, "main"), thread(3, "new")])],
        };

        let mut tree = ThreadTree::new();
        tree.refresh(&s1);
        let main_id = tree.find_thread(1).unwrap().node_id;
        let aux_id = tree.find_thread(2).unwrap().node_id;

        tree.refresh(&s2);
        assert_eq!(tree.find_thread(1).unwrap().node_id, main_id);
        assert!(tree.find_thread(2).is_none());
        let new_id = tree.find_thread(3).unwrap().node_id;
        assert_ne!(new_id, aux_id);
        assert_ne!(new_id, main_id);
    }

    #[test]
    fn updates_happen_in_place_not_by_replacement() {
        let mut s = TreeSnapshot {
            groups: vec![group(1, "main", vec![], vec![thread(1, "old-name")])],
        };
        let mut tree = ThreadTree::new();
        tree.refresh(&s);
        let node_id = tree.find_thread(1).unwrap().node_id;

        s.groups[0].threads[0].name = "renamed".to_string();
        s.groups[0].threads[0].status = ThreadStatus::Suspended;
        tree.refresh(&s);

        let node = tree.find_thread(1).unwrap();
        assert_eq!(node.node_id, node_id);
        assert_eq!(node.name, "renamed");
        assert_eq!(node.status, ThreadStatus::Suspended);
    }

    #[test]
    fn locals_are_reused_by_name_and_flag_changes() {
        let locals_v1 = vec![
            LocalVariable {
                name: "count".to_string(),
                type_name: "int".to_string(),
                value: Value::Int(1),
            },
            LocalVariable {
                name: "done".to_string(),
                type_name: "boolean".to_string(),
                value: Value::Boolean(false),
            },
        ];
        let mut snap = TreeSnapshot {
            groups: vec![group(1, "main", vec![], vec![ThreadSnapshot {
                frames: vec![FrameInfo {
                    class_name: "Foo".to_string(),
                    method_name: "run".to_string(),
                    line: 3,
                }],
                locals: locals_v1,
                ..thread(1, "main")
            }])],
        };

        let mut tree = ThreadTree::new();
        tree.refresh(&snap);
        let slots: Vec<_> = tree.find_thread(1).unwrap().locals.clone();
        assert!(slots.iter().all(|s| !s.changed));

        // Only `count` changes value.
        snap.groups[0].threads[0].locals[0].value = Value::Int(2);
        tree.refresh(&snap);

        let node = tree.find_thread(1).unwrap();
        let count = node.locals.iter().find(|s| s.name == "count").unwrap();
        let done = node.locals.iter().find(|s| s.name == "done").unwrap();
        assert!(count.changed);
        assert_eq!(count.value, Value::Int(2));
        assert!(!done.changed);
        // Identities survive the refresh.
        assert_eq!(count.node_id, slots[0].node_id);
        assert_eq!(done.node_id, slots[1].node_id);
    }

    #[test]
    fn groups_vanish_recursively() {
        let s1 = TreeSnapshot {
            groups: vec![group(
                1,
                "main",
                vec![group(2, "pool", vec![], vec![thread(10, "p1")])],
                vec![],
            )],
        };
        let s2 = TreeSnapshot {
            groups: vec![group(1, "main", vec![], vec![])],
        };

        let mut tree = ThreadTree::new();
        tree.refresh(&s1);
        assert!(tree.find_thread(10).is_some());
        tree.refresh(&s2);
        assert!(tree.find_thread(10).is_none());
        assert!(tree.root().groups[0].groups.is_empty());
    }

    #[test]
    fn capture_skips_zombie_threads() {
        use vigil_backend::MockBackend;

        let (mut backend, vm) = MockBackend::new();
        let main = vm.add_group(None, "main");
        let live = vm.add_thread(main, "live");
        let dead = vm.add_thread(main, "dead");
        vm.set_thread_status(dead, ThreadStatus::Zombie);

        let snapshot = TreeSnapshot::capture(&mut backend, false).unwrap();
        let threads: Vec<ThreadId> = snapshot.groups[0].threads.iter().map(|t| t.handle).collect();
        assert_eq!(threads, vec![live]);
    }

    #[test]
    fn adopted_stray_moves_to_its_group_on_refresh() {
        let mut tree = ThreadTree::new();
        let adopted = tree.adopt(ThreadInfo {
            id: 7,
            name: "event-first".to_string(),
            status: ThreadStatus::Running,
        });
        assert_eq!(tree.root().threads.len(), 1);

        let snap = TreeSnapshot {
            groups: vec![group(1, "main", vec![], vec![thread(7, "event-first")])],
        };
        tree.refresh(&snap);
        assert!(tree.root().threads.is_empty());
        let node = &tree.root().groups[0].threads[0];
        assert_eq!(node.handle, 7);
        // The wrapper moved into the group; it was not replaced.
        assert_eq!(node.node_id, adopted);
    }
}
