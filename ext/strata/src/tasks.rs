//! Logical stacks for cooperative tasks.
//!
//! A thread running an event loop has one physical stack, but many suspended
//! tasks. The [`TaskGraph`] keeps the parent/child relations that the event
//! source reports (a task gathering or waiting on others) and, at sample time,
//! combines them with the tasks' own awaiting pointers to render one stack per
//! leaf task. Tasks nobody announced are picked up from the runtime's task
//! collections or from the links that name them.
//!
//! Nodes live in a map keyed by task identity; edges are id sets on both ends.
//! An edge is only removed when its child completes, and a completed node is
//! dropped once it has no edges left and was not rendered in the current cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::runtime::{LoopId, Runtime, TaskContainer, TaskId, TaskState, ThreadId};
use crate::sample::Frame;
use crate::walker::{FrameWalker, WalkedFrame};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub loop_id: LoopId,
    pub name: String,
}

impl TaskDescriptor {
    pub fn new(id: TaskId, loop_id: LoopId, name: impl Into<String>) -> Self {
        Self {
            id,
            loop_id,
            name: name.into(),
        }
    }
}

/// A stack ready to be recorded, innermost frame first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedStack {
    pub task_id: Option<TaskId>,
    pub on_cpu: bool,
    pub frames: Vec<Frame>,
}

impl RenderedStack {
    pub fn physical(frames: &[WalkedFrame]) -> Self {
        Self {
            task_id: None,
            on_cpu: true,
            frames: frames.iter().map(|w| w.frame.clone()).collect(),
        }
    }
}

/// Consecutive failed reads after which a task is treated as gone.
const MAX_READ_FAILURES: u8 = 3;

#[derive(Debug)]
struct TaskNode {
    /// Unknown for tasks first seen through a link, until the runtime reports it.
    loop_id: Option<LoopId>,
    name: Option<String>,
    completed: bool,
    created: u64,
    children: BTreeSet<TaskId>,
    /// Parent id to the sequence number of the link, for earliest-first lookup.
    parents: BTreeMap<TaskId, u64>,
    last_rendered: Option<u64>,
    read_failures: u8,
}

impl TaskNode {
    fn new(loop_id: Option<LoopId>, name: Option<String>, created: u64) -> Self {
        Self {
            loop_id,
            name: name.filter(|name| !name.is_empty()),
            completed: false,
            created,
            children: BTreeSet::new(),
            parents: BTreeMap::new(),
            last_rendered: None,
            read_failures: 0,
        }
    }

    fn boundary(&self, task: TaskId) -> Frame {
        match &self.name {
            Some(name) => Frame::task_boundary(name.as_str()),
            None => Frame::task_boundary(format!("Task-{:#x}", task)),
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskGraph {
    loops: HashMap<ThreadId, LoopId>,
    running: HashMap<LoopId, TaskId>,
    nodes: HashMap<TaskId, TaskNode>,
    containers: Vec<TaskContainer>,
    sequence: u64,
    cycle: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn register_loop(&mut self, thread_id: ThreadId, loop_id: LoopId) {
        log::debug!("Thread {} runs event loop {:#x}", thread_id, loop_id);
        self.loops.insert(thread_id, loop_id);
    }

    pub fn loop_for(&self, thread_id: ThreadId) -> Option<LoopId> {
        self.loops.get(&thread_id).copied()
    }

    pub fn task_created(&mut self, task: TaskDescriptor) {
        if let Some(existing) = self.nodes.get_mut(&task.id) {
            if !existing.completed {
                existing.loop_id = Some(task.loop_id);
                if !task.name.is_empty() {
                    existing.name = Some(task.name);
                }
                return;
            }
            // the identity was recycled for a new task
            self.detach_node(task.id);
        }
        let created = self.next_sequence();
        self.nodes
            .insert(task.id, TaskNode::new(Some(task.loop_id), Some(task.name), created));
    }

    /// Starts tracking a task first heard of through a link.
    fn adopt(&mut self, task: TaskId, loop_id: Option<LoopId>) {
        if let Some(node) = self.nodes.get_mut(&task) {
            if !node.completed {
                node.loop_id = node.loop_id.or(loop_id);
                return;
            }
            self.detach_node(task);
        }
        let created = self.next_sequence();
        self.nodes.insert(task, TaskNode::new(loop_id, None, created));
    }

    /// Records that `parent` waits on `child`. Linking twice keeps one edge.
    ///
    /// Tasks not seen before are adopted; a gathered child runs on its
    /// parent's loop, so a known end lends its loop to the other. A completed
    /// task named again is a new task reusing the identity.
    pub fn link(&mut self, parent: TaskId, child: TaskId) {
        if parent == child {
            return;
        }
        let known_loop = |graph: &Self, id| {
            graph
                .nodes
                .get(&id)
                .filter(|n| !n.completed)
                .and_then(|n| n.loop_id)
        };
        let loop_id = known_loop(self, parent).or_else(|| known_loop(self, child));
        self.adopt(parent, loop_id);
        self.adopt(child, loop_id);

        let sequence = self.next_sequence();
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.entry(parent).or_insert(sequence);
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.insert(child);
        }
    }

    pub fn enter_task(&mut self, loop_id: LoopId, task: TaskId) {
        self.running.insert(loop_id, task);
    }

    pub fn leave_task(&mut self, loop_id: LoopId, task: TaskId) {
        if self.running.get(&loop_id) == Some(&task) {
            self.running.remove(&loop_id);
        }
    }

    pub fn running_task(&self, loop_id: LoopId) -> Option<TaskId> {
        self.running.get(&loop_id).copied()
    }

    pub fn task_done(&mut self, task: TaskId) {
        let Some(node) = self.nodes.get_mut(&task) else {
            return;
        };
        node.completed = true;
        let loop_id = node.loop_id;
        let parents: Vec<TaskId> = std::mem::take(&mut node.parents).into_keys().collect();
        for parent in parents {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.remove(&task);
            }
        }
        if let Some(loop_id) = loop_id {
            self.leave_task(loop_id, task);
        }
    }

    /// Seeds the graph with tasks that existed before tracking began.
    pub fn bulk_import(&mut self, running: &[(LoopId, TaskId)], scheduled: Vec<TaskDescriptor>, eager: Vec<TaskDescriptor>) {
        for task in scheduled.into_iter().chain(eager) {
            self.task_created(task);
        }
        for &(loop_id, task) in running {
            if self.nodes.contains_key(&task) {
                self.enter_task(loop_id, task);
            }
        }
    }

    /// Adds a runtime task collection that [`discover`](Self::discover) re-reads.
    pub fn watch(&mut self, container: TaskContainer) {
        if !self.containers.contains(&container) {
            log::debug!("Watching tasks in {:?}", container);
            self.containers.push(container);
        }
    }

    /// Picks up live tasks from the watched collections that no event
    /// announced. Called once per sampling cycle.
    pub fn discover(&mut self, runtime: &dyn Runtime) {
        let mut found = Vec::new();
        for &container in &self.containers {
            match runtime.container_tasks(container) {
                Ok(tasks) => found.extend(tasks),
                Err(e) => log::trace!("Cannot list tasks in {:#x}: {}", container.address(), e),
            }
        }
        for id in found {
            if self.nodes.get(&id).map_or(false, |n| !n.completed && n.loop_id.is_some()) {
                continue;
            }
            let Ok(state) = runtime.task(id) else {
                continue;
            };
            if state.done {
                continue;
            }
            if let Some(loop_id) = state.loop_id {
                log::trace!("Discovered task {:#x} on loop {:#x}", id, loop_id);
                self.task_created(TaskDescriptor::new(id, loop_id, state.name.unwrap_or_default()));
            }
        }
    }

    fn detach_node(&mut self, task: TaskId) {
        let Some(node) = self.nodes.remove(&task) else {
            return;
        };
        for parent in node.parents.keys() {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.remove(&task);
            }
        }
        for child in &node.children {
            if let Some(child) = self.nodes.get_mut(child) {
                child.parents.remove(&task);
            }
        }
    }

    /// Drops completed tasks that no longer matter. Called once per sampling cycle.
    pub fn prune(&mut self) {
        let cycle = self.cycle;
        let before = self.nodes.len();
        self.nodes.retain(|_, node| {
            !(node.completed && node.children.is_empty() && node.parents.is_empty() && node.last_rendered != Some(cycle))
        });
        let pruned = before - self.nodes.len();
        if pruned > 0 {
            log::trace!("Pruned {} completed tasks", pruned);
        }
        self.cycle += 1;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.children.len()).sum()
    }

    /// Reads the live tasks of `loop_id`. Finished tasks are completed, and
    /// so are tasks that could not be read several cycles in a row.
    fn read_states(&mut self, loop_id: LoopId, runtime: &dyn Runtime) -> HashMap<TaskId, TaskState> {
        let mut states: HashMap<TaskId, TaskState> = HashMap::new();
        let mut finished = Vec::new();
        let mut failed = Vec::new();
        for (&id, node) in &self.nodes {
            if node.completed || node.loop_id.map_or(false, |l| l != loop_id) {
                continue;
            }
            match runtime.task(id) {
                Ok(state) if state.done => finished.push(id),
                Ok(state) => {
                    states.insert(id, state);
                }
                Err(e) => {
                    log::trace!("Cannot read task {:#x}: {}", id, e);
                    failed.push(id);
                }
            }
        }
        for id in failed {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.read_failures += 1;
                if node.read_failures >= MAX_READ_FAILURES {
                    log::debug!("Task {:#x} is no longer readable", id);
                    finished.push(id);
                }
            }
        }
        for id in finished {
            self.task_done(id);
        }

        let nodes = &mut self.nodes;
        states.retain(|id, state| {
            let Some(node) = nodes.get_mut(id) else {
                return false;
            };
            node.read_failures = 0;
            if node.name.is_none() {
                node.name = state.name.take().filter(|name| !name.is_empty());
            }
            if node.loop_id.is_none() {
                node.loop_id = state.loop_id;
            }
            node.loop_id == Some(loop_id)
        });
        states
    }

    /// Renders the logical stacks of the loop running on `thread_id`.
    ///
    /// `physical` is the thread's interpreter stack, innermost first. Threads
    /// without a loop, or loops without live tasks, get `physical` back as is.
    pub fn render(&mut self, thread_id: ThreadId, physical: &[WalkedFrame], walker: &mut FrameWalker) -> Vec<RenderedStack> {
        let Some(loop_id) = self.loop_for(thread_id) else {
            return vec![RenderedStack::physical(physical)];
        };

        let runtime = Arc::clone(walker.runtime());
        let states = self.read_states(loop_id, runtime.as_ref());
        if states.is_empty() {
            return vec![RenderedStack::physical(physical)];
        }

        // Without enter/leave events the running task is the one whose
        // coroutine is on the thread's stack.
        let on_stack = |state: &TaskState| {
            state
                .coroutine
                .first()
                .map_or(false, |outer| physical.iter().any(|w| w.frame_ref == *outer))
        };
        let running = self
            .running_task(loop_id)
            .filter(|id| states.contains_key(id))
            .or_else(|| states.iter().find(|(_, state)| on_stack(state)).map(|(&id, _)| id));

        // Frames of the running task are the innermost part of the physical
        // stack, down to the outermost frame of its coroutine chain.
        let split = running
            .and_then(|id| states[&id].coroutine.first().copied())
            .and_then(|outer| physical.iter().position(|w| w.frame_ref == outer))
            .map_or(0, |index| index + 1);
        let (running_frames, scheduler_frames) = physical.split_at(split);

        let mut waiters: HashMap<TaskId, TaskId> = HashMap::new();
        for (&id, state) in &states {
            if let Some(awaited) = state.awaiting.filter(|a| states.contains_key(a)) {
                waiters.entry(awaited).or_insert(id);
            }
        }

        let mut leaves: Vec<TaskId> = states
            .iter()
            .filter(|(id, state)| {
                let awaits_task = state.awaiting.map_or(false, |a| states.contains_key(&a));
                let has_live_children = self.nodes[*id].children.iter().any(|c| states.contains_key(c));
                !awaits_task && !has_live_children
            })
            .map(|(&id, _)| id)
            .collect();
        leaves.sort_by_key(|id| self.nodes[id].created);

        let mut stacks = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let mut frames: Vec<Frame> = Vec::new();
            let mut visited = HashSet::new();
            let mut current = leaf;
            loop {
                visited.insert(current);
                if Some(current) == running {
                    frames.extend(running_frames.iter().map(|w| w.frame.clone()));
                } else {
                    for &frame in states[&current].coroutine.iter().rev() {
                        match walker.resolve_frame(frame) {
                            Ok(walked) => frames.push(walked.frame),
                            Err(e) => log::trace!("Cannot resolve coroutine frame: {}", e),
                        }
                    }
                }
                if let Some(node) = self.nodes.get_mut(&current) {
                    frames.push(node.boundary(current));
                    node.last_rendered = Some(self.cycle);
                }
                match self.awaiter_of(current, &states, &waiters, running, &visited) {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            frames.extend(scheduler_frames.iter().map(|w| w.frame.clone()));
            stacks.push(RenderedStack {
                task_id: Some(leaf),
                on_cpu: running.map_or(false, |id| visited.contains(&id)),
                frames,
            });
        }

        if stacks.is_empty() {
            stacks.push(RenderedStack::physical(physical));
        }
        stacks
    }

    /// The task suspended waiting on `task`: its direct awaiter, or else the
    /// earliest-linked parent that is neither running nor awaiting some other task.
    fn awaiter_of(
        &self,
        task: TaskId,
        states: &HashMap<TaskId, TaskState>,
        waiters: &HashMap<TaskId, TaskId>,
        running: Option<TaskId>,
        visited: &HashSet<TaskId>,
    ) -> Option<TaskId> {
        if let Some(&waiter) = waiters.get(&task) {
            if !visited.contains(&waiter) && Some(waiter) != running {
                return Some(waiter);
            }
        }
        let node = self.nodes.get(&task)?;
        let mut parents: Vec<(u64, TaskId)> = node.parents.iter().map(|(&p, &seq)| (seq, p)).collect();
        parents.sort_unstable();
        parents.into_iter().map(|(_, p)| p).find(|parent| {
            let Some(state) = states.get(parent) else {
                return false;
            };
            let awaits_other = state
                .awaiting
                .map_or(false, |a| a != task && states.contains_key(&a));
            !visited.contains(parent) && Some(*parent) != running && !awaits_other
        })
    }

    #[cfg(test)]
    fn has_task(&self, task: TaskId) -> bool {
        self.nodes.contains_key(&task)
    }
}
