//! Logical stacks for greenlets.
//!
//! A greenlet keeps its frames while switched out. The host reports creation,
//! switches and the frame each greenlet left behind, so at sample time the
//! active greenlet of a thread owns the physical stack and every other
//! greenlet is rendered from its saved frame, followed by its parents.

use std::collections::{HashMap, HashSet};

use crate::runtime::{FrameRef, ThreadId};
use crate::sample::Frame;
use crate::tasks::RenderedStack;
use crate::walker::{FrameWalker, WalkedFrame};

/// Address of a greenlet object.
pub type GreenletId = u64;

const MAX_GREENLETS: usize = 1 << 16;

#[derive(Debug)]
struct Greenlet {
    thread_id: ThreadId,
    name: String,
    /// Innermost saved frame while switched out.
    frame: Option<FrameRef>,
    parent: Option<GreenletId>,
    created: u64,
}

#[derive(Debug, Default)]
pub struct GreenletTable {
    greenlets: HashMap<GreenletId, Greenlet>,
    active: HashMap<ThreadId, GreenletId>,
    sequence: u64,
}

impl GreenletTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, greenlet: GreenletId, thread_id: ThreadId, name: &str, frame: Option<FrameRef>) {
        if let Some(existing) = self.greenlets.get_mut(&greenlet) {
            existing.thread_id = thread_id;
            existing.name = name.to_string();
            existing.frame = frame;
            return;
        }
        if self.greenlets.len() >= MAX_GREENLETS {
            log::debug!("Too many greenlets, not tracking {:#x}", greenlet);
            return;
        }
        self.sequence += 1;
        self.greenlets.insert(
            greenlet,
            Greenlet {
                thread_id,
                name: name.to_string(),
                frame,
                parent: None,
                created: self.sequence,
            },
        );
    }

    /// Records the frame `greenlet` was suspended at; `None` once it has nothing saved.
    pub fn update_frame(&mut self, greenlet: GreenletId, frame: Option<FrameRef>) {
        if let Some(existing) = self.greenlets.get_mut(&greenlet) {
            existing.frame = frame;
        }
    }

    /// `parent` resumes when `greenlet` finishes.
    pub fn link(&mut self, greenlet: GreenletId, parent: GreenletId) {
        if greenlet == parent || !self.greenlets.contains_key(&parent) {
            return;
        }
        if let Some(existing) = self.greenlets.get_mut(&greenlet) {
            existing.parent = Some(parent);
        }
    }

    /// `greenlet` now runs on `thread_id`.
    pub fn switch(&mut self, thread_id: ThreadId, greenlet: GreenletId) {
        self.active.insert(thread_id, greenlet);
    }

    pub fn active(&self, thread_id: ThreadId) -> Option<GreenletId> {
        self.active.get(&thread_id).copied()
    }

    /// Forgets a finished greenlet. Its children now resume into its parent.
    pub fn untrack(&mut self, greenlet: GreenletId) {
        let Some(removed) = self.greenlets.remove(&greenlet) else {
            return;
        };
        for other in self.greenlets.values_mut() {
            if other.parent == Some(greenlet) {
                other.parent = removed.parent;
            }
        }
        self.active.retain(|_, active| *active != greenlet);
    }

    pub fn len(&self) -> usize {
        self.greenlets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.greenlets.is_empty()
    }

    /// One stack per greenlet of `thread_id`, or `None` when the thread has none.
    ///
    /// `physical` is the thread's interpreter stack, innermost first; it
    /// stands for whichever greenlet is active.
    pub fn render(&self, thread_id: ThreadId, physical: &[WalkedFrame], walker: &mut FrameWalker) -> Option<Vec<RenderedStack>> {
        let active = self.active(thread_id);
        let mut leaves: Vec<(u64, GreenletId)> = self
            .greenlets
            .iter()
            .filter(|&(&id, g)| g.thread_id == thread_id && (g.frame.is_some() || Some(id) == active))
            .map(|(&id, g)| (g.created, id))
            .collect();
        if leaves.is_empty() {
            return None;
        }
        leaves.sort_unstable();

        let mut stacks = Vec::with_capacity(leaves.len());
        for (_, leaf) in leaves {
            let mut frames = Vec::new();
            let mut visited = HashSet::new();
            let mut current = Some(leaf);
            while let Some(id) = current {
                let Some(greenlet) = self.greenlets.get(&id).filter(|_| visited.insert(id)) else {
                    break;
                };
                if Some(id) == active {
                    frames.extend(physical.iter().map(|w| w.frame.clone()));
                } else if let Some(top) = greenlet.frame {
                    match walker.walk_from(top) {
                        Ok(walked) => frames.extend(walked.into_iter().map(|w| w.frame)),
                        Err(e) => log::trace!("Cannot walk greenlet {:#x}: {}", id, e),
                    }
                }
                frames.push(Frame::task_boundary(greenlet.name.as_str()));
                current = greenlet.parent;
            }
            stacks.push(RenderedStack {
                task_id: Some(leaf),
                on_cpu: Some(leaf) == active,
                frames,
            });
        }
        Some(stacks)
    }
}
