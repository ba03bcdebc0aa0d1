// crates/adapt/src/index/build.rs
//
// Background catch-up for an emulated index: a snapshot of the collection is
// indexed batch by batch while writes that happen meanwhile are queued.

use super::emulated::EmulatedIndex;
use domain::{Document, FieldPath, Key};
use std::collections::VecDeque;

/// How `create_index` builds an emulated index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexBuildMode {
    /// Build completely inside `create_index`.
    #[default]
    Immediate,
    /// Return with the index `Building`; each store call indexes `batch`
    /// more snapshot documents.
    Incremental { batch: usize },
}

#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Put(Document),
    Remove(Key),
}

#[derive(Debug)]
pub(crate) struct BuildJob {
    snapshot: VecDeque<Document>,
    queued: Vec<PendingWrite>,
    partial: EmulatedIndex,
}

impl BuildJob {
    pub(crate) fn new(snapshot: Vec<Document>) -> Self {
        Self {
            snapshot: snapshot.into(),
            queued: Vec::new(),
            partial: EmulatedIndex::new(),
        }
    }

    pub(crate) fn queue(&mut self, write: PendingWrite) {
        self.queued.push(write);
    }

    pub(crate) fn remaining(&self) -> usize {
        self.snapshot.len()
    }

    /// Index up to `batch` snapshot documents. Returns true once the
    /// snapshot is exhausted.
    pub(crate) fn step(&mut self, path: &FieldPath, batch: usize) -> bool {
        for doc in self.snapshot.drain(..batch.min(self.snapshot.len())) {
            self.partial.put(path, &doc);
        }
        self.snapshot.is_empty()
    }

    /// Drain the snapshot, replay queued writes in submission order and hand
    /// back the finished index.
    pub(crate) fn finish(mut self, path: &FieldPath) -> EmulatedIndex {
        while !self.step(path, usize::MAX) {}
        for write in self.queued {
            match write {
                PendingWrite::Put(doc) => self.partial.put(path, &doc),
                PendingWrite::Remove(key) => self.partial.remove(&key),
            }
        }
        self.partial
    }
}
