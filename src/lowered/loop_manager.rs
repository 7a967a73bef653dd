// This module keeps the loop descriptions of a linear IR. Every loop id maps to a LoopInfo
// holding the iteration space along one planar dimension (work amount, increment, dimension
// index counted from the innermost) and the loop ports through which the body touches memory.
// A loop port remembers how far its pointer moves per element of the loop dimension and how
// much to rewind once the loop finishes. Loops marked over the original dimension are
// "unified"; once tail processing splits a unified loop into a main body and a last iteration,
// each part becomes an "expanded" loop that points back to the unified id it was derived from,
// so the runtime configurator can recompute both halves from one set of bounds.

//! Loop descriptions owned by the linear IR.

use std::collections::BTreeMap;

use crate::core::dims::is_dynamic_value;
use crate::core::{Result, SnippetsError, DYNAMIC_DIMENSION};

use super::expression::ExprPort;

/// Sentinel for pointer increments and finalization offsets known only at runtime.
pub const DYNAMIC_OFFSET: i64 = i64::MIN;

/// Which part of an expanded unified loop an iteration range covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecificIterType {
    MainBody,
    LastIter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Unified,
    Expanded {
        unified_id: usize,
        iter_type: SpecificIterType,
    },
}

/// A memory port that the loop advances.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPort {
    pub port: ExprPort,
    pub is_incremented: bool,
    /// Elements the pointer moves per element of the loop dimension.
    pub ptr_increment: i64,
    /// Elements to move once the loop completes.
    pub finalization_offset: i64,
    pub data_size: usize,
}

impl LoopPort {
    pub fn new(port: ExprPort, data_size: usize) -> Self {
        Self {
            port,
            is_incremented: true,
            ptr_increment: 0,
            finalization_offset: 0,
            data_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopInfo {
    pub work_amount: usize,
    pub increment: usize,
    /// Planar dimension the loop iterates over, 0 being the innermost.
    pub dim_idx: usize,
    pub input_ports: Vec<LoopPort>,
    pub output_ports: Vec<LoopPort>,
    pub kind: LoopKind,
}

impl LoopInfo {
    pub fn new(work_amount: usize, increment: usize, dim_idx: usize) -> Self {
        Self {
            work_amount,
            increment,
            dim_idx,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            kind: LoopKind::Unified,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        is_dynamic_value(self.work_amount)
    }

    /// Remainder left after the last full increment.
    pub fn tail_increment(&self) -> usize {
        if self.is_dynamic() {
            DYNAMIC_DIMENSION
        } else if self.increment == 0 {
            0
        } else {
            self.work_amount % self.increment
        }
    }

    pub fn iter_type(&self) -> Option<SpecificIterType> {
        match self.kind {
            LoopKind::Unified => None,
            LoopKind::Expanded { iter_type, .. } => Some(iter_type),
        }
    }

    /// Id of the unified loop this one was derived from (itself when unified).
    pub fn unified_id(&self, own_id: usize) -> usize {
        match self.kind {
            LoopKind::Unified => own_id,
            LoopKind::Expanded { unified_id, .. } => unified_id,
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = &LoopPort> {
        self.input_ports.iter().chain(self.output_ports.iter())
    }

    pub fn ports_mut(&mut self) -> impl Iterator<Item = &mut LoopPort> {
        self.input_ports.iter_mut().chain(self.output_ports.iter_mut())
    }
}

/// Owner of every loop of one linear IR.
#[derive(Debug, Clone, Default)]
pub struct LoopManager {
    loops: BTreeMap<usize, LoopInfo>,
    next_id: usize,
}

impl LoopManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop under a fresh id.
    pub fn add_loop(&mut self, info: LoopInfo) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.loops.insert(id, info);
        id
    }

    pub fn get(&self, id: usize) -> Result<&LoopInfo> {
        self.loops
            .get(&id)
            .ok_or_else(|| SnippetsError::loop_nesting(format!("unknown loop id {id}")))
    }

    pub fn get_mut(&mut self, id: usize) -> Result<&mut LoopInfo> {
        self.loops
            .get_mut(&id)
            .ok_or_else(|| SnippetsError::loop_nesting(format!("unknown loop id {id}")))
    }

    pub fn contains(&self, id: usize) -> bool {
        self.loops.contains_key(&id)
    }

    pub fn remove(&mut self, id: usize) -> Option<LoopInfo> {
        self.loops.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn ids(&self) -> Vec<usize> {
        self.loops.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &LoopInfo)> {
        self.loops.iter().map(|(&id, info)| (id, info))
    }

    /// Expanded loops derived from a unified loop, in id order.
    pub fn expanded_loops(&self, unified_id: usize) -> Vec<usize> {
        self.loops
            .iter()
            .filter(|(_, info)| {
                matches!(info.kind, LoopKind::Expanded { unified_id: u, .. } if u == unified_id)
            })
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.loops.clear();
        self.next_id = 0;
    }
}
