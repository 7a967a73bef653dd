// This module implements LinearIR, the ordered expression list every lowered pass works on.
// Expressions live in a slab of slots linked into a doubly-linked list; an ExprId names a slot
// together with the generation it was created in, so inserting or erasing expressions never
// invalidates other handles while a handle to an erased expression fails with an
// InvalidExpression error instead of aliasing a reused slot. Connections between expressions
// are kept on both ends: inputs point at the producing output port and outputs list their
// consumers. The only exception are stores duplicated for tail iterations, which keep a
// forward-only edge to the memory they write so that register assignment and the runtime
// configurator can still find their memory root. Besides the expression list, the IR owns
// its lowering Config, the LoopManager and the scratchpad size computed by buffer passes.

//! Ordered, loop-annotated expression list.

use std::fmt::Write as _;

use hashbrown::HashMap;

use crate::core::dims::format_dims;
use crate::core::{Result, SnippetsError};
use crate::op::OpKind;

use super::expression::{ExprId, ExprPort, Expression};
use super::loop_manager::LoopManager;
use super::pass::RegisterAssignment;

/// Lowering configuration of one linear IR.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Elements processed per vector iteration (the target's lane count).
    pub vector_size: usize,
    /// Number of innermost dimensions iterated inside the kernel (tile rank).
    pub loop_depth: usize,
    pub is_dynamic: bool,
    /// Allow the runtime configurator to reshape the parallel domain.
    pub enable_domain_optimization: bool,
    /// Worker threads expected to execute the kernel.
    pub concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vector_size: 8,
            loop_depth: 1,
            is_dynamic: false,
            enable_domain_optimization: false,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    expr: Option<Expression>,
    generation: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Lowered body of one subgraph.
#[derive(Debug, Clone)]
pub struct LinearIR {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    config: Config,
    loop_manager: LoopManager,
    buffer_scratchpad_size: usize,
    registers: Option<RegisterAssignment>,
}

impl LinearIR {
    pub fn new(config: Config) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            config,
            loop_manager: LoopManager::new(),
            buffer_scratchpad_size: 0,
            registers: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn is_dynamic(&self) -> bool {
        self.config.is_dynamic
    }

    pub fn loop_manager(&self) -> &LoopManager {
        &self.loop_manager
    }

    pub fn loop_manager_mut(&mut self) -> &mut LoopManager {
        &mut self.loop_manager
    }

    pub fn buffer_scratchpad_size(&self) -> usize {
        self.buffer_scratchpad_size
    }

    pub fn set_buffer_scratchpad_size(&mut self, size: usize) {
        self.buffer_scratchpad_size = size;
    }

    /// Kernel-wide registers chosen by register assignment.
    pub fn register_assignment(&self) -> Option<&RegisterAssignment> {
        self.registers.as_ref()
    }

    pub fn set_register_assignment(&mut self, registers: RegisterAssignment) {
        self.registers = Some(registers);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn id_of(&self, index: u32) -> ExprId {
        ExprId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn slot(&self, id: ExprId) -> Result<&Slot> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.generation == id.generation && slot.expr.is_some() => Ok(slot),
            _ => Err(SnippetsError::invalid_expr(format!("{id} does not refer to a live expression"))),
        }
    }

    pub fn contains(&self, id: ExprId) -> bool {
        self.slot(id).is_ok()
    }

    pub fn get(&self, id: ExprId) -> Result<&Expression> {
        match self.slots.get(id.index()) {
            Some(Slot { expr: Some(expr), generation, .. }) if *generation == id.generation => Ok(expr),
            _ => Err(SnippetsError::invalid_expr(format!("{id} does not refer to a live expression"))),
        }
    }

    pub fn get_mut(&mut self, id: ExprId) -> Result<&mut Expression> {
        match self.slots.get_mut(id.index()) {
            Some(Slot { expr: Some(expr), generation, .. }) if *generation == id.generation => Ok(expr),
            _ => Err(SnippetsError::invalid_expr(format!("{id} does not refer to a live expression"))),
        }
    }

    pub fn first(&self) -> Option<ExprId> {
        self.head.map(|i| self.id_of(i))
    }

    pub fn last(&self) -> Option<ExprId> {
        self.tail.map(|i| self.id_of(i))
    }

    pub fn next(&self, id: ExprId) -> Result<Option<ExprId>> {
        Ok(self.slot(id)?.next.map(|i| self.id_of(i)))
    }

    pub fn prev(&self, id: ExprId) -> Result<Option<ExprId>> {
        Ok(self.slot(id)?.prev.map(|i| self.id_of(i)))
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { ir: self, cursor: self.head }
    }

    /// Expressions of `[begin, end)`; `None` as `end` runs to the end of the list.
    pub fn range(&self, begin: Option<ExprId>, end: Option<ExprId>) -> Result<Vec<ExprId>> {
        let mut out = Vec::new();
        let mut cursor = match begin {
            Some(id) => Some(self.slot(id).map(|_| id)?),
            None => None,
        };
        while let Some(id) = cursor {
            if Some(id) == end {
                return Ok(out);
            }
            out.push(id);
            cursor = self.next(id)?;
        }
        match end {
            Some(end) => Err(SnippetsError::invalid_expr(format!(
                "range end {end} is not reachable from its begin"
            ))),
            None => Ok(out),
        }
    }

    fn allocate_slot(&mut self, expr: Expression) -> u32 {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.expr = Some(expr);
            slot.prev = None;
            slot.next = None;
            index
        } else {
            self.slots.push(Slot { expr: Some(expr), generation: 0, prev: None, next: None });
            (self.slots.len() - 1) as u32
        }
    }

    /// Insert before `pos`; `None` appends.
    pub fn insert_before(&mut self, pos: Option<ExprId>, expr: Expression) -> Result<ExprId> {
        let pos_index = match pos {
            Some(id) => Some(self.slot(id).map(|_| id.index)?),
            None => None,
        };
        let index = self.allocate_slot(expr);
        let prev = match pos_index {
            Some(p) => self.slots[p as usize].prev,
            None => self.tail,
        };
        self.slots[index as usize].prev = prev;
        self.slots[index as usize].next = pos_index;
        match prev {
            Some(p) => self.slots[p as usize].next = Some(index),
            None => self.head = Some(index),
        }
        match pos_index {
            Some(p) => self.slots[p as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        Ok(self.id_of(index))
    }

    pub fn insert_after(&mut self, pos: ExprId, expr: Expression) -> Result<ExprId> {
        let next = self.next(pos)?;
        self.insert_before(next, expr)
    }

    pub fn push_back(&mut self, expr: Expression) -> ExprId {
        let index = self.allocate_slot(expr);
        self.slots[index as usize].prev = self.tail;
        match self.tail {
            Some(t) => self.slots[t as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        self.id_of(index)
    }

    /// Remove an expression and its connections. Returns the following expression.
    pub fn erase(&mut self, id: ExprId) -> Result<Option<ExprId>> {
        let expr = self.get(id)?.clone();
        for (in_idx, source) in expr.inputs.iter().enumerate() {
            if let Some(src) = source {
                if let Ok(producer) = self.get_mut(src.expr) {
                    if let Some(list) = producer.outputs.get_mut(src.index) {
                        list.retain(|c| *c != ExprPort::input(id, in_idx));
                    }
                }
            }
        }
        for (out_idx, consumers) in expr.outputs.iter().enumerate() {
            for consumer in consumers {
                if let Ok(c) = self.get_mut(consumer.expr) {
                    if c.inputs.get(consumer.index).copied().flatten() == Some(ExprPort::output(id, out_idx)) {
                        c.inputs[consumer.index] = None;
                    }
                }
            }
        }

        let (prev, next) = {
            let slot = &self.slots[id.index()];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[id.index()];
        slot.expr = None;
        slot.prev = None;
        slot.next = None;
        self.free.push(id.index);
        self.len -= 1;
        Ok(next.map(|i| self.id_of(i)))
    }

    /// Connect output `out` of `src` to input `inp` of `dst`, replacing any previous source.
    pub fn connect(&mut self, src: ExprId, out: usize, dst: ExprId, inp: usize) -> Result<()> {
        if out >= self.get(src)?.output_count() {
            return Err(SnippetsError::invalid_expr(format!("{src} has no output {out}")));
        }
        if inp >= self.get(dst)?.input_count() {
            return Err(SnippetsError::invalid_expr(format!("{dst} has no input {inp}")));
        }
        if let Some(old) = self.get(dst)?.inputs[inp] {
            if let Ok(producer) = self.get_mut(old.expr) {
                producer.outputs[old.index].retain(|c| *c != ExprPort::input(dst, inp));
            }
        }
        self.get_mut(dst)?.inputs[inp] = Some(ExprPort::output(src, out));
        self.get_mut(src)?.outputs[out].push(ExprPort::input(dst, inp));
        Ok(())
    }

    /// Alias of [`LinearIR::connect`] used when rewiring an existing input.
    pub fn replace_input(&mut self, dst: ExprId, inp: usize, src: ExprId, out: usize) -> Result<()> {
        self.connect(src, out, dst, inp)
    }

    /// Consumers of an output that are still alive.
    pub fn consumers(&self, src: ExprId, out: usize) -> Result<Vec<ExprPort>> {
        Ok(self
            .get(src)?
            .consumers(out)
            .iter()
            .copied()
            .filter(|c| self.contains(c.expr))
            .collect())
    }

    pub fn source(&self, dst: ExprId, inp: usize) -> Result<Option<ExprPort>> {
        Ok(self.get(dst)?.input_source(inp))
    }

    fn collect_where(&self, pred: impl Fn(&OpKind) -> Option<usize>) -> Vec<ExprId> {
        let mut found: Vec<(usize, ExprId)> = self
            .iter()
            .filter_map(|id| {
                let expr = self.get(id).ok()?;
                pred(expr.op()).map(|key| (key, id))
            })
            .collect();
        found.sort_by_key(|(key, _)| *key);
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// Parameters ordered by their io index.
    pub fn parameters(&self) -> Vec<ExprId> {
        self.collect_where(|op| match op {
            OpKind::Parameter { index } => Some(*index),
            _ => None,
        })
    }

    /// Results ordered by their io index.
    pub fn results(&self) -> Vec<ExprId> {
        self.collect_where(|op| match op {
            OpKind::Result { index } => Some(*index),
            _ => None,
        })
    }

    /// Buffers ordered by their id.
    pub fn buffers(&self) -> Vec<ExprId> {
        self.collect_where(|op| match op {
            OpKind::Buffer(desc) => Some(desc.id),
            _ => None,
        })
    }

    pub fn has_op(&self, pred: impl Fn(&OpKind) -> bool) -> bool {
        self.iter().any(|id| self.get(id).map(|e| pred(e.op())).unwrap_or(false))
    }

    /// Position of every live expression in list order.
    pub fn positions(&self) -> HashMap<ExprId, usize> {
        self.iter().enumerate().map(|(pos, id)| (id, pos)).collect()
    }

    /// Parameter or buffer an input port reads from.
    pub fn memory_root_of_input(&self, expr: ExprId, inp: usize) -> Result<Option<ExprId>> {
        let Some(src) = self.source(expr, inp)? else {
            return Ok(None);
        };
        let producer = self.get(src.expr)?;
        Ok(producer.op().is_memory_root().then_some(src.expr))
    }

    /// Result or buffer an output port writes to.
    pub fn memory_root_of_output(&self, expr: ExprId, out: usize) -> Result<Option<ExprId>> {
        for consumer in self.get(expr)?.consumers(out) {
            if let Ok(c) = self.get(consumer.expr) {
                if c.op().is_memory_root() {
                    return Ok(Some(consumer.expr));
                }
            }
        }
        Ok(None)
    }

    /// `LoopBegin` and `LoopEnd` expressions of a materialized loop.
    pub fn loop_bounds(&self, loop_id: usize) -> Result<(ExprId, ExprId)> {
        let mut begin = None;
        let mut end = None;
        for id in self.iter() {
            match self.get(id)?.op() {
                OpKind::LoopBegin { loop_id: l } if *l == loop_id => begin = Some(id),
                OpKind::LoopEnd { loop_id: l } if *l == loop_id => end = Some(id),
                _ => {}
            }
        }
        match (begin, end) {
            (Some(b), Some(e)) => Ok((b, e)),
            _ => Err(SnippetsError::loop_nesting(format!("loop {loop_id} is not materialized"))),
        }
    }

    /// Explicit deep copy: expressions, descriptors and loops.
    pub fn deep_clone(&self) -> LinearIR {
        self.clone()
    }

    /// Duplicate `[first, last]` before `insert_pos` and return the old-to-new mapping.
    ///
    /// Connections inside the range are remapped; inputs produced outside the range stay
    /// attached to their original producers. Copied stores keep a forward-only edge to
    /// the memory root they write.
    pub fn clone_range(
        &mut self,
        first: ExprId,
        last: ExprId,
        insert_pos: Option<ExprId>,
    ) -> Result<HashMap<ExprId, ExprId>> {
        let originals = self.range(Some(first), self.next(last)?)?;
        if originals.last() != Some(&last) {
            return Err(SnippetsError::invalid_expr(format!("{last} does not follow {first}")));
        }

        let mut mapping = HashMap::new();
        for &orig in &originals {
            let expr = self.get(orig)?;
            let mut copy = Expression::new(
                expr.op.clone(),
                expr.input_descs.clone(),
                expr.output_descs.clone(),
            );
            copy.loop_ids = expr.loop_ids.clone();
            let new_id = self.insert_before(insert_pos, copy)?;
            mapping.insert(orig, new_id);
        }

        for &orig in &originals {
            let new_id = mapping[&orig];
            let expr = self.get(orig)?.clone();
            for (inp, source) in expr.inputs.iter().enumerate() {
                if let Some(src) = source {
                    let producer = mapping.get(&src.expr).copied().unwrap_or(src.expr);
                    self.connect(producer, src.index, new_id, inp)?;
                }
            }
            if matches!(expr.op, OpKind::Store { .. }) {
                for (out, consumers) in expr.outputs.iter().enumerate() {
                    for consumer in consumers {
                        if !mapping.contains_key(&consumer.expr) {
                            self.get_mut(new_id)?.outputs[out].push(*consumer);
                        }
                    }
                }
            }
        }
        Ok(mapping)
    }

    /// Text rendering, one expression per line.
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        for id in self.iter() {
            let Ok(expr) = self.get(id) else { continue };
            let _ = write!(out, "{id:>4}: {}", expr.op());
            let inputs: Vec<String> = expr
                .inputs
                .iter()
                .zip(expr.input_descs.iter())
                .map(|(src, desc)| match src {
                    Some(src) => format!("{}.{}={desc}", src.expr, src.index),
                    None => format!("?={desc}"),
                })
                .collect();
            if !inputs.is_empty() {
                let _ = write!(out, " ({})", inputs.join(", "));
            }
            let outputs: Vec<String> = expr.output_descs.iter().map(|d| d.to_string()).collect();
            if !outputs.is_empty() {
                let _ = write!(out, " -> {}", outputs.join(", "));
            }
            if !expr.loop_ids.is_empty() {
                let _ = write!(out, " loops{:?}", expr.loop_ids);
            }
            out.push('\n');
        }
        for (id, info) in self.loop_manager.iter() {
            let _ = writeln!(
                out,
                "loop {id}: {:?} dim={} work_amount={} increment={} ports={}",
                info.kind,
                info.dim_idx,
                format_dims(&[info.work_amount]),
                info.increment,
                info.input_ports.len() + info.output_ports.len()
            );
        }
        out
    }
}

/// Iterator over expression handles in list order.
pub struct Iter<'a> {
    ir: &'a LinearIR,
    cursor: Option<u32>,
}

impl Iterator for Iter<'_> {
    type Item = ExprId;

    fn next(&mut self) -> Option<ExprId> {
        let index = self.cursor?;
        self.cursor = self.ir.slots[index as usize].next;
        Some(self.ir.id_of(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::expression::PortDescriptor;
    use crate::op::EltwiseKind;

    fn desc() -> PortDescriptor {
        PortDescriptor::new(vec![1, 16], ElementType::F32)
    }

    fn relu() -> Expression {
        Expression::new(OpKind::Eltwise(EltwiseKind::Relu), vec![desc()], vec![desc()])
    }

    #[test]
    fn test_insert_and_erase_keep_handles() {
        let mut ir = LinearIR::new(Config::default());
        let a = ir.push_back(relu());
        let c = ir.push_back(relu());
        let b = ir.insert_before(Some(c), relu()).unwrap();
        assert_eq!(ir.range(ir.first(), None).unwrap(), vec![a, b, c]);

        ir.connect(a, 0, b, 0).unwrap();
        ir.connect(b, 0, c, 0).unwrap();
        assert_eq!(ir.erase(b).unwrap(), Some(c));
        assert_eq!(ir.len(), 2);
        assert_eq!(ir.source(c, 0).unwrap(), None);
        assert!(ir.consumers(a, 0).unwrap().is_empty());

        // Erased handle is rejected even after its slot is reused.
        let d = ir.push_back(relu());
        assert_eq!(d.index(), b.index());
        assert!(matches!(ir.get(b), Err(SnippetsError::InvalidExpression { .. })));
        assert!(ir.get(d).is_ok());
    }

    #[test]
    fn test_range_end_exclusive() {
        let mut ir = LinearIR::new(Config::default());
        let ids: Vec<_> = (0..4).map(|_| ir.push_back(relu())).collect();
        assert_eq!(ir.range(Some(ids[1]), Some(ids[3])).unwrap(), vec![ids[1], ids[2]]);
        assert!(ir.range(Some(ids[2]), Some(ids[0])).is_err());
    }

    #[test]
    fn test_clone_range_remaps_internal_edges() {
        let mut ir = LinearIR::new(Config::default());
        let a = ir.push_back(relu());
        let b = ir.push_back(relu());
        let c = ir.push_back(relu());
        ir.connect(a, 0, b, 0).unwrap();
        ir.connect(b, 0, c, 0).unwrap();

        let mapping = ir.clone_range(b, c, None).unwrap();
        let (b2, c2) = (mapping[&b], mapping[&c]);
        // External producer shared, internal edge remapped.
        assert_eq!(ir.source(b2, 0).unwrap(), Some(ExprPort::output(a, 0)));
        assert_eq!(ir.source(c2, 0).unwrap(), Some(ExprPort::output(b2, 0)));
        assert_eq!(ir.consumers(a, 0).unwrap().len(), 2);
        assert_eq!(ir.range(ir.first(), None).unwrap(), vec![a, b, c, b2, c2]);
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let mut ir = LinearIR::new(Config::default());
        let a = ir.push_back(relu());
        let mut copy = ir.deep_clone();
        copy.erase(a).unwrap();
        assert!(ir.get(a).is_ok());
        assert!(copy.is_empty());
    }
}
