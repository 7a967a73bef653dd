// This module computes the live ranges the register assigner works with. A linear IR has no
// branches besides loop back-edges, so a vector value is live from the position of the
// expression defining it to the position of its last consumer. Back-edges are handled by
// extending a value used inside a loop it was not defined in up to that loop's LoopEnd, and
// in-place operations (ReduceAccumulate writes into the register of its accumulator input)
// are merged with their accumulator into one interval so the whole chain shares a register.
// Intervals are scratch data of a single pass run and are allocated in a bumpalo arena.

//! Vector value liveness over a linear IR.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;

use crate::core::Result;
use crate::op::OpKind;

use super::expression::ExprId;
use super::linear_ir::LinearIR;

/// Liveness information for one group of values sharing a register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LivenessInfo {
    /// Position of the first definition.
    pub first: usize,
    /// Position of the last use.
    pub last: usize,
    /// Number of uses including the definitions.
    pub ref_count: u32,
    /// Whether the interval was stretched to the end of an enclosing loop.
    pub last_full: bool,
}

impl LivenessInfo {
    pub fn contains(&self, pos: usize) -> bool {
        self.first < pos && pos < self.last
    }
}

/// Values that must share one register, with their merged interval.
#[derive(Debug)]
pub struct LiveGroup<'a> {
    pub members: BumpVec<'a, ExprId>,
    pub info: LivenessInfo,
}

/// Live ranges of every vector value of an IR.
pub struct Liveness<'a> {
    groups: BumpVec<'a, LiveGroup<'a>>,
    group_of: HashMap<ExprId, usize>,
    positions: HashMap<ExprId, usize>,
}

fn find(parent: &mut HashMap<ExprId, ExprId>, id: ExprId) -> ExprId {
    let mut root = id;
    while let Some(&p) = parent.get(&root) {
        if p == root {
            break;
        }
        root = p;
    }
    let mut cur = id;
    while cur != root {
        let next = parent[&cur];
        parent.insert(cur, root);
        cur = next;
    }
    root
}

impl<'a> Liveness<'a> {
    pub fn compute(ir: &LinearIR, arena: &'a Bump) -> Result<Self> {
        let positions = ir.positions();
        let mut loop_ends: HashMap<usize, usize> = HashMap::new();
        let mut values: Vec<ExprId> = Vec::new();
        let mut parent: HashMap<ExprId, ExprId> = HashMap::new();

        for id in ir.iter() {
            let expr = ir.get(id)?;
            if let OpKind::LoopEnd { loop_id } = expr.op() {
                loop_ends.insert(*loop_id, positions[&id]);
            }
            if expr.op().defines_vector() {
                values.push(id);
                parent.insert(id, id);
            }
        }

        // In-place accumulation shares the accumulator register.
        for &id in &values {
            if let OpKind::ReduceAccumulate(_) = ir.get(id)?.op() {
                if let Some(src) = ir.source(id, 1)? {
                    if parent.contains_key(&src.expr) {
                        let (a, b) = (find(&mut parent, id), find(&mut parent, src.expr));
                        if a != b {
                            parent.insert(a, b);
                        }
                    }
                }
            }
        }

        let mut groups: BumpVec<'a, LiveGroup<'a>> = BumpVec::new_in(arena);
        let mut group_of: HashMap<ExprId, usize> = HashMap::new();
        for &id in &values {
            let root = find(&mut parent, id);
            let index = match group_of.get(&root) {
                Some(&index) => index,
                None => {
                    groups.push(LiveGroup {
                        members: BumpVec::new_in(arena),
                        info: LivenessInfo {
                            first: usize::MAX,
                            last: 0,
                            ref_count: 0,
                            last_full: false,
                        },
                    });
                    group_of.insert(root, groups.len() - 1);
                    groups.len() - 1
                }
            };
            group_of.insert(id, index);

            let expr = ir.get(id)?;
            let def_pos = positions[&id];
            let group = &mut groups[index];
            group.members.push(id);
            group.info.first = group.info.first.min(def_pos);
            group.info.last = group.info.last.max(def_pos);
            group.info.ref_count += 1;

            for consumer in ir.consumers(id, 0)? {
                let use_pos = positions[&consumer.expr];
                group.info.last = group.info.last.max(use_pos);
                group.info.ref_count += 1;
                for loop_id in ir.get(consumer.expr)?.loop_ids() {
                    if expr.loop_ids().contains(loop_id) {
                        continue;
                    }
                    if let Some(&end) = loop_ends.get(loop_id) {
                        if end > group.info.last {
                            group.info.last = end;
                            group.info.last_full = true;
                        }
                    }
                }
            }
        }

        Ok(Self { groups, group_of, positions })
    }

    pub fn groups(&self) -> &[LiveGroup<'a>] {
        &self.groups
    }

    pub fn group_of(&self, id: ExprId) -> Option<usize> {
        self.group_of.get(&id).copied()
    }

    pub fn position(&self, id: ExprId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Groups ordered by interval start, then by group index.
    pub fn by_start(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.sort_by_key(|&g| (self.groups[g].info.first, g));
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::{EltwiseKind, ReduceKind};

    #[test]
    fn test_chain_intervals() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 16], ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        b.result(relu).unwrap();
        let ir = b.build().unwrap();

        let arena = Bump::new();
        let liveness = Liveness::compute(&ir, &arena).unwrap();
        // Load and Relu.
        assert_eq!(liveness.groups().len(), 2);
        for group in liveness.groups() {
            assert_eq!(group.info.last, group.info.first + 1);
            assert_eq!(group.info.ref_count, 2);
        }
    }

    #[test]
    fn test_accumulator_shares_group_with_init() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 16], ElementType::F32).unwrap();
        let max = b.reduce(ReduceKind::Max, x).unwrap();
        b.result(max).unwrap();
        let ir = b.build().unwrap();

        let arena = Bump::new();
        let liveness = Liveness::compute(&ir, &arena).unwrap();
        let find_op = |pred: fn(&OpKind) -> bool| {
            ir.iter().find(|&id| pred(ir.get(id).unwrap().op())).unwrap()
        };
        let scalar = find_op(|op| matches!(op, OpKind::Scalar { .. }));
        let acc = find_op(|op| matches!(op, OpKind::ReduceAccumulate(_)));
        assert_eq!(liveness.group_of(scalar), liveness.group_of(acc));
        let group = &liveness.groups()[liveness.group_of(acc).unwrap()];
        assert_eq!(group.members.len(), 2);
    }
}
