use std::sync::Arc;

use snippets::graph::tokenization::is_supported_matmul;
use snippets::graph::{appropriate_for_subgraph, Model, NodeOp};
use snippets::lowered::pass::{InitBuffersDefault, InitLoops, InsertLoops, InsertSpecificIterations, MarkLoops, RangedPass};
use snippets::lowered::SpecificIterType;
use snippets::op::{EltwiseKind, OpKind, OpType, ReduceKind};
use snippets::{
    CompilationSession, Config, ElementType, Generator, Isa, KernelCache, LinearIR, LinearIrBuilder, SnippetsError,
    TargetMachine, X64TargetMachine,
};

fn chain(shape: Vec<usize>) -> LinearIR {
    let mut b = LinearIrBuilder::new(Config::default());
    let x = b.parameter(shape.clone(), ElementType::F32).unwrap();
    let y = b.parameter(shape, ElementType::F32).unwrap();
    let add = b.eltwise(EltwiseKind::Add, &[x, y]).unwrap();
    let mul = b.eltwise(EltwiseKind::Multiply, &[add, y]).unwrap();
    let relu = b.eltwise(EltwiseKind::Relu, &[mul]).unwrap();
    b.result(relu).unwrap();
    b.build().unwrap()
}

fn with_loops(mut ir: LinearIR) -> LinearIR {
    MarkLoops.run(&mut ir, None, None).unwrap();
    InitLoops.run(&mut ir, None, None).unwrap();
    InsertLoops.run(&mut ir, None, None).unwrap();
    ir
}

#[test]
fn test_vector_multiple_gets_one_loop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ir = with_loops(chain(vec![1, 128]));

    let manager = ir.loop_manager();
    assert_eq!(manager.len(), 1);
    let info = manager.get(0).unwrap();
    assert_eq!((info.work_amount, info.increment), (128, 8));

    // No tail, so nothing is split.
    assert!(!InsertSpecificIterations.run(&mut ir, None, None).unwrap());
    assert_eq!(ir.loop_manager().len(), 1);
    let begins = ir.iter().filter(|&id| matches!(ir.get(id).unwrap().op(), OpKind::LoopBegin { .. })).count();
    assert_eq!(begins, 1);
}

#[test]
fn test_tail_splits_into_main_and_last_iteration() {
    let mut ir = with_loops(chain(vec![1, 130]));
    assert!(InsertSpecificIterations.run(&mut ir, None, None).unwrap());

    let manager = ir.loop_manager();
    let expanded = manager.expanded_loops(0);
    assert_eq!(expanded.len(), 2);
    let main = manager.get(expanded[0]).unwrap();
    let tail = manager.get(expanded[1]).unwrap();
    assert_eq!(main.iter_type(), Some(SpecificIterType::MainBody));
    assert_eq!((main.work_amount, main.increment), (128, 8));
    assert_eq!(tail.iter_type(), Some(SpecificIterType::LastIter));
    assert_eq!(tail.work_amount, 2);
    assert_eq!(main.unified_id(expanded[0]), tail.unified_id(expanded[1]));
}

#[test]
fn test_default_buffers_are_laid_out_back_to_back() {
    // Two values outlive a reduction, so two spills are created.
    let mut b = LinearIrBuilder::new(Config::default());
    let x = b.parameter(vec![2, 32], ElementType::F32).unwrap();
    let abs = b.eltwise(EltwiseKind::Abs, &[x]).unwrap();
    let max = b.reduce(ReduceKind::Max, abs).unwrap();
    let shifted = b.eltwise(EltwiseKind::Subtract, &[abs, max]).unwrap();
    let sum = b.reduce(ReduceKind::Sum, shifted).unwrap();
    let norm = b.eltwise(EltwiseKind::Divide, &[shifted, sum]).unwrap();
    b.result(norm).unwrap();
    let mut ir = b.build().unwrap();

    let scratchpad = InitBuffersDefault.assign(&mut ir).unwrap();
    let descs: Vec<_> = ir
        .buffers()
        .into_iter()
        .map(|id| match ir.get(id).unwrap().op() {
            OpKind::Buffer(desc) => desc.clone(),
            other => panic!("{other} is not a buffer"),
        })
        .collect();
    assert_eq!(descs.len(), 2);
    assert_eq!(descs[0].offset, 0);
    assert_eq!(descs[1].offset, descs[0].allocation_size);
    assert_eq!(scratchpad, descs[0].allocation_size + descs[1].allocation_size);
}

#[test]
fn test_missing_emitter_is_reported() {
    let target = X64TargetMachine::new(Isa::Avx2);
    let exp = OpType::Eltwise(EltwiseKind::Exp);
    assert!(!target.has(exp));
    assert!(matches!(target.registry().get(exp), Err(SnippetsError::UnregisteredEmitter { .. })));

    let mut b = LinearIrBuilder::new(Config::default());
    let x = b.parameter(vec![4, 16], ElementType::F32).unwrap();
    let e = b.eltwise(EltwiseKind::Exp, &[x]).unwrap();
    b.result(e).unwrap();
    let mut ir = b.build().unwrap();
    let generator = Generator::new(Box::new(target), Arc::new(KernelCache::new(4)));
    let err = generator.generate(&mut ir, &CompilationSession::new(), "exp").unwrap_err();
    assert!(matches!(err, SnippetsError::UnsupportedOp { .. }), "{err}");
}

#[test]
fn test_matmul_rank_gates_tokenization() {
    let mut model = Model::new();
    let a = model.parameter(vec![1, 2, 32, 16], ElementType::F32);
    let b = model.parameter(vec![1, 2, 16, 8], ElementType::F32);
    let mm4 = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[a, b]).unwrap();
    let c = model.parameter(vec![2, 32, 16], ElementType::F32);
    let d = model.parameter(vec![2, 16, 8], ElementType::F32);
    let mm3 = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[c, d]).unwrap();

    assert!(is_supported_matmul(&model, mm4.node));
    assert!(!is_supported_matmul(&model, mm3.node));
    assert!(!appropriate_for_subgraph(&model, mm3.node));
}

#[test]
fn test_loop_marking_is_deterministic() {
    let dumps: Vec<String> = (0..3).map(|_| with_loops(chain(vec![3, 21])).debug_dump()).collect();
    assert!(dumps.windows(2).all(|w| w[0] == w[1]));
    assert!(dumps[0].contains("LoopBegin"));
}
