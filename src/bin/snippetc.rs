//! Snippet compiler driver.
//!
//! Builds an element-wise chain (optionally closed by an innermost reduction), tokenizes
//! it, lowers the resulting subgraph, prints the lowered IR and can run the kernel against
//! a scalar reference or export it as an ELF object.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use snippets::graph::{Model, NodeOp, Output, SnippetsTokenization, TokenizationConfig};
use snippets::op::{EltwiseKind, ReduceKind};
use snippets::snippet::{as_bytes, as_bytes_mut};
use snippets::{
    CompilationSession, Config, ElementType, Generator, Isa, KernelCache, Snippet, VectorDims, X64TargetMachine,
    DYNAMIC_DIMENSION,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile a fused element-wise subgraph into an x86-64 kernel", long_about = None)]
struct Args {
    /// Operations applied in order; binary operations consume a new input.
    #[arg(long, value_delimiter = ',', default_value = "add,relu")]
    ops: Vec<String>,

    /// Innermost-axis reduction closing the chain (sum or max).
    #[arg(long)]
    reduce: Option<String>,

    /// Input shape such as 4x19; `?` marks a dynamic dimension.
    #[arg(long, default_value = "4x19")]
    shape: String,

    /// Vector ISA: sse41, avx2 or avx512. Defaults to the host's widest.
    #[arg(long)]
    isa: Option<String>,

    /// Value bound to every dynamic dimension when running.
    #[arg(long, default_value_t = 7)]
    dyn_value: usize,

    /// Execute the kernel and compare it with a scalar reference.
    #[arg(long)]
    run: bool,

    /// Write the kernel as an ELF object.
    #[arg(long)]
    emit_elf: Option<PathBuf>,

    /// Worker threads the kernel is compiled for.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
}

fn parse_shape(text: &str) -> Result<VectorDims, String> {
    text.split('x')
        .map(|d| match d.trim() {
            "?" => Ok(DYNAMIC_DIMENSION),
            d => d.parse::<usize>().map_err(|e| format!("bad dimension '{d}': {e}")),
        })
        .collect()
}

/// The model to tokenize and the op sequence for the reference.
fn build_model(args: &Args, shape: &VectorDims) -> Result<(Model, Vec<EltwiseKind>, Option<ReduceKind>), String> {
    let mut model = Model::new();
    let mut kinds = Vec::new();
    let mut value: Output = model.parameter(shape.clone(), ElementType::F32);
    for name in &args.ops {
        let kind = EltwiseKind::from_name(name).ok_or_else(|| format!("unknown operation '{name}'"))?;
        let inputs = match kind.arity() {
            1 => vec![value],
            _ => vec![value, model.parameter(shape.clone(), ElementType::F32)],
        };
        value = model.add(NodeOp::Eltwise(kind), &inputs).map_err(|e| e.to_string())?;
        kinds.push(kind);
    }
    let reduce = match args.reduce.as_deref() {
        None => None,
        Some("sum") => Some(ReduceKind::Sum),
        Some("max") => Some(ReduceKind::Max),
        Some(other) => return Err(format!("unknown reduction '{other}'")),
    };
    if let Some(kind) = reduce {
        let op = NodeOp::Reduce { kind, axes: vec![-1], keep_dims: true };
        value = model.add(op, &[value]).map_err(|e| e.to_string())?;
    }
    model.result(value).map_err(|e| e.to_string())?;
    Ok((model, kinds, reduce))
}

fn reference(inputs: &[Vec<f32>], kinds: &[EltwiseKind], reduce: Option<ReduceKind>, inner: usize) -> Vec<f32> {
    let len = inputs[0].len();
    let mut next_input = 1;
    let mut acc = inputs[0].clone();
    for kind in kinds {
        if kind.arity() == 1 {
            acc.iter_mut().for_each(|x| *x = kind.evaluate(*x, 0.0));
        } else {
            let rhs = &inputs[next_input];
            next_input += 1;
            (0..len).for_each(|i| acc[i] = kind.evaluate(acc[i], rhs[i]));
        }
    }
    match reduce {
        Some(kind) => acc
            .chunks(inner)
            .map(|row| row.iter().fold(kind.init_value(), |a, &x| kind.combine(a, x)))
            .collect(),
        None => acc,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let shape = parse_shape(&args.shape)?;
    let isa = match &args.isa {
        Some(name) => Isa::from_name(name).ok_or_else(|| format!("unknown ISA '{name}'"))?,
        None => Isa::host().unwrap_or(Isa::Avx2),
    };
    let (mut model, kinds, reduce) = build_model(&args, &shape)?;

    let tokenization = TokenizationConfig { concurrency: args.concurrency, ..TokenizationConfig::default() };
    let subgraphs = SnippetsTokenization::new(tokenization).run(&mut model)?;
    let [subgraph] = subgraphs.as_slice() else {
        return Err(format!("expected one subgraph, tokenization produced {}", subgraphs.len()).into());
    };
    let node = model.node(*subgraph)?;
    let NodeOp::Subgraph(body) = &node.op else {
        return Err("tokenization did not produce a subgraph node".into());
    };
    let input_shapes = vec![shape.clone(); node.inputs.len()];
    info!("{} with {} inputs", node.name, input_shapes.len());

    let config = Config { concurrency: args.concurrency, ..Config::default() };
    let session = CompilationSession::new();
    let cache = Arc::new(KernelCache::new(16));

    // Lower once more outside the snippet to show the IR.
    let mut ir = snippets::graph::lower_subgraph(body, &input_shapes, config.clone())?;
    let generator = Generator::new(Box::new(X64TargetMachine::new(isa)), cache.clone());
    let lowered = generator.generate(&mut ir, &session, &node.name)?;
    println!("{}", ir.debug_dump());
    println!(
        "; {} bytes of {isa} code, scratchpad {} bytes, {} runtime-arg slots",
        lowered.compiled_snippet.get_code_size(),
        lowered.buffer_scratchpad_size,
        lowered.runtime_args.len()
    );
    println!("{}", session.stats());

    if let Some(path) = &args.emit_elf {
        let elf = snippets::x64::write_elf(lowered.compiled_snippet.as_ref(), &node.name)?;
        fs::write(path, elf)?;
        println!("; wrote {}", path.display());
    }

    if args.run {
        let concrete: VectorDims = shape
            .iter()
            .map(|&d| if d == DYNAMIC_DIMENSION { args.dyn_value } else { d })
            .collect();
        let len: usize = concrete.iter().product();
        let inner = concrete.last().copied().unwrap_or(1);
        let inputs: Vec<Vec<f32>> = (0..input_shapes.len())
            .map(|k| (0..len).map(|i| ((i * 7 + k * 13) % 23) as f32 * 0.25 - 2.5).collect())
            .collect();
        let expected = reference(&inputs, &kinds, reduce, inner);

        let snippet = Snippet::compile(&node.name, body, &input_shapes, Box::new(X64TargetMachine::new(isa)), config, &cache, &session)?;
        let mut out_shape = concrete.clone();
        if reduce.is_some() {
            if let Some(last) = out_shape.last_mut() {
                *last = 1;
            }
        }
        let mut io_shapes = vec![concrete.clone(); inputs.len()];
        io_shapes.push(out_shape);
        let mut output = vec![0.0f32; expected.len()];
        let views: Vec<&[u8]> = inputs.iter().map(|v| as_bytes(v)).collect();
        snippet.execute(&views, &mut [as_bytes_mut(&mut output)], &io_shapes, None)?;

        let max_err = output
            .iter()
            .zip(&expected)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        println!("; ran {} elements, max abs error {max_err:e}", output.len());
        if max_err > 1e-4 {
            return Err(format!("kernel differs from the reference by {max_err}").into());
        }
    }
    Ok(())
}
