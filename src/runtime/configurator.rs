// The configurator owns the runtime state of one compiled kernel. `initialize` records the
// kernel's parameters and results, the shapes it was compiled for and the runtime-args
// layout, registers the applicable optimizers and, for static kernels, produces the only
// configuration the kernel will ever need. `update` takes the shapes of one invocation
// (parameters then results), rejects shapes that contradict the compile-time assumptions,
// propagates the shapes through the port descriptors of the linear IR, and derives the
// master shape, the parallel domain with the byte offset of every io per domain step, the
// loop arguments of every materialized loop, the scratchpad offsets of buffers sized at
// runtime and the kernel executor configurations. The expression list is never changed;
// only port shapes and loop-info numbers are rewritten.

//! Runtime configurator.

use log::{debug, trace};

use crate::core::dims::{broadcast_merge_dim, format_dims, is_dynamic_shape, is_dynamic_value};
use crate::core::{ElementType, Result, SnippetsError, VectorDims};
use crate::kernel_executor::brgemm_copy_b::repacked_size;
use crate::kernel_executor::KernelExecutorTable;
use crate::lowered::pass::{expanded_work_amount, port_increment};
use crate::lowered::{
    ExprId, ExprPort, LinearIR, LoopKind, PortDescriptor, PortType, RuntimeArgsLayout, SpecificIterType,
    DYNAMIC_OFFSET,
};
use crate::op::OpKind;

use super::optimizer::{MHAParallelWAOptimizer, RuntimeOptimizer};
use super::RuntimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguratorState {
    Uninitialized,
    /// The current config matches the last shapes passed to `update`.
    StaticConfigReady,
    UpdatePending,
}

/// Bring `shape` to `rank` by prepending ones or dropping leading unit dimensions.
fn fit_rank(shape: &[usize], rank: usize) -> Result<VectorDims> {
    if shape.len() <= rank {
        let mut out = vec![1; rank - shape.len()];
        out.extend_from_slice(shape);
        return Ok(out);
    }
    let extra = shape.len() - rank;
    if shape[..extra].iter().any(|&d| d != 1) {
        return Err(SnippetsError::shape_update(format!(
            "shape {} does not fit rank {rank}",
            format_dims(shape)
        )));
    }
    Ok(shape[extra..].to_vec())
}

/// Planar shape a port sees when its producer stores `stored`.
fn planar_view(stored: &[usize], desc: &PortDescriptor) -> Result<VectorDims> {
    let stored = fit_rank(stored, desc.rank())?;
    if desc.layout.len() != stored.len() {
        return Ok(stored);
    }
    let mut planar = vec![1; stored.len()];
    for (m, &dim) in desc.layout.iter().enumerate() {
        planar[dim] = stored[m];
    }
    Ok(planar)
}

fn merge_dim(shapes: &[VectorDims], d: usize) -> Option<usize> {
    shapes.iter().try_fold(1, |acc, s| broadcast_merge_dim(acc, s[d]))
}

/// Size of a loop dimension counted from the innermost one.
fn dim_at(desc: &PortDescriptor, dim_idx: usize) -> usize {
    let rank = desc.rank();
    if dim_idx >= rank {
        1
    } else {
        desc.shape[rank - 1 - dim_idx]
    }
}

fn port_desc(ir: &LinearIR, port: ExprPort) -> Result<PortDescriptor> {
    let expr = ir.get(port.expr)?;
    let descs = match port.port_type {
        PortType::Input => expr.input_descs(),
        PortType::Output => expr.output_descs(),
    };
    descs
        .get(port.index)
        .cloned()
        .ok_or_else(|| SnippetsError::invalid_expr(format!("{} has no {:?} port {}", expr.op(), port.port_type, port.index)))
}

pub struct RuntimeConfigurator {
    state: ConfiguratorState,
    config: RuntimeConfig,
    layout: RuntimeArgsLayout,
    /// Parameters ordered by index, then results ordered by index.
    io_exprs: Vec<ExprId>,
    io_types: Vec<ElementType>,
    params: usize,
    compiled_shapes: Vec<VectorDims>,
    static_scratchpad: usize,
    optimizers: Vec<Box<dyn RuntimeOptimizer>>,
}

impl Default for RuntimeConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfigurator {
    pub fn new() -> Self {
        Self {
            state: ConfiguratorState::Uninitialized,
            config: RuntimeConfig::default(),
            layout: RuntimeArgsLayout::default(),
            io_exprs: Vec::new(),
            io_types: Vec::new(),
            params: 0,
            compiled_shapes: Vec::new(),
            static_scratchpad: 0,
            optimizers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConfiguratorState {
        self.state
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn io_types(&self) -> &[ElementType] {
        &self.io_types
    }

    pub fn param_count(&self) -> usize {
        self.params
    }

    /// Shapes the kernel was compiled for, parameters then results.
    pub fn compiled_shapes(&self) -> &[VectorDims] {
        &self.compiled_shapes
    }

    pub fn optimizer_names(&self) -> Vec<&'static str> {
        self.optimizers.iter().map(|o| o.name()).collect()
    }

    pub fn register_if_applicable<O: RuntimeOptimizer + 'static>(&mut self, optimizer: Option<O>) {
        if let Some(optimizer) = optimizer {
            debug!("runtime optimizer {} registered", optimizer.name());
            self.optimizers.push(Box::new(optimizer));
        }
    }

    pub fn initialize(&mut self, ir: &mut LinearIR, layout: RuntimeArgsLayout, executors: KernelExecutorTable) -> Result<()> {
        let mut params = Vec::new();
        let mut results = Vec::new();
        for id in ir.iter() {
            match ir.get(id)?.op() {
                OpKind::Parameter { index } => params.push((*index, id)),
                OpKind::Result { index } => results.push((*index, id)),
                _ => {}
            }
        }
        params.sort_unstable_by_key(|(index, _)| *index);
        results.sort_unstable_by_key(|(index, _)| *index);
        self.params = params.len();
        self.io_exprs = params.iter().chain(&results).map(|(_, id)| *id).collect();

        self.compiled_shapes.clear();
        self.io_types.clear();
        for &id in &self.io_exprs {
            let expr = ir.get(id)?;
            let desc = match expr.op() {
                OpKind::Parameter { .. } => expr.output_descs().first(),
                _ => expr.input_descs().first(),
            }
            .ok_or_else(|| SnippetsError::invalid_expr(format!("{} has no port descriptor", expr.op())))?;
            self.compiled_shapes.push(desc.shape.clone());
            self.io_types.push(desc.element_type);
        }

        self.layout = layout;
        self.static_scratchpad = ir.buffer_scratchpad_size();
        self.config = RuntimeConfig {
            buffer_scratchpad_size: self.static_scratchpad,
            executors,
            ..Default::default()
        };
        self.optimizers.clear();
        let mha = MHAParallelWAOptimizer::new_if_applicable(ir, &self.io_exprs)?;
        self.register_if_applicable(mha);

        if ir.is_dynamic() {
            self.state = ConfiguratorState::UpdatePending;
        } else {
            let shapes = self.compiled_shapes.clone();
            self.configure(ir, &shapes)?;
            self.state = ConfiguratorState::StaticConfigReady;
        }
        Ok(())
    }

    /// Configure the kernel for one invocation. Repeated calls with the same shapes reuse
    /// the current configuration.
    pub fn update(&mut self, ir: &mut LinearIR, io_shapes: &[VectorDims]) -> Result<&RuntimeConfig> {
        if self.state == ConfiguratorState::Uninitialized {
            return Err(SnippetsError::structure("runtime configurator used before initialize"));
        }
        self.check_shapes(io_shapes)?;
        if self.state == ConfiguratorState::StaticConfigReady && self.config.io_shapes == io_shapes {
            trace!("runtime config reused for {} io shapes", io_shapes.len());
            return Ok(&self.config);
        }
        self.state = ConfiguratorState::UpdatePending;
        self.configure(ir, io_shapes)?;
        self.state = ConfiguratorState::StaticConfigReady;
        Ok(&self.config)
    }

    fn check_shapes(&self, io_shapes: &[VectorDims]) -> Result<()> {
        if io_shapes.len() != self.compiled_shapes.len() {
            return Err(SnippetsError::shape_update(format!(
                "expected {} io shapes, got {}",
                self.compiled_shapes.len(),
                io_shapes.len()
            )));
        }
        for (i, (given, compiled)) in io_shapes.iter().zip(&self.compiled_shapes).enumerate() {
            if given.len() != compiled.len() {
                return Err(SnippetsError::shape_update(format!(
                    "io {i} changed rank from {} to {}",
                    compiled.len(),
                    given.len()
                )));
            }
            if is_dynamic_shape(given) {
                return Err(SnippetsError::shape_update(format!("io {i} shape {} is not concrete", format_dims(given))));
            }
            let fixed = compiled
                .iter()
                .zip(given)
                .all(|(&c, &g)| is_dynamic_value(c) || c == g);
            if !fixed {
                return Err(SnippetsError::shape_update(format!(
                    "io {i} shape {} contradicts compiled shape {}",
                    format_dims(given),
                    format_dims(compiled)
                )));
            }
        }
        Ok(())
    }

    fn configure(&mut self, ir: &mut LinearIR, io_shapes: &[VectorDims]) -> Result<()> {
        let dynamic = ir.is_dynamic();
        if dynamic {
            self.propagate_shapes(ir, io_shapes)?;
            Self::check_vector_broadcast(ir)?;
        }
        let access = self.access_descs(ir)?;
        self.init_domain(ir, io_shapes, &access)?;

        if dynamic {
            let mut args = vec![0i64; self.layout.len()];
            self.update_loops(ir, &mut args)?;
            self.update_buffers(ir, &mut args)?;
            self.config.loop_args = args;
        } else {
            self.config.loop_args.clear();
            self.config.buffer_offsets.clear();
            self.config.buffer_scratchpad_size = self.static_scratchpad;
        }

        for optimizer in &self.optimizers {
            if optimizer.optimize(ir, &mut self.config)? {
                debug!("{} changed parallel domain to {}", optimizer.name(), format_dims(&self.config.parallel_domain));
            }
        }

        if dynamic {
            let ir: &LinearIR = ir;
            self.config.executors.update_state(|id| {
                let expr = ir.get(id)?;
                Ok((expr.input_descs().to_vec(), expr.output_descs().to_vec()))
            })?;
        }
        self.config.io_shapes = io_shapes.to_vec();
        debug!(
            "runtime config: master {} domain {} scratchpad {} bytes, {} args",
            format_dims(&self.config.master_shape),
            format_dims(&self.config.parallel_domain),
            self.config.buffer_scratchpad_size,
            self.config.loop_args.len()
        );
        Ok(())
    }

    /// Rewrite every port shape in list order from the invocation shapes.
    fn propagate_shapes(&self, ir: &mut LinearIR, io_shapes: &[VectorDims]) -> Result<()> {
        let ids: Vec<ExprId> = ir.iter().collect();
        for id in ids {
            for i in 0..ir.get(id)?.input_count() {
                let Some(src) = ir.source(id, i)? else {
                    continue;
                };
                let stored = port_desc(ir, src)?.shape;
                let desc = &mut ir.get_mut(id)?.input_descs_mut()[i];
                desc.shape = planar_view(&stored, desc)?;
            }

            let expr = ir.get(id)?;
            let inputs = expr.input_descs();
            let out: Option<VectorDims> = match expr.op() {
                OpKind::Parameter { index } => Some(io_shapes[*index].clone()),
                OpKind::Result { index } => {
                    let expected = &io_shapes[self.params + index];
                    let derived = fit_rank(&inputs[0].shape, expected.len())?;
                    if &derived != expected {
                        return Err(SnippetsError::shape_update(format!(
                            "result {index} derives shape {} but {} was given",
                            format_dims(&derived),
                            format_dims(expected)
                        )));
                    }
                    None
                }
                OpKind::Load { .. }
                | OpKind::LoadReorder { .. }
                | OpKind::BroadcastLoad { .. }
                | OpKind::Store { .. }
                | OpKind::Fill { .. }
                | OpKind::Buffer(_)
                | OpKind::BrgemmCopyB(_)
                | OpKind::ReduceAccumulate(_) => Some(inputs[0].shape.clone()),
                OpKind::HorizonReduce(_) => {
                    let mut shape = inputs[0].shape.clone();
                    if let Some(last) = shape.last_mut() {
                        *last = 1;
                    }
                    Some(shape)
                }
                OpKind::Eltwise(kind) => {
                    let rank = inputs.iter().map(PortDescriptor::rank).max().unwrap_or(0);
                    let mut shape = vec![1; rank];
                    for input in inputs {
                        let padded = fit_rank(&input.shape, rank)?;
                        for (dst, &d) in shape.iter_mut().zip(&padded) {
                            *dst = broadcast_merge_dim(*dst, d).ok_or_else(|| {
                                SnippetsError::shape_update(format!("{kind:?} inputs are not broadcastable"))
                            })?;
                        }
                    }
                    Some(shape)
                }
                OpKind::Brgemm(_) => {
                    let (a, b) = (&inputs[0].shape, &inputs[1].shape);
                    let rank = a.len().max(b.len());
                    if rank < 2 {
                        return Err(SnippetsError::shape_update("brgemm inputs below rank 2"));
                    }
                    let (a, b) = (fit_rank(a, rank)?, fit_rank(b, rank)?);
                    let mut shape = Vec::with_capacity(rank);
                    for (&da, &db) in a[..rank - 2].iter().zip(&b[..rank - 2]) {
                        shape.push(
                            broadcast_merge_dim(da, db)
                                .ok_or_else(|| SnippetsError::shape_update("brgemm batch dimensions are not broadcastable"))?,
                        );
                    }
                    shape.push(a[rank - 2]);
                    shape.push(b[rank - 1]);
                    Some(shape)
                }
                OpKind::Scalar { .. } | OpKind::LoopBegin { .. } | OpKind::LoopEnd { .. } => None,
            };
            if let Some(shape) = out {
                for desc in ir.get_mut(id)?.output_descs_mut() {
                    desc.shape = fit_rank(&shape, desc.rank())?;
                }
            }
        }
        Ok(())
    }

    /// A plain load was compiled for a vectorized innermost dimension; a unit innermost
    /// dimension broadcast against a wider one needs a broadcast load and a new kernel.
    fn check_vector_broadcast(ir: &LinearIR) -> Result<()> {
        for id in ir.iter() {
            let expr = ir.get(id)?;
            if !matches!(expr.op(), OpKind::Eltwise(_)) {
                continue;
            }
            let Some(wide) = expr.output_descs().first().and_then(|d| d.shape.last().copied()) else {
                continue;
            };
            for i in 0..expr.input_count() {
                let Some(src) = ir.source(id, i)? else {
                    continue;
                };
                let producer = ir.get(src.expr)?;
                let narrow = matches!(producer.op(), OpKind::Load { .. } | OpKind::LoadReorder { .. })
                    && producer.input_descs()[0].shape.last() == Some(&1);
                if narrow && wide != 1 {
                    return Err(SnippetsError::shape_update(format!(
                        "{} broadcasts a unit innermost dimension that was compiled as {}",
                        expr.op(),
                        producer.op()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Descriptor through which the kernel addresses each io.
    fn access_descs(&self, ir: &LinearIR) -> Result<Vec<Option<PortDescriptor>>> {
        let mut descs = Vec::with_capacity(self.io_exprs.len());
        for (i, &id) in self.io_exprs.iter().enumerate() {
            let desc = if i < self.params {
                match ir.consumers(id, 0)?.first() {
                    Some(&consumer) => Some(port_desc(ir, consumer)?),
                    None => None,
                }
            } else {
                match ir.source(id, 0)? {
                    Some(src) => Some(port_desc(ir, src)?),
                    None => None,
                }
            };
            descs.push(desc);
        }
        Ok(descs)
    }

    fn init_domain(&mut self, ir: &LinearIR, io_shapes: &[VectorDims], access: &[Option<PortDescriptor>]) -> Result<()> {
        let planar: Vec<&VectorDims> = access
            .iter()
            .zip(io_shapes)
            .map(|(desc, shape)| desc.as_ref().map_or(shape, |d| &d.shape))
            .collect();
        let rank = planar.iter().map(|s| s.len()).max().unwrap_or(0);
        let padded: Vec<VectorDims> = planar.iter().map(|s| fit_rank(s, rank)).collect::<Result<_>>()?;
        let tile_start = rank.saturating_sub(ir.config().loop_depth.max(1));

        let mut master = vec![1; rank];
        for (d, dim) in master.iter_mut().enumerate() {
            *dim = match merge_dim(&padded, d) {
                Some(m) => m,
                None if d >= tile_start => merge_dim(&padded[self.params..], d).ok_or_else(|| {
                    SnippetsError::shape_update(format!("results disagree on tile dimension {d}"))
                })?,
                None => return Err(SnippetsError::shape_update(format!("io shapes disagree on dimension {d}"))),
            };
        }

        let mut offsets = Vec::with_capacity(padded.len());
        for (shape, desc) in padded.iter().zip(access) {
            let mut steps = vec![0; tile_start];
            if let Some(desc) = desc {
                if is_dynamic_shape(&desc.shape) {
                    return Err(SnippetsError::shape_update(format!(
                        "port shape {} is still dynamic",
                        format_dims(&desc.shape)
                    )));
                }
                let strides = desc.planar_strides(&desc.shape);
                let lead = rank - desc.rank();
                for (d, step) in steps.iter_mut().enumerate() {
                    if shape[d] != 1 && d >= lead {
                        *step = strides[d - lead] * desc.element_type.size();
                    }
                }
            }
            offsets.push(steps);
        }

        self.config.tensor_rank = rank;
        self.config.parallel_domain = master[..tile_start].to_vec();
        self.config.master_shape = master;
        self.config.io_data_offsets = offsets;
        Ok(())
    }

    /// Work amounts, pointer increments and finalization offsets of every loop. Numbers of
    /// materialized loops also go to the runtime-args table, increments in bytes per
    /// iteration and finalization offsets in bytes.
    fn update_loops(&self, ir: &mut LinearIR, args: &mut [i64]) -> Result<()> {
        for loop_id in ir.loop_manager().ids() {
            let info = ir.loop_manager().get(loop_id)?;
            let descs: Vec<PortDescriptor> = info.ports().map(|p| port_desc(ir, p.port)).collect::<Result<_>>()?;
            let full = descs.iter().map(|d| dim_at(d, info.dim_idx)).max().unwrap_or(1);
            if is_dynamic_value(full) {
                return Err(SnippetsError::shape_update(format!("loop {loop_id} work amount is unresolved")));
            }
            let (work_amount, reset) = match info.kind {
                LoopKind::Unified => (full, full),
                LoopKind::Expanded { unified_id, iter_type } => {
                    let unified_increment = ir.loop_manager().get(unified_id)?.increment;
                    let work_amount = expanded_work_amount(iter_type, full, unified_increment);
                    match iter_type {
                        SpecificIterType::MainBody => (work_amount, 0),
                        SpecificIterType::LastIter => (work_amount, full),
                    }
                }
            };

            let mut numbers = Vec::with_capacity(descs.len());
            for (port, desc) in info.ports().zip(&descs) {
                let step = if port.is_incremented { port_increment(desc, info.dim_idx) } else { 0 };
                if step == DYNAMIC_OFFSET {
                    return Err(SnippetsError::shape_update(format!("loop {loop_id} port stride is unresolved")));
                }
                numbers.push((step, -step * reset as i64, port.data_size as i64));
            }

            if let Some(slot) = self.layout.work_amount_slot(loop_id) {
                args[slot] = work_amount as i64;
                for (index, &(step, fin, size)) in numbers.iter().enumerate() {
                    if let Some(slot) = self.layout.ptr_increment_slot(loop_id, index) {
                        args[slot] = step * info.increment as i64 * size;
                    }
                    if let Some(slot) = self.layout.finalization_slot(loop_id, index) {
                        args[slot] = fin * size;
                    }
                }
            }
            trace!("loop {loop_id}: work amount {work_amount}, ports {numbers:?}");

            let info = ir.loop_manager_mut().get_mut(loop_id)?;
            info.work_amount = work_amount;
            for (port, (step, fin, _)) in info.ports_mut().zip(numbers) {
                port.ptr_increment = step;
                port.finalization_offset = fin;
            }
        }
        Ok(())
    }

    fn buffer_size(ir: &LinearIR, id: ExprId) -> Result<usize> {
        let expr = ir.get(id)?;
        if let Some(src) = ir.source(id, 0)? {
            if let OpKind::BrgemmCopyB(copy) = ir.get(src.expr)?.op() {
                let shape = &ir.get(src.expr)?.input_descs()[0].shape;
                let rank = shape.len();
                let (k, n) = (shape[rank - 2], shape[rank - 1]);
                let comp = if copy.with_compensations { n * ElementType::I32.size() } else { 0 };
                return Ok(repacked_size(k, n, copy.wei_type) + comp);
            }
        }
        let desc = &expr.input_descs()[0];
        let tile_rank = ir.config().loop_depth.max(1);
        let tile = &desc.shape[desc.rank().saturating_sub(tile_rank)..];
        Ok(tile.iter().product::<usize>() * desc.element_type.size())
    }

    /// Place buffers sized at runtime after the static part of the scratchpad.
    fn update_buffers(&mut self, ir: &LinearIR, args: &mut [i64]) -> Result<()> {
        let mut offset = self.static_scratchpad;
        let mut placed: Vec<(usize, usize)> = Vec::new();
        for id in ir.buffers() {
            let OpKind::Buffer(desc) = ir.get(id)?.op() else {
                continue;
            };
            if !is_dynamic_value(desc.offset) || placed.iter().any(|(group, _)| *group == desc.reg_group) {
                continue;
            }
            let size = Self::buffer_size(ir, id)?;
            if let Some(slot) = self.layout.buffer_offset_slot(desc.reg_group) {
                args[slot] = offset as i64;
            }
            placed.push((desc.reg_group, offset));
            offset += size;
        }
        self.config.buffer_scratchpad_size = offset;
        self.config.buffer_offsets = placed;
        Ok(())
    }
}
