// Copyright 2019 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The standard kernel set. Control-flow *propagation* (deadness, frames,
//! iterations) lives in the scheduler; the kernels here only move data.

use std::sync::Arc;

use devices::DeviceType;
use graph::{ops, NodeDef};
use status::{Result, Status};
use tensor::{DataType, Tensor};

use crate::kernel::{AsyncDone, AsyncOpKernel, KernelRegistry, OpKernel, OpKernelContext};
use crate::rendezvous::RendezvousKey;

/// Forwards input 0 unchanged: Identity, Enter, Exit, NextIteration and
/// LoopCond all move values without touching them.
struct ForwardOp;

impl OpKernel for ForwardOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let t = ctx.input(0)?.clone();
        ctx.set_output(0, t)
    }
}

struct ConstOp {
    value: Tensor,
}

impl ConstOp {
    fn create(def: &NodeDef) -> Result<Arc<dyn OpKernel>> {
        let value = def
            .attr_tensor("value")
            .ok_or_else(|| {
                Status::invalid_argument(format!("Const node `{}` has no value attr", def.name))
            })?
            .to_tensor()?;
        Ok(Arc::new(ConstOp { value }))
    }
}

impl OpKernel for ConstOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        ctx.set_output(0, self.value.clone())
    }
}

struct ArgOp {
    index: usize,
}

impl OpKernel for ArgOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let frame = ctx
            .call_frame
            .clone()
            .ok_or_else(|| Status::invalid_argument("_Arg requires a call frame"))?;
        let t = frame.arg(self.index)?;
        ctx.set_output(0, t)
    }
}

struct RetvalOp {
    index: usize,
}

impl OpKernel for RetvalOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let frame = ctx
            .call_frame
            .clone()
            .ok_or_else(|| Status::invalid_argument("_Retval requires a call frame"))?;
        frame.set_retval(self.index, ctx.input(0)?.clone())
    }
}

fn attr_index(def: &NodeDef) -> Result<usize> {
    def.attr_i64("index")
        .filter(|i| *i >= 0)
        .map(|i| i as usize)
        .ok_or_else(|| {
            Status::invalid_argument(format!("node `{}` has no index attr", def.name))
        })
}

fn check_binary_operands(ctx: &OpKernelContext) -> Result<(Tensor, Tensor)> {
    let a = ctx.input(0)?.clone();
    let b = ctx.input(1)?.clone();
    if a.dtype() != b.dtype() || a.shape() != b.shape() {
        return Err(Status::invalid_argument(format!(
            "node `{}` operands disagree: {a} vs {b}",
            ctx.node_name
        )));
    }
    Ok((a, b))
}

fn compute_binary(
    ctx: &mut OpKernelContext,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<()> {
    let (a, b) = check_binary_operands(ctx)?;
    let mut out = ctx.allocate_tensor(a.dtype(), a.shape().clone())?;
    for i in 0..a.num_elements() {
        match a.dtype() {
            DataType::Int32 => {
                out.set_i32(i, int_op(i64::from(a.i32_at(i)?), i64::from(b.i32_at(i)?)) as i32)?
            }
            DataType::Int64 => out.set_i64(i, int_op(a.i64_at(i)?, b.i64_at(i)?))?,
            DataType::Float => {
                out.set_f32(i, float_op(f64::from(a.f32_at(i)?), f64::from(b.f32_at(i)?)) as f32)?
            }
            DataType::Double => out.set_f64(i, float_op(a.f64_at(i)?, b.f64_at(i)?))?,
            DataType::Bool => {
                return Err(Status::invalid_argument(format!(
                    "node `{}` does not support bool operands",
                    ctx.node_name
                )))
            }
        }
    }
    ctx.set_output(0, out)
}

struct AddOp;

impl OpKernel for AddOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        compute_binary(ctx, |a, b| a.wrapping_add(b), |a, b| a + b)
    }
}

struct MulOp;

impl OpKernel for MulOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        compute_binary(ctx, |a, b| a.wrapping_mul(b), |a, b| a * b)
    }
}

struct LessOp;

impl OpKernel for LessOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let (a, b) = check_binary_operands(ctx)?;
        let mut out = ctx.allocate_tensor(DataType::Bool, a.shape().clone())?;
        for i in 0..a.num_elements() {
            let lt = match a.dtype() {
                DataType::Int32 => a.i32_at(i)? < b.i32_at(i)?,
                DataType::Int64 => a.i64_at(i)? < b.i64_at(i)?,
                DataType::Float => a.f32_at(i)? < b.f32_at(i)?,
                DataType::Double => a.f64_at(i)? < b.f64_at(i)?,
                DataType::Bool => {
                    return Err(Status::invalid_argument(format!(
                        "node `{}` does not support bool operands",
                        ctx.node_name
                    )))
                }
            };
            out.set_bool(i, lt)?;
        }
        ctx.set_output(0, out)
    }
}

/// Routes the data input to output 1 when the predicate is true, output 0
/// when false. The untaken output is left unset; the scheduler reads that as
/// dead.
struct SwitchOp;

impl OpKernel for SwitchOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let data = ctx.input(0)?.clone();
        let pred = ctx.input(1)?.as_scalar_bool()?;
        let port = usize::from(pred);
        ctx.set_output(port, data)
    }
}

/// Forwards the first live input. The scheduler only dispatches a live Merge
/// once at least one input arrived live.
struct MergeOp;

impl OpKernel for MergeOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        for i in 0..ctx.num_inputs() {
            if !ctx.input_is_dead(i) {
                let t = ctx.input(i)?.clone();
                return ctx.set_output(0, t);
            }
        }
        Err(Status::internal(format!(
            "Merge node `{}` ran with every input dead",
            ctx.node_name
        )))
    }
}

struct SendOp {
    tensor_name: String,
    send_device: String,
    recv_device: String,
}

fn transfer_attrs(def: &NodeDef) -> Result<(String, String, String)> {
    let tensor_name = def
        .attr_str("tensor_name")
        .unwrap_or(def.name.as_str())
        .to_owned();
    let send_device = def
        .attr_str("send_device")
        .ok_or_else(|| {
            Status::invalid_argument(format!("node `{}` has no send_device attr", def.name))
        })?
        .to_owned();
    let recv_device = def
        .attr_str("recv_device")
        .ok_or_else(|| {
            Status::invalid_argument(format!("node `{}` has no recv_device attr", def.name))
        })?
        .to_owned();
    Ok((tensor_name, send_device, recv_device))
}

impl SendOp {
    fn key(&self, ctx: &OpKernelContext) -> RendezvousKey {
        RendezvousKey {
            src_device: self.send_device.clone(),
            dst_device: self.recv_device.clone(),
            tensor_name: self.tensor_name.clone(),
            frame_id: ctx.frame_id,
            iter: ctx.iter,
        }
    }
}

impl OpKernel for SendOp {
    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let rendezvous = ctx
            .rendezvous
            .clone()
            .ok_or_else(|| Status::internal("_Send requires a rendezvous"))?;
        // Send runs even when its input is dead so deadness crosses devices.
        let value = ctx.inputs.first().cloned().flatten();
        let is_dead = ctx.is_input_dead;
        rendezvous.send(self.key(ctx), value, is_dead)
    }
}

struct RecvOp {
    tensor_name: String,
    send_device: String,
    recv_device: String,
}

impl OpKernel for RecvOp {
    fn compute(&self, _ctx: &mut OpKernelContext) -> Result<()> {
        Err(Status::internal("_Recv must be dispatched asynchronously"))
    }

    fn as_async(&self) -> Option<&dyn AsyncOpKernel> {
        Some(self)
    }
}

impl AsyncOpKernel for RecvOp {
    fn compute_async(&self, ctx: OpKernelContext, done: AsyncDone) {
        let rendezvous = match ctx.rendezvous.clone() {
            Some(r) => r,
            None => {
                let mut ctx = ctx;
                ctx.set_status(Status::internal("_Recv requires a rendezvous"));
                done(ctx);
                return;
            }
        };
        let key = RendezvousKey {
            src_device: self.send_device.clone(),
            dst_device: self.recv_device.clone(),
            tensor_name: self.tensor_name.clone(),
            frame_id: ctx.frame_id,
            iter: ctx.iter,
        };
        rendezvous.recv_async(
            key,
            Box::new(move |result| {
                let mut ctx = ctx;
                match result {
                    Ok((value, is_dead)) => {
                        if !is_dead {
                            if let Some(t) = value {
                                if let Err(e) = ctx.set_output(0, t) {
                                    ctx.set_status(e);
                                }
                            }
                        }
                        // A dead transfer leaves the output unset.
                    }
                    Err(e) => ctx.set_status(e),
                }
                done(ctx);
            }),
        );
    }
}

pub(crate) fn register_standard_kernels(registry: &KernelRegistry) {
    let cpu = DeviceType::cpu();
    let forwarding = [
        "Identity",
        ops::ENTER,
        ops::EXIT,
        ops::NEXT_ITERATION,
        ops::LOOP_COND,
    ];
    for op in forwarding {
        registry.register(op, &cpu, false, Box::new(|_| Ok(Arc::new(ForwardOp))));
    }
    registry.register("Const", &cpu, false, Box::new(ConstOp::create));
    registry.register(
        ops::ARG,
        &cpu,
        false,
        Box::new(|def| Ok(Arc::new(ArgOp { index: attr_index(def)? }))),
    );
    registry.register(
        ops::RETVAL,
        &cpu,
        false,
        Box::new(|def| Ok(Arc::new(RetvalOp { index: attr_index(def)? }))),
    );
    registry.register("Add", &cpu, false, Box::new(|_| Ok(Arc::new(AddOp))));
    registry.register("Mul", &cpu, false, Box::new(|_| Ok(Arc::new(MulOp))));
    registry.register("Less", &cpu, false, Box::new(|_| Ok(Arc::new(LessOp))));
    registry.register(ops::SWITCH, &cpu, false, Box::new(|_| Ok(Arc::new(SwitchOp))));
    registry.register(ops::MERGE, &cpu, false, Box::new(|_| Ok(Arc::new(MergeOp))));
    registry.register(
        ops::SEND,
        &cpu,
        false,
        Box::new(|def| {
            let (tensor_name, send_device, recv_device) = transfer_attrs(def)?;
            Ok(Arc::new(SendOp {
                tensor_name,
                send_device,
                recv_device,
            }))
        }),
    );
    registry.register(
        ops::RECV,
        &cpu,
        false,
        Box::new(|def| {
            let (tensor_name, send_device, recv_device) = transfer_attrs(def)?;
            Ok(Arc::new(RecvOp {
                tensor_name,
                send_device,
                recv_device,
            }))
        }),
    );
}

/// A convenience for graph builders: the scalar Tensor `value` as a Const
/// attr.
pub fn const_value(value: Tensor) -> Result<graph::AttrValue> {
    Ok(graph::AttrValue::Tensor(tensor::TensorDef::from_tensor(
        &value,
    )?))
}
