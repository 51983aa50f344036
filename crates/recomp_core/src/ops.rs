//! Differentiable operations.
//!
//! Every operation computes its value eagerly. When grad mode is enabled and
//! at least one input requires grad, it also records a node and routes the
//! values its backward needs through [`Context::pack`]. Each operation saves
//! the same values in the same order on every call, which is what allows a
//! replayed computation to be matched save-by-save against the original.
//!
//! | Operation  | Saved values |
//! |------------|--------------|
//! | `add`, `sub`, `neg`, `scale` | none |
//! | `mul`, `div` | both inputs |
//! | `sin`, `cos`, `ln`, `powf`, `identity` | the input |
//! | `exp`, `tanh` | the output |
//! | `jitter` | none (the noise factor is stored on the node) |

use std::rc::Rc;

use crate::context::Context;
use crate::error::EngineResult;
use crate::graph::{CustomBackward, Node, Op};
use crate::hooks::PackedValue;
use crate::tensor::Tensor;

impl Context {
    fn record(&self, value: f64, op: Op, inputs: &[&Tensor], to_save: &[&Tensor]) -> EngineResult<Tensor> {
        let value = self.precision().round(value);
        let tracked = self.is_grad_enabled() && inputs.iter().any(|t| t.requires_grad());
        if !tracked {
            return Ok(Tensor::new(value));
        }
        let saved = to_save
            .iter()
            .map(|t| self.pack(t))
            .collect::<EngineResult<Vec<Rc<dyn PackedValue>>>>()?;
        let next = inputs.iter().map(|t| t.edge()).collect();
        Ok(Tensor::from_node(value, Rc::new(Node::new(op, next, saved))))
    }

    /// Records an operation whose output value is saved for backward.
    fn record_saving_output(&self, value: f64, op: Op, input: &Tensor) -> EngineResult<Tensor> {
        let value = self.precision().round(value);
        let output = Tensor::new(value);
        self.record(value, op, &[input], &[&output])
    }

    /// `a + b`
    pub fn add(&self, a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
        self.record(a.value() + b.value(), Op::Add, &[a, b], &[])
    }

    /// `a - b`
    pub fn sub(&self, a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
        self.record(a.value() - b.value(), Op::Sub, &[a, b], &[])
    }

    /// `a * b`
    pub fn mul(&self, a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
        self.record(a.value() * b.value(), Op::Mul, &[a, b], &[a, b])
    }

    /// `a / b`
    pub fn div(&self, a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
        self.record(a.value() / b.value(), Op::Div, &[a, b], &[a, b])
    }

    /// `-x`
    pub fn neg(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record(-x.value(), Op::Neg, &[x], &[])
    }

    /// `factor * x` for a constant factor.
    pub fn scale(&self, x: &Tensor, factor: f64) -> EngineResult<Tensor> {
        self.record(x.value() * factor, Op::Scale(factor), &[x], &[])
    }

    /// `sin(x)`
    pub fn sin(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record(x.value().sin(), Op::Sin, &[x], &[x])
    }

    /// `cos(x)`
    pub fn cos(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record(x.value().cos(), Op::Cos, &[x], &[x])
    }

    /// `exp(x)`
    pub fn exp(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record_saving_output(x.value().exp(), Op::Exp, x)
    }

    /// `ln(x)`
    pub fn ln(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record(x.value().ln(), Op::Ln, &[x], &[x])
    }

    /// `tanh(x)`
    pub fn tanh(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record_saving_output(x.value().tanh(), Op::Tanh, x)
    }

    /// `x ^ exponent` for a constant exponent.
    pub fn powf(&self, x: &Tensor, exponent: f64) -> EngineResult<Tensor> {
        self.record(x.value().powf(exponent), Op::Powf(exponent), &[x], &[x])
    }

    /// Returns `x` unchanged through a node that saves its input.
    ///
    /// The saved value is never read back by the backward; the save exists
    /// so that whoever intercepts saved values observes `x`.
    pub fn identity(&self, x: &Tensor) -> EngineResult<Tensor> {
        self.record(x.value(), Op::Identity, &[x], &[x])
    }

    /// `x * (1 + noise * e)` with `e` drawn from the context RNG.
    ///
    /// The draw happens whether or not the operation is recorded, so the RNG
    /// advances identically in tracked and untracked runs.
    pub fn jitter(&self, x: &Tensor, noise: f64) -> EngineResult<Tensor> {
        let factor = 1.0 + noise * self.normal();
        self.record(x.value() * factor, Op::Scale(factor), &[x], &[])
    }

    /// Records a user-defined operation.
    ///
    /// `value` is the already computed output, `saved` the values handed to
    /// `backward` through [`SavedTensors`](crate::SavedTensors), and
    /// `backward` must return one gradient per input.
    pub fn custom(
        &self,
        name: &'static str,
        inputs: &[Tensor],
        value: f64,
        saved: &[Tensor],
        backward: CustomBackward,
    ) -> EngineResult<Tensor> {
        let inputs: Vec<&Tensor> = inputs.iter().collect();
        let saved: Vec<&Tensor> = saved.iter().collect();
        self.record(value, Op::Custom { name, backward }, &inputs, &saved)
    }
}
