//! Integration tests for custom functions and gradient hooks.

use approx::assert_relative_eq;
use gradbridge::autograd::{
    AutogradContext, BackwardOptions, CustomFunction, Function, Variable, VariableList,
    apply_function, clear_graph,
};
use gradbridge::operations::{apply, scale};
use gradbridge::{AutogradError, DenseTensor};
use std::cell::RefCell;
use std::rc::Rc;

fn tensor(data: &[f64]) -> DenseTensor<f64> {
    DenseTensor::from_vec(data.to_vec(), &[data.len()]).unwrap()
}

/// f(a, b) = a + mul*b + a*b with mul kept in the scratch map.
struct MulAdd {
    mul: i64,
}

impl CustomFunction for MulAdd {
    fn name(&self) -> &str {
        "MulAdd"
    }

    fn forward(
        &self,
        ctx: &mut AutogradContext,
        inputs: VariableList,
    ) -> Result<VariableList, AutogradError> {
        ctx.set("mul", self.mul);
        ctx.save_for_backward(inputs.clone());

        let a = inputs.get(0)?;
        let b = inputs.get(1)?;
        let out = a
            .add(&b.mul_scalar(self.mul as f64)?)?
            .add(&a.mul(b)?)?;
        Ok(vec![out].into())
    }

    fn backward(
        &self,
        ctx: &mut AutogradContext,
        grad_outputs: VariableList,
    ) -> Result<VariableList, AutogradError> {
        let mul = ctx.get_int("mul")? as f64;
        let saved = ctx.get_saved_variables()?;
        let (a, b) = (saved.get(0)?, saved.get(1)?);
        let g = grad_outputs.get(0)?;

        let grad_a = g.add(&g.mul(b)?)?;
        let grad_b = g.mul_scalar(mul)?.add(&g.mul(a)?)?;
        Ok(vec![grad_a, grad_b].into())
    }
}

#[test]
fn test_variable_list_push_and_get() {
    let values = [3.0, -1.0, 0.5, 8.0];
    let mut list = VariableList::new();
    for &v in &values {
        list.push(Variable::new(DenseTensor::scalar(v)));
    }

    assert_eq!(list.len(), values.len());
    for (i, &v) in values.iter().enumerate() {
        assert_eq!(list.get(i).unwrap().tensor().unwrap().item().unwrap(), v);
    }
    assert!(matches!(
        list.get(values.len()),
        Err(AutogradError::OutOfRange { .. })
    ));
}

#[test]
fn test_bridge_function_gradient_check() {
    clear_graph();

    let a_data = [0.5, -1.0, 2.0];
    let b_data = [1.5, 3.0, -0.25];
    let a = Variable::leaf(tensor(&a_data));
    let b = Variable::leaf(tensor(&b_data));

    let outputs = Function::apply(
        vec![a.clone(), b.clone()].into(),
        |ctx: &mut AutogradContext, inputs: VariableList| {
            ctx.save_for_backward(inputs.clone());
            let (a, b) = (inputs.get(0)?, inputs.get(1)?);
            Ok(vec![a.add(b)?.add(&a.mul(b)?)?].into())
        },
        |ctx: &mut AutogradContext, grads: VariableList| {
            let saved = ctx.get_saved_variables()?;
            let g = grads.get(0)?;
            Ok(vec![
                g.add(&g.mul(saved.get(1)?)?)?,
                g.add(&g.mul(saved.get(0)?)?)?,
            ]
            .into())
        },
    )
    .unwrap();

    outputs[0].sum().unwrap().backward().unwrap();

    let grad_a = a.grad().unwrap();
    let grad_b = b.grad().unwrap();
    for i in 0..3 {
        assert_relative_eq!(grad_a.data()[i], 1.0 + b_data[i]);
        assert_relative_eq!(grad_b.data()[i], 1.0 + a_data[i]);
    }
}

#[test]
fn test_end_to_end_mul_two() {
    clear_graph();

    let a_data = [1.0, 2.0, 3.0];
    let b_data = [-2.0, 0.5, 4.0];
    let a = Variable::leaf(tensor(&a_data));
    let b = Variable::leaf(tensor(&b_data));

    let outputs = apply_function(MulAdd { mul: 2 }, vec![a.clone(), b.clone()].into()).unwrap();
    let out = outputs[0].tensor().unwrap();
    for i in 0..3 {
        let expected = a_data[i] + 2.0 * b_data[i] + a_data[i] * b_data[i];
        assert_relative_eq!(out.data()[i], expected);
    }

    outputs[0]
        .backward_with(Some(&DenseTensor::ones(&[3])), Default::default())
        .unwrap();

    let grad_a = a.grad().unwrap();
    let grad_b = b.grad().unwrap();
    for i in 0..3 {
        assert_relative_eq!(grad_a.data()[i], 1.0 + b_data[i]);
        assert_relative_eq!(grad_b.data()[i], 2.0 + a_data[i]);
    }
}

#[test]
fn test_saved_variables_in_order() {
    clear_graph();

    let x = Variable::leaf(tensor(&[1.0]));
    let y = Variable::new(tensor(&[2.0]));
    let z = Variable::new(tensor(&[3.0]));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);

    let outputs = Function::apply(
        vec![x.clone(), y.clone(), z.clone()].into(),
        |ctx: &mut AutogradContext, inputs: VariableList| {
            let (x, y, z) = (inputs.get(0)?, inputs.get(1)?, inputs.get(2)?);
            ctx.save_for_backward(vec![z.clone(), x.clone(), y.clone()].into());
            Ok(vec![x.clone()].into())
        },
        move |ctx: &mut AutogradContext, grads: VariableList| {
            let saved = ctx.get_saved_variables()?;
            for v in &saved {
                log.borrow_mut().push(v.tensor()?.item()?);
            }
            let g = grads.get(0)?.clone();
            Ok(vec![g, Variable::undefined(), Variable::undefined()].into())
        },
    )
    .unwrap();

    outputs[0].sum().unwrap().backward().unwrap();
    assert_eq!(*seen.borrow(), vec![3.0, 1.0, 2.0]);
}

#[test]
fn test_saving_nothing_yields_empty_set() {
    clear_graph();

    let x = Variable::leaf(tensor(&[1.0, 1.0]));
    let empty = Rc::new(RefCell::new(None));
    let log = Rc::clone(&empty);

    let outputs = Function::apply(
        vec![x].into(),
        |_ctx: &mut AutogradContext, inputs: VariableList| Ok(inputs),
        move |ctx: &mut AutogradContext, grads: VariableList| {
            *log.borrow_mut() = Some(ctx.get_saved_variables()?.is_empty());
            Ok(grads)
        },
    )
    .unwrap();

    outputs[0].sum().unwrap().backward().unwrap();
    assert_eq!(*empty.borrow(), Some(true));
}

#[test]
fn test_scratch_map_across_forward_and_backward() {
    clear_graph();

    let x = Variable::leaf(tensor(&[1.0]));
    let results = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&results);

    let outputs = Function::apply(
        vec![x].into(),
        |ctx: &mut AutogradContext, inputs: VariableList| {
            ctx.set("k", 42);
            ctx.set("ratio", 0.5);
            Ok(inputs)
        },
        move |ctx: &mut AutogradContext, grads: VariableList| {
            log.borrow_mut().push(ctx.get_int("k"));
            log.borrow_mut().push(ctx.get_int("never_written"));
            log.borrow_mut().push(ctx.get_int("ratio"));
            Ok(grads)
        },
    )
    .unwrap();

    outputs[0].sum().unwrap().backward().unwrap();

    let results = results.borrow();
    assert_eq!(results[0], Ok(42));
    assert!(matches!(results[1], Err(AutogradError::TypeMismatch { .. })));
    assert!(matches!(results[2], Err(AutogradError::TypeMismatch { .. })));
}

#[test]
fn test_hook_pipeline_on_function_output() {
    clear_graph();

    let x = Variable::leaf(tensor(&[1.0, 2.0]));
    let zero = Variable::new(tensor(&[0.0, 0.0]));
    let outputs = apply_function(MulAdd { mul: 0 }, vec![x.clone(), zero].into()).unwrap();
    let t = &outputs[0];

    // h1(g) = g + 1, h2(g) = 3g, so the propagated gradient is 3(g + 1).
    let h1 = t
        .register_hook(|g: DenseTensor<f64>| -> Result<DenseTensor<f64>, AutogradError> {
            Ok(apply(&g, |v| v + 1.0))
        })
        .unwrap();
    t.register_hook(|g: DenseTensor<f64>| -> Result<DenseTensor<f64>, AutogradError> {
        Ok(scale(&g, 3.0))
    })
    .unwrap();

    let seed = tensor(&[1.0, 2.0]);
    let retain = BackwardOptions::new().retain_graph(true);
    t.backward_with(Some(&seed), retain).unwrap();
    // grad(a) = g' * (1 + b) with b = 0
    assert_eq!(x.grad().unwrap().data(), &[6.0, 9.0]);

    // After removal only h2 runs.
    t.remove_hook(h1).unwrap();
    x.zero_grad();
    t.backward_with(Some(&seed), retain).unwrap();
    assert_eq!(x.grad().unwrap().data(), &[3.0, 6.0]);

    assert_eq!(
        t.remove_hook(h1),
        Err(AutogradError::InvalidHookToken { token: h1 })
    );
}

#[test]
fn test_removed_hook_is_skipped() {
    clear_graph();

    let x = Variable::leaf(tensor(&[1.0, 1.0]));
    let calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&calls);

    let token = x
        .register_hook(move |g: DenseTensor<f64>| -> Result<DenseTensor<f64>, AutogradError> {
            *counter.borrow_mut() += 1;
            Ok(g)
        })
        .unwrap();

    x.sum().unwrap().backward().unwrap();
    x.remove_hook(token).unwrap();
    x.sum().unwrap().backward().unwrap();

    assert_eq!(*calls.borrow(), 1);
    assert_eq!(x.grad().unwrap().data(), &[2.0, 2.0]);
}

#[test]
fn test_failing_backward_propagates_error() {
    clear_graph();

    let x = Variable::leaf(tensor(&[1.0]));
    let outputs = Function::apply(
        vec![x.clone()].into(),
        |_ctx: &mut AutogradContext, inputs: VariableList| Ok(inputs),
        |_ctx: &mut AutogradContext, _grads: VariableList| {
            Err(AutogradError::Callback {
                message: "refused".to_string(),
            })
        },
    )
    .unwrap();

    assert_eq!(
        outputs[0].sum().unwrap().backward(),
        Err(AutogradError::Callback {
            message: "refused".to_string()
        })
    );
    assert!(x.grad().is_none());
}
