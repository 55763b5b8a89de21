//! Functions bundled with the `mpipool-worker` entry point.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde_json::{json, Value};

use crate::backend::{FunctionRegistry, Invocation, RegistryError};

/// Registry holding every built-in function.
///
/// | name        | behaviour                                                |
/// |-------------|----------------------------------------------------------|
/// | `add`       | sum of two numbers                                       |
/// | `sum`       | sum of all positional numbers                            |
/// | `echo`      | its single argument, or all arguments as an array        |
/// | `sleep`     | sleeps `args[0]` seconds, returns `args[1]` or null      |
/// | `rank_info` | `[args[0], size, rank]`                                  |
/// | `get_kwarg` | value of the keyword argument named by `args[0]`         |
/// | `init_rank` | initializer returning `{init_rank, init_pid}`            |
/// | `pid`       | process id of the rank                                   |
/// | `fail`      | raises an error with message `args[0]`                   |
/// | `exit`      | terminates the process with code `args[0]`               |
pub fn builtin_registry() -> Result<FunctionRegistry, RegistryError> {
    let mut registry = FunctionRegistry::new();
    registry.register("add", add)?;
    registry.register("sum", sum)?;
    registry.register("echo", echo)?;
    registry.register("sleep", sleep)?;
    registry.register("rank_info", rank_info)?;
    registry.register("get_kwarg", get_kwarg)?;
    registry.register("init_rank", init_rank)?;
    registry.register("pid", |_| Ok(json!(std::process::id())))?;
    registry.register("fail", fail)?;
    registry.register("exit", exit)?;
    Ok(registry)
}

fn number(inv: &Invocation, index: usize) -> anyhow::Result<&Value> {
    let value = inv
        .arg(index)
        .with_context(|| format!("missing positional argument {index}"))?;
    if !value.is_number() {
        bail!("argument {index} is not a number: {value}");
    }
    Ok(value)
}

/// Integer sum if every input is an integer, float sum otherwise.
fn add_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> anyhow::Result<Value> {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0;
    for value in values {
        let f = value
            .as_f64()
            .ok_or_else(|| anyhow!("not a number: {value}"))?;
        float_sum += f;
        int_sum = match (int_sum, value.as_i64()) {
            (Some(acc), Some(i)) => acc.checked_add(i),
            _ => None,
        };
    }
    Ok(match int_sum {
        Some(i) => json!(i),
        None => json!(float_sum),
    })
}

fn add(inv: Invocation) -> anyhow::Result<Value> {
    add_values([number(&inv, 0)?, number(&inv, 1)?])
}

fn sum(inv: Invocation) -> anyhow::Result<Value> {
    add_values(&inv.args)
}

fn echo(inv: Invocation) -> anyhow::Result<Value> {
    let mut args = inv.args;
    Ok(if args.len() == 1 {
        args.remove(0)
    } else {
        Value::Array(args)
    })
}

fn sleep(inv: Invocation) -> anyhow::Result<Value> {
    let seconds = number(&inv, 0)?.as_f64().unwrap_or_default();
    if seconds < 0.0 {
        bail!("cannot sleep for a negative duration");
    }
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(inv.arg(1).cloned().unwrap_or(Value::Null))
}

fn rank_info(inv: Invocation) -> anyhow::Result<Value> {
    let tag = inv.arg(0).cloned().unwrap_or(Value::Null);
    Ok(json!([tag, inv.size, inv.rank]))
}

fn get_kwarg(inv: Invocation) -> anyhow::Result<Value> {
    let name = inv
        .arg(0)
        .and_then(Value::as_str)
        .context("expected the keyword name as first argument")?;
    Ok(inv.kwarg(name).cloned().unwrap_or(Value::Null))
}

fn init_rank(inv: Invocation) -> anyhow::Result<Value> {
    Ok(json!({
        "init_rank": inv.rank,
        "init_pid": std::process::id(),
    }))
}

fn fail(inv: Invocation) -> anyhow::Result<Value> {
    let message = inv
        .arg(0)
        .and_then(Value::as_str)
        .unwrap_or("requested failure");
    bail!("{message}")
}

fn exit(inv: Invocation) -> anyhow::Result<Value> {
    let code = inv.arg(0).and_then(Value::as_i64).unwrap_or(1);
    std::process::exit(code as i32)
}
