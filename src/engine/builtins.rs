use crate::engine::HostContext;
use crate::engine::interpreter::{Interpreter, new_symbol};
use crate::engine::value::{Object, Value};
use crate::intrinsics::{self, FuzzOutput, INTRINSIC_BINDINGS};

const ERROR_CONSTRUCTORS: [&str; 5] = [
    "Error",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "ReferenceError",
];

/// Populate the global scope of a fresh interpreter.
pub fn install(interp: &mut Interpreter, host: &HostContext) {
    let globals = interp.globals().clone();

    globals.declare("undefined", Value::Undefined, false);
    globals.declare("NaN", Value::Number(f64::NAN), false);
    globals.declare("Infinity", Value::Number(f64::INFINITY), false);

    for binding in INTRINSIC_BINDINGS {
        let output = host.output.clone();
        let intrinsic = Value::native(binding, move |interp, args| {
            intrinsics::dispatch(interp, &output, args)?;
            Ok(Value::Undefined)
        });
        globals.declare(binding, intrinsic, true);
    }

    // Plain printing always goes to stdout, never to the fuzzer channel.
    let stdout = FuzzOutput::stdout();
    globals.declare("print", print_to(stdout.clone(), "print"), true);
    let mut console = Object::new();
    console.set("log", print_to(stdout, "log"));
    globals.declare("console", Value::object(console), true);

    globals.declare(
        "queueMicrotask",
        Value::native("queueMicrotask", |interp, args| match args.first() {
            Some(job @ Value::Function(_)) => {
                interp.enqueue_job(job.clone());
                Ok(Value::Undefined)
            }
            _ => Err(interp.throw_error(
                "TypeError",
                "The callback provided as parameter 1 is not a function.",
            )),
        }),
        true,
    );

    globals.declare(
        "Symbol",
        Value::native("Symbol", |interp, args| {
            let description = match args.first() {
                None | Some(Value::Undefined) => None,
                Some(value) => Some(interp.to_display(value)?),
            };
            Ok(new_symbol(description))
        }),
        true,
    );

    globals.declare(
        "String",
        Value::native("String", |interp, args| match args.first() {
            None => Ok(Value::string("")),
            Some(value) => Ok(Value::string(interp.to_display(value)?)),
        }),
        true,
    );

    for name in ERROR_CONSTRUCTORS {
        globals.declare(
            name,
            Value::native(name, move |interp, args| {
                let message = match args.first() {
                    None | Some(Value::Undefined) => String::new(),
                    Some(value) => interp.to_display(value)?,
                };
                Ok(Value::object(Object::error(name, &message)))
            }),
            true,
        );
    }
}

fn print_to(output: FuzzOutput, name: &'static str) -> Value {
    Value::native(name, move |interp, args| {
        let mut line = output.line();
        for arg in args {
            let text = interp.to_display(arg)?;
            if let Err(err) = line.push_arg(&text) {
                eprintln!("[REPRL] {name} failed: {err}");
                return Ok(Value::Undefined);
            }
        }
        if let Err(err) = line.finish() {
            eprintln!("[REPRL] {name} failed: {err}");
        }
        Ok(Value::Undefined)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptEngine;
    use crate::intrinsics::tests::Captured;

    fn eval_print(src: &str) -> String {
        let captured = Captured::default();
        let mut interp = Interpreter::init(HostContext {
            output: FuzzOutput::new(captured.clone()),
        });
        let program = interp.parse(src).unwrap();
        interp.run(program).unwrap();
        interp.drain_jobs().unwrap();
        String::from_utf8(captured.contents()).unwrap()
    }

    #[test]
    fn error_constructors_build_error_objects() {
        assert_eq!(
            eval_print("fuzzilli('FUZZILLI_PRINT', new RangeError('r'), Error(), TypeError('t').name);"),
            "RangeError: r Error TypeError\n"
        );
    }

    #[test]
    fn string_and_symbol_conversions() {
        assert_eq!(
            eval_print("fuzzilli('FUZZILLI_PRINT', String(12), String(), Symbol().description, Symbol('d').description);"),
            "12  undefined d\n"
        );
    }

    #[test]
    fn globals_are_fresh_per_instance() {
        assert_eq!(eval_print("var leaked = 1;"), "");
        assert_eq!(eval_print("fuzzilli('FUZZILLI_PRINT', typeof leaked);"), "undefined\n");
    }

    #[test]
    fn queue_microtask_rejects_non_functions() {
        let mut interp = Interpreter::init(HostContext {
            output: FuzzOutput::new(Captured::default()),
        });
        let program = interp.parse("queueMicrotask(1);").unwrap();
        assert!(interp.run(program).is_err());
    }

    #[test]
    fn jobs_queued_while_draining_also_run() {
        let src = r#"
            queueMicrotask(() => {
                fuzzilli('FUZZILLI_PRINT', 'a');
                queueMicrotask(() => fuzzilli('FUZZILLI_PRINT', 'c'));
            });
            queueMicrotask(() => fuzzilli('FUZZILLI_PRINT', 'b'));
        "#;
        assert_eq!(eval_print(src), "a\nb\nc\n");
    }
}
