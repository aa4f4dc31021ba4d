use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use swc_ecma_visit::swc_ecma_ast::*;

use crate::engine::builtins;
use crate::engine::parser::{cook_string, parse_script};
use crate::engine::value::{
    Array, AssignError, Closure, Completion, Env, Function, FunctionBody, Object, ObjectClass,
    Symbol, Value, WeakRef, format_number, to_int32,
};
use crate::engine::{HostContext, ScriptEngine, ScriptError};
use crate::intrinsics::IntrinsicHost;

/// Calls nested deeper than this throw a RangeError instead of exhausting
/// the native stack.
const MAX_CALL_DEPTH: usize = 200;
/// Combined depth of statement, expression and array-join recursion.
const MAX_NESTING: usize = 1000;
/// Longest array that string conversion will join.
const MAX_JOIN_LENGTH: usize = 1 << 20;
const MIN_PRUNE: usize = 256;

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// A small tree-walking interpreter for a JavaScript subset.
pub struct Interpreter {
    globals: Env,
    jobs: VecDeque<Value>,
    depth: usize,
    nesting: usize,
    /// Arrays whose string form is being built, for cycle detection.
    joining: Vec<*const RefCell<Array>>,
    /// Scopes and written-to containers, cleared on drop.
    heap: Vec<WeakRef>,
    prune_at: usize,
}

impl ScriptEngine for Interpreter {
    type Program = Script;

    fn init(host: HostContext) -> Self {
        let mut interp = Self {
            globals: Env::root(),
            jobs: VecDeque::new(),
            depth: 0,
            nesting: 0,
            joining: Vec::new(),
            heap: Vec::new(),
            prune_at: MIN_PRUNE,
        };
        builtins::install(&mut interp, &host);
        interp
    }

    fn parse(&mut self, source: &str) -> Result<Script, ScriptError> {
        parse_script(source)
    }

    fn run(&mut self, program: Script) -> Result<(), ScriptError> {
        let env = self.globals.clone();
        self.hoist_functions(&program.body, &env);
        for stmt in &program.body {
            match self.exec_stmt(stmt, &env) {
                Ok(Flow::Normal) => {}
                Ok(_) => break,
                Err(thrown) => return Err(self.uncaught(thrown)),
            }
        }
        Ok(())
    }

    fn drain_jobs(&mut self) -> Result<(), ScriptError> {
        while let Some(job) = self.jobs.pop_front() {
            if let Err(thrown) = self.call(&job, &[]) {
                return Err(self.uncaught(thrown));
            }
        }
        Ok(())
    }
}

// Closures capture the scopes that hold them and objects can hold themselves,
// so dropping the interpreter alone would leak those graphs every iteration.
impl Drop for Interpreter {
    fn drop(&mut self) {
        self.jobs.clear();
        self.globals.clear();
        for handle in self.heap.drain(..) {
            handle.clear();
        }
    }
}

impl IntrinsicHost for Interpreter {
    type Value = Value;
    type Error = Value;

    fn selector<'v>(&self, value: &'v Value) -> Option<&'v str> {
        match value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn crash_variant(&mut self, value: Option<&Value>) -> i64 {
        match value.map(Value::primitive_number) {
            None => 0,
            Some(Some(n)) if n.is_finite() => n as i64,
            Some(Some(_)) => 0,
            Some(None) => 1,
        }
    }

    fn to_display(&mut self, value: &Value) -> Completion<String> {
        Interpreter::to_display(self, value)
    }
}

impl Interpreter {
    pub fn globals(&self) -> &Env {
        &self.globals
    }

    pub fn enqueue_job(&mut self, job: Value) {
        self.jobs.push_back(job);
    }

    fn child_scope(&mut self, parent: &Env) -> Env {
        let scope = parent.child();
        self.track(scope.downgrade());
        scope
    }

    fn track(&mut self, handle: WeakRef) {
        if self.heap.len() >= self.prune_at {
            self.heap.retain(WeakRef::is_live);
            self.prune_at = (self.heap.len() * 2).max(MIN_PRUNE);
        }
        self.heap.push(handle);
    }

    fn uncaught(&mut self, thrown: Value) -> ScriptError {
        let text = self
            .to_display(&thrown)
            .unwrap_or_else(|_| "exception while converting exception".to_string());
        ScriptError::Uncaught(text)
    }

    pub fn throw_error(&self, name: &str, message: impl AsRef<str>) -> Value {
        Value::object(Object::error(name, message.as_ref()))
    }

    /// String form used by `print` and `String()`: symbols show their
    /// description, objects go through their `toString` method.
    pub fn to_display(&mut self, value: &Value) -> Completion<String> {
        Ok(match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Symbol(sym) => format!("Symbol({})", sym.description.as_deref().unwrap_or("")),
            Value::Function(func) => format!("function {}() {{ [native code] }}", func.name()),
            Value::Array(items) => {
                // a cycle joins as the empty string
                if self.joining.contains(&Rc::as_ptr(items)) {
                    return Ok(String::new());
                }
                if items.borrow().length() > MAX_JOIN_LENGTH {
                    return Err(self.throw_error("RangeError", "Invalid string length"));
                }
                self.enter()?;
                self.joining.push(Rc::as_ptr(items));
                let joined = self.join_array(items);
                self.joining.pop();
                self.nesting -= 1;
                joined?
            }
            Value::Object(obj) => {
                let (class, to_string) = {
                    let obj = obj.borrow();
                    (obj.class, obj.get("toString"))
                };
                if let Some(method @ Value::Function(_)) = to_string {
                    let result = self.call(&method, &[])?;
                    if matches!(result, Value::Object(_) | Value::Array(_)) {
                        return Err(self.throw_error("TypeError", "Cannot convert object to primitive value"));
                    }
                    return self.to_display(&result);
                }
                if class == ObjectClass::Error {
                    let (name, message) = {
                        let obj = obj.borrow();
                        (obj.get("name"), obj.get("message"))
                    };
                    let name = name.map_or(Ok("Error".to_string()), |v| self.to_display(&v))?;
                    let message = message.map_or(Ok(String::new()), |v| self.to_display(&v))?;
                    if message.is_empty() { name } else { format!("{name}: {message}") }
                } else {
                    "[object Object]".to_string()
                }
            }
        })
    }

    fn join_array(&mut self, items: &Rc<RefCell<Array>>) -> Completion<String> {
        let values = items.borrow().values();
        let mut parts = Vec::with_capacity(values.len());
        for item in &values {
            parts.push(if item.is_nullish() {
                String::new()
            } else {
                self.to_display(item)?
            });
        }
        Ok(parts.join(","))
    }

    fn enter(&mut self) -> Completion<()> {
        if self.nesting >= MAX_NESTING {
            return Err(self.throw_error("RangeError", "Maximum nesting depth exceeded"));
        }
        self.nesting += 1;
        Ok(())
    }

    /// String conversion as used by operators; symbols refuse.
    fn to_string_op(&mut self, value: &Value) -> Completion<String> {
        if let Value::Symbol(_) = value {
            return Err(self.throw_error("TypeError", "Cannot convert a Symbol value to a string"));
        }
        self.to_display(value)
    }

    fn to_number(&mut self, value: &Value) -> Completion<f64> {
        match value {
            Value::Symbol(_) => {
                Err(self.throw_error("TypeError", "Cannot convert a Symbol value to a number"))
            }
            Value::Object(_) | Value::Array(_) | Value::Function(_) => {
                let text = self.to_display(value)?;
                Ok(Value::string(text).primitive_number().unwrap_or(f64::NAN))
            }
            _ => Ok(value.primitive_number().unwrap_or(f64::NAN)),
        }
    }

    pub fn call(&mut self, callee: &Value, args: &[Value]) -> Completion<Value> {
        let Value::Function(func) = callee else {
            let shown = self.to_display(callee).unwrap_or_default();
            return Err(self.throw_error("TypeError", format!("{shown} is not a function")));
        };
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.throw_error("RangeError", "Maximum call stack size exceeded"));
        }
        self.depth += 1;
        let result = self.call_function(func, args);
        self.depth -= 1;
        result
    }

    fn call_function(&mut self, func: &Rc<Function>, args: &[Value]) -> Completion<Value> {
        match &**func {
            Function::Native { call, .. } => call(self, args),
            Function::Closure(closure) => {
                let env = self.child_scope(&closure.env);
                for (i, param) in closure.params.iter().enumerate() {
                    env.declare(param, args.get(i).cloned().unwrap_or(Value::Undefined), true);
                }
                match &closure.body {
                    FunctionBody::Expr(expr) => self.eval(expr, &env),
                    FunctionBody::Block(block) => {
                        self.hoist_functions(&block.stmts, &env);
                        for stmt in &block.stmts {
                            match self.exec_stmt(stmt, &env)? {
                                Flow::Normal => {}
                                Flow::Return(value) => return Ok(value),
                                Flow::Break | Flow::Continue => break,
                            }
                        }
                        Ok(Value::Undefined)
                    }
                }
            }
        }
    }

    fn hoist_functions(&mut self, stmts: &[Stmt], env: &Env) {
        for stmt in stmts {
            if let Stmt::Decl(Decl::Fn(decl)) = stmt {
                let name = decl.ident.sym.to_string();
                let func = make_closure(Some(name.clone()), &decl.function, env);
                env.declare(&name, func, true);
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], env: &Env) -> Completion<Flow> {
        let scope = self.child_scope(env);
        self.hoist_functions(stmts, &scope);
        for stmt in stmts {
            match self.exec_stmt(stmt, &scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Env) -> Completion<Flow> {
        self.enter()?;
        let flow = self.exec_stmt_inner(stmt, env);
        self.nesting -= 1;
        flow
    }

    fn exec_stmt_inner(&mut self, stmt: &Stmt, env: &Env) -> Completion<Flow> {
        match stmt {
            Stmt::Expr(ExprStmt { expr, .. }) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            Stmt::Decl(Decl::Var(decl)) => {
                self.declare_vars(decl, env)?;
                Ok(Flow::Normal)
            }
            // hoisted on block entry
            Stmt::Decl(Decl::Fn(_)) => Ok(Flow::Normal),
            Stmt::Block(block) => self.exec_block(&block.stmts, env),
            Stmt::Empty(_) | Stmt::Debugger(_) => Ok(Flow::Normal),
            Stmt::If(IfStmt { test, cons, alt, .. }) => {
                if self.eval(test, env)?.truthy() {
                    self.exec_stmt(cons, env)
                } else if let Some(alt) = alt {
                    self.exec_stmt(alt, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While(WhileStmt { test, body, .. }) => {
                while self.eval(test, env)?.truthy() {
                    match self.exec_stmt(body, env)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile(DoWhileStmt { test, body, .. }) => {
                loop {
                    match self.exec_stmt(body, env)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(test, env)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For(ForStmt {
                init,
                test,
                update,
                body,
                ..
            }) => {
                let scope = self.child_scope(env);
                match init {
                    Some(VarDeclOrExpr::VarDecl(decl)) => self.declare_vars(decl, &scope)?,
                    Some(VarDeclOrExpr::Expr(expr)) => {
                        self.eval(expr, &scope)?;
                    }
                    None => {}
                }
                loop {
                    if let Some(test) = test {
                        if !self.eval(test, &scope)?.truthy() {
                            break;
                        }
                    }
                    match self.exec_stmt(body, &scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, &scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break(BreakStmt { label: None, .. }) => Ok(Flow::Break),
            Stmt::Continue(ContinueStmt { label: None, .. }) => Ok(Flow::Continue),
            Stmt::Return(ReturnStmt { arg, .. }) => {
                let value = match arg {
                    Some(arg) => self.eval(arg, env)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Throw(ThrowStmt { arg, .. }) => Err(self.eval(arg, env)?),
            Stmt::Try(try_stmt) => self.exec_try(try_stmt, env),
            _ => Err(self.throw_error("SyntaxError", "unsupported statement")),
        }
    }

    fn exec_try(&mut self, stmt: &TryStmt, env: &Env) -> Completion<Flow> {
        let result = match (self.exec_block(&stmt.block.stmts, env), &stmt.handler) {
            (Err(thrown), Some(handler)) => {
                let scope = self.child_scope(env);
                if let Some(param) = &handler.param {
                    scope.declare(&pat_name(param)?, thrown, true);
                }
                self.exec_block(&handler.body.stmts, &scope)
            }
            (result, _) => result,
        };
        if let Some(finalizer) = &stmt.finalizer {
            match self.exec_block(&finalizer.stmts, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        result
    }

    fn declare_vars(&mut self, decl: &VarDecl, env: &Env) -> Completion<()> {
        let mutable = decl.kind != VarDeclKind::Const;
        for declarator in &decl.decls {
            let name = pat_name(&declarator.name)?;
            let value = match &declarator.init {
                Some(init) => self.eval(init, env)?,
                None => Value::Undefined,
            };
            env.declare(&name, value, mutable);
        }
        Ok(())
    }

    pub fn eval(&mut self, expr: &Expr, env: &Env) -> Completion<Value> {
        self.enter()?;
        let value = self.eval_inner(expr, env);
        self.nesting -= 1;
        value
    }

    fn eval_inner(&mut self, expr: &Expr, env: &Env) -> Completion<Value> {
        match expr {
            Expr::Lit(lit) => self.eval_lit(lit),
            Expr::Tpl(tpl) => {
                let mut out = String::new();
                for (i, quasi) in tpl.quasis.iter().enumerate() {
                    out.push_str(&cook_string(&quasi.raw));
                    if let Some(expr) = tpl.exprs.get(i) {
                        let value = self.eval(expr, env)?;
                        out.push_str(&self.to_string_op(&value)?);
                    }
                }
                Ok(Value::string(out))
            }
            Expr::Ident(ident) => self.lookup(&ident.sym, env),
            Expr::Paren(ParenExpr { expr, .. }) => self.eval(expr, env),
            Expr::Seq(SeqExpr { exprs, .. }) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr, env)?;
                }
                Ok(last)
            }
            Expr::Array(ArrayLit { elems, .. }) => {
                let mut items = Vec::with_capacity(elems.len());
                for elem in elems {
                    items.push(match elem {
                        Some(ExprOrSpread { expr, .. }) => self.eval(expr, env)?,
                        None => Value::Undefined,
                    });
                }
                Ok(Value::array(items))
            }
            Expr::Object(ObjectLit { props, .. }) => self.eval_object(props, env),
            Expr::Fn(FnExpr { ident, function, .. }) => Ok(make_closure(
                ident.as_ref().map(|i| i.sym.to_string()),
                function,
                env,
            )),
            Expr::Arrow(arrow) => {
                let params = arrow
                    .params
                    .iter()
                    .map(pat_name)
                    .collect::<Completion<Vec<_>>>()?;
                let body = match &*arrow.body {
                    BlockStmtOrExpr::BlockStmt(block) => FunctionBody::Block(Rc::new(block.clone())),
                    BlockStmtOrExpr::Expr(expr) => FunctionBody::Expr(Rc::new((**expr).clone())),
                    #[allow(unreachable_patterns)]
                    _ => return Err(self.throw_error("SyntaxError", "unsupported arrow body")),
                };
                Ok(Value::Function(Rc::new(Function::Closure(Closure {
                    name: None,
                    params,
                    body,
                    env: env.clone(),
                }))))
            }
            Expr::Unary(UnaryExpr { op, arg, .. }) => self.eval_unary(*op, arg, env),
            Expr::Bin(BinExpr {
                op, left, right, ..
            }) => self.eval_binary(*op, left, right, env),
            Expr::Cond(CondExpr {
                test, cons, alt, ..
            }) => {
                if self.eval(test, env)?.truthy() {
                    self.eval(cons, env)
                } else {
                    self.eval(alt, env)
                }
            }
            Expr::Member(member) => {
                let object = self.eval(&member.obj, env)?;
                let key = self.member_key(&member.prop, env)?;
                self.get_property(&object, &key)
            }
            Expr::Call(CallExpr { callee, args, .. }) => {
                let Callee::Expr(callee) = callee else {
                    return Err(self.throw_error("SyntaxError", "unsupported callee"));
                };
                let func = self.eval(callee, env)?;
                let args = self.eval_args(args, env)?;
                self.call(&func, &args)
            }
            Expr::New(NewExpr { callee, args, .. }) => {
                let func = self.eval(callee, env)?;
                let args = match args {
                    Some(args) => self.eval_args(args, env)?,
                    None => Vec::new(),
                };
                let result = self.call(&func, &args)?;
                Ok(match result {
                    Value::Object(_) | Value::Array(_) | Value::Function(_) => result,
                    _ => Value::object(Object::new()),
                })
            }
            Expr::Assign(assign) => self.eval_assign(assign, env),
            Expr::Update(UpdateExpr {
                op, prefix, arg, ..
            }) => {
                let old = self.eval(arg, env)?;
                let old = self.to_number(&old)?;
                let new = match op {
                    UpdateOp::PlusPlus => old + 1.0,
                    UpdateOp::MinusMinus => old - 1.0,
                };
                self.store(arg, Value::Number(new), env)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            _ => Err(self.throw_error("SyntaxError", "unsupported expression")),
        }
    }

    fn eval_lit(&mut self, lit: &Lit) -> Completion<Value> {
        match lit {
            Lit::Str(s) => Ok(Value::string(str_value(s))),
            Lit::Num(n) => Ok(Value::Number(n.value)),
            Lit::Bool(b) => Ok(Value::Bool(b.value)),
            Lit::Null(_) => Ok(Value::Null),
            _ => Err(self.throw_error("SyntaxError", "unsupported literal")),
        }
    }

    fn lookup(&mut self, name: &str, env: &Env) -> Completion<Value> {
        env.lookup(name)
            .ok_or_else(|| self.throw_error("ReferenceError", format!("{name} is not defined")))
    }

    fn eval_args(&mut self, args: &[ExprOrSpread], env: &Env) -> Completion<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(&arg.expr, env)?);
        }
        Ok(values)
    }

    fn eval_object(&mut self, props: &[PropOrSpread], env: &Env) -> Completion<Value> {
        let mut obj = Object::new();
        for prop in props {
            let PropOrSpread::Prop(prop) = prop else {
                return Err(self.throw_error("SyntaxError", "unsupported spread"));
            };
            match &**prop {
                Prop::KeyValue(KeyValueProp { key, value, .. }) => {
                    let key = self.prop_name(key, env)?;
                    let value = self.eval(value, env)?;
                    obj.set(&key, value);
                }
                Prop::Shorthand(ident) => {
                    let value = self.lookup(&ident.sym, env)?;
                    obj.set(&ident.sym, value);
                }
                Prop::Method(MethodProp { key, function, .. }) => {
                    let key = self.prop_name(key, env)?;
                    obj.set(&key, make_closure(Some(key.clone()), function, env));
                }
                _ => return Err(self.throw_error("SyntaxError", "unsupported property")),
            }
        }
        Ok(Value::object(obj))
    }

    fn prop_name(&mut self, key: &PropName, env: &Env) -> Completion<String> {
        match key {
            PropName::Ident(ident) => Ok(ident.sym.to_string()),
            PropName::Str(s) => Ok(str_value(s)),
            PropName::Num(n) => Ok(format_number(n.value)),
            PropName::Computed(ComputedPropName { expr, .. }) => {
                let value = self.eval(expr, env)?;
                self.to_string_op(&value)
            }
            _ => Err(self.throw_error("SyntaxError", "unsupported property name")),
        }
    }

    fn member_key(&mut self, prop: &MemberProp, env: &Env) -> Completion<String> {
        match prop {
            MemberProp::Ident(ident) => Ok(ident.sym.to_string()),
            MemberProp::Computed(ComputedPropName { expr, .. }) => {
                let value = self.eval(expr, env)?;
                self.to_string_op(&value)
            }
            _ => Err(self.throw_error("SyntaxError", "unsupported member")),
        }
    }

    fn get_property(&mut self, object: &Value, key: &str) -> Completion<Value> {
        Ok(match object {
            Value::Undefined | Value::Null => {
                let shown = format_nullish(object);
                return Err(self.throw_error(
                    "TypeError",
                    format!("Cannot read properties of {shown} (reading '{key}')"),
                ));
            }
            Value::Object(obj) => obj.borrow().get(key).unwrap_or(Value::Undefined),
            Value::Array(items) => items.borrow().get(key).unwrap_or(Value::Undefined),
            Value::String(s) => {
                if key == "length" {
                    Value::Number(s.encode_utf16().count() as f64)
                } else {
                    key.parse::<usize>()
                        .ok()
                        .and_then(|i| s.chars().nth(i))
                        .map_or(Value::Undefined, |c| Value::string(c.to_string()))
                }
            }
            Value::Symbol(sym) if key == "description" => sym
                .description
                .as_deref()
                .map_or(Value::Undefined, Value::string),
            _ => Value::Undefined,
        })
    }

    fn set_property(&mut self, object: &Value, key: &str, value: Value) -> Completion<()> {
        if let Some(handle) = object.downgrade() {
            self.track(handle);
        }
        match object {
            Value::Object(obj) => obj.borrow_mut().set(key, value),
            Value::Array(items) => items.borrow_mut().set(key, value),
            Value::Undefined | Value::Null => {
                let shown = format_nullish(object);
                return Err(self.throw_error(
                    "TypeError",
                    format!("Cannot set properties of {shown} (setting '{key}')"),
                ));
            }
            // silently dropped, as in sloppy mode
            _ => {}
        }
        Ok(())
    }

    /// Write to an identifier or member expression.
    fn store(&mut self, target: &Expr, value: Value, env: &Env) -> Completion<()> {
        match target {
            Expr::Ident(ident) => self.assign_ident(&ident.sym, value, env),
            Expr::Member(member) => {
                let object = self.eval(&member.obj, env)?;
                let key = self.member_key(&member.prop, env)?;
                self.set_property(&object, &key, value)
            }
            Expr::Paren(ParenExpr { expr, .. }) => self.store(expr, value, env),
            _ => Err(self.throw_error("SyntaxError", "Invalid left-hand side in assignment")),
        }
    }

    fn assign_ident(&mut self, name: &str, value: Value, env: &Env) -> Completion<()> {
        match env.assign(name, value.clone()) {
            Ok(()) => Ok(()),
            Err(AssignError::Undeclared) => {
                self.globals.declare(name, value, true);
                Ok(())
            }
            Err(AssignError::Constant) => {
                Err(self.throw_error("TypeError", "Assignment to constant variable."))
            }
        }
    }

    fn eval_assign(&mut self, assign: &AssignExpr, env: &Env) -> Completion<Value> {
        let target: Expr = match &assign.left {
            AssignTarget::Simple(SimpleAssignTarget::Ident(binding)) => {
                Expr::Ident(binding.id.clone())
            }
            AssignTarget::Simple(SimpleAssignTarget::Member(member)) => {
                Expr::Member(member.clone())
            }
            _ => {
                return Err(self.throw_error("SyntaxError", "Invalid left-hand side in assignment"));
            }
        };

        let value = match assign.op {
            AssignOp::Assign => self.eval(&assign.right, env)?,
            AssignOp::AndAssign | AssignOp::OrAssign | AssignOp::NullishAssign => {
                let old = self.eval(&target, env)?;
                let keep_old = match assign.op {
                    AssignOp::AndAssign => !old.truthy(),
                    AssignOp::OrAssign => old.truthy(),
                    _ => !old.is_nullish(),
                };
                if keep_old {
                    return Ok(old);
                }
                self.eval(&assign.right, env)?
            }
            op => {
                let Some(bin_op) = compound_op(op) else {
                    return Err(self.throw_error("SyntaxError", "unsupported assignment"));
                };
                let old = self.eval(&target, env)?;
                let rhs = self.eval(&assign.right, env)?;
                self.apply_binary(bin_op, old, rhs)?
            }
        };
        self.store(&target, value.clone(), env)?;
        Ok(value)
    }

    fn eval_unary(&mut self, op: UnaryOp, arg: &Expr, env: &Env) -> Completion<Value> {
        if op == UnaryOp::TypeOf {
            // typeof tolerates undeclared identifiers
            if let Expr::Ident(ident) = arg {
                return Ok(Value::string(
                    env.lookup(&ident.sym).map_or("undefined", |v| v.type_of()),
                ));
            }
            return Ok(Value::string(self.eval(arg, env)?.type_of()));
        }
        let value = self.eval(arg, env)?;
        Ok(match op {
            UnaryOp::Bang => Value::Bool(!value.truthy()),
            UnaryOp::Minus => Value::Number(-self.to_number(&value)?),
            UnaryOp::Plus => Value::Number(self.to_number(&value)?),
            UnaryOp::Tilde => Value::Number(!to_int32(self.to_number(&value)?) as f64),
            UnaryOp::Void => Value::Undefined,
            _ => return Err(self.throw_error("SyntaxError", "unsupported unary operator")),
        })
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, env: &Env) -> Completion<Value> {
        match op {
            BinaryOp::LogicalAnd => {
                let lhs = self.eval(left, env)?;
                if !lhs.truthy() {
                    return Ok(lhs);
                }
                self.eval(right, env)
            }
            BinaryOp::LogicalOr => {
                let lhs = self.eval(left, env)?;
                if lhs.truthy() {
                    return Ok(lhs);
                }
                self.eval(right, env)
            }
            BinaryOp::NullishCoalescing => {
                let lhs = self.eval(left, env)?;
                if !lhs.is_nullish() {
                    return Ok(lhs);
                }
                self.eval(right, env)
            }
            _ => {
                let lhs = self.eval(left, env)?;
                let rhs = self.eval(right, env)?;
                self.apply_binary(op, lhs, rhs)
            }
        }
    }

    fn apply_binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Completion<Value> {
        use BinaryOp::*;

        Ok(match op {
            Add => {
                let stringish = |v: &Value| !matches!(v, Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) | Value::Symbol(_));
                if stringish(&lhs) || stringish(&rhs) {
                    let mut out = self.to_string_op(&lhs)?;
                    out.push_str(&self.to_string_op(&rhs)?);
                    Value::string(out)
                } else {
                    Value::Number(self.to_number(&lhs)? + self.to_number(&rhs)?)
                }
            }
            Sub => Value::Number(self.to_number(&lhs)? - self.to_number(&rhs)?),
            Mul => Value::Number(self.to_number(&lhs)? * self.to_number(&rhs)?),
            Div => Value::Number(self.to_number(&lhs)? / self.to_number(&rhs)?),
            Mod => Value::Number(self.to_number(&lhs)? % self.to_number(&rhs)?),
            Exp => Value::Number(self.to_number(&lhs)?.powf(self.to_number(&rhs)?)),
            EqEqEq => Value::Bool(lhs.strict_equals(&rhs)),
            NotEqEq => Value::Bool(!lhs.strict_equals(&rhs)),
            EqEq => Value::Bool(lhs.loose_equals(&rhs)),
            NotEq => Value::Bool(!lhs.loose_equals(&rhs)),
            Lt | LtEq | Gt | GtEq => {
                let ordering = match (&lhs, &rhs) {
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => self.to_number(&lhs)?.partial_cmp(&self.to_number(&rhs)?),
                };
                Value::Bool(match (op, ordering) {
                    (_, None) => false,
                    (Lt, Some(o)) => o.is_lt(),
                    (LtEq, Some(o)) => o.is_le(),
                    (Gt, Some(o)) => o.is_gt(),
                    (_, Some(o)) => o.is_ge(),
                })
            }
            BitAnd | BitOr | BitXor | LShift | RShift => {
                let a = to_int32(self.to_number(&lhs)?);
                let b = to_int32(self.to_number(&rhs)?);
                let shift = (b as u32) & 31;
                Value::Number(match op {
                    BitAnd => a & b,
                    BitOr => a | b,
                    BitXor => a ^ b,
                    LShift => a.wrapping_shl(shift),
                    _ => a >> shift,
                } as f64)
            }
            ZeroFillRShift => {
                let a = to_int32(self.to_number(&lhs)?) as u32;
                let b = to_int32(self.to_number(&rhs)?) as u32;
                Value::Number((a >> (b & 31)) as f64)
            }
            In => match &rhs {
                Value::Object(obj) => {
                    let key = self.to_string_op(&lhs)?;
                    Value::Bool(obj.borrow().has(&key))
                }
                _ => {
                    return Err(self.throw_error(
                        "TypeError",
                        "Cannot use 'in' operator to search for a key in a non-object",
                    ));
                }
            },
            _ => return Err(self.throw_error("SyntaxError", "unsupported binary operator")),
        })
    }
}

pub(crate) fn new_symbol(description: Option<String>) -> Value {
    Value::Symbol(Rc::new(Symbol { description }))
}

fn make_closure(name: Option<String>, function: &swc_ecma_visit::swc_ecma_ast::Function, env: &Env) -> Value {
    let params = function
        .params
        .iter()
        .filter_map(|param| match &param.pat {
            Pat::Ident(binding) => Some(binding.id.sym.to_string()),
            _ => None,
        })
        .collect();
    let body = function.body.clone().unwrap_or_default();
    Value::Function(Rc::new(Function::Closure(Closure {
        name,
        params,
        body: FunctionBody::Block(Rc::new(body)),
        env: env.clone(),
    })))
}

fn pat_name(pat: &Pat) -> Completion<String> {
    match pat {
        Pat::Ident(binding) => Ok(binding.id.sym.to_string()),
        _ => Err(Value::object(Object::error(
            "SyntaxError",
            "destructuring is not supported",
        ))),
    }
}

/// String literal value, taken from the source text so escapes are cooked
/// the same way as template literals.
fn str_value(s: &Str) -> String {
    match &s.raw {
        Some(raw) if raw.len() >= 2 => cook_string(&raw[1..raw.len() - 1]),
        _ => String::new(),
    }
}

fn format_nullish(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        _ => "undefined",
    }
}

fn compound_op(op: AssignOp) -> Option<BinaryOp> {
    Some(match op {
        AssignOp::AddAssign => BinaryOp::Add,
        AssignOp::SubAssign => BinaryOp::Sub,
        AssignOp::MulAssign => BinaryOp::Mul,
        AssignOp::DivAssign => BinaryOp::Div,
        AssignOp::ModAssign => BinaryOp::Mod,
        AssignOp::ExpAssign => BinaryOp::Exp,
        AssignOp::LShiftAssign => BinaryOp::LShift,
        AssignOp::RShiftAssign => BinaryOp::RShift,
        AssignOp::ZeroFillRShiftAssign => BinaryOp::ZeroFillRShift,
        AssignOp::BitOrAssign => BinaryOp::BitOr,
        AssignOp::BitXorAssign => BinaryOp::BitXor,
        AssignOp::BitAndAssign => BinaryOp::BitAnd,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::FuzzOutput;
    use crate::intrinsics::tests::Captured;

    fn engine() -> (Interpreter, Captured) {
        let captured = Captured::default();
        let host = HostContext {
            output: FuzzOutput::new(captured.clone()),
        };
        (Interpreter::init(host), captured)
    }

    fn run(src: &str) -> (Result<(), ScriptError>, String) {
        let (mut interp, captured) = engine();
        let res = interp
            .parse(src)
            .and_then(|program| interp.run(program))
            .and_then(|_| interp.drain_jobs());
        (res, String::from_utf8(captured.contents()).unwrap())
    }

    fn output_of(src: &str) -> String {
        let (res, out) = run(src);
        assert_eq!(res, Ok(()), "script failed: {src}");
        out
    }

    #[test]
    fn arithmetic_and_strings() {
        assert_eq!(
            output_of("fuzzilli('FUZZILLI_PRINT', 1 + 2 * 3, 'a' + 1, 7 % 4, 2 ** 10);"),
            "7 a1 3 1024\n"
        );
        assert_eq!(output_of("fuzzilli('FUZZILLI_PRINT', `x${1 + 1}y`);"), "x2y\n");
        assert_eq!(output_of("fuzzilli('FUZZILLI_PRINT', -1 >>> 28, 5 & 3, 1 << 4);"), "15 1 16\n");
    }

    #[test]
    fn functions_closures_and_recursion() {
        let src = r#"
            function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
            const counter = (() => { let c = 0; return () => ++c; })();
            counter(); counter();
            fuzzilli('FUZZILLI_PRINT', fib(10), counter());
        "#;
        assert_eq!(output_of(src), "55 3\n");
    }

    #[test]
    fn loops_and_control_flow() {
        let src = r#"
            let total = 0;
            for (let i = 0; i < 10; i++) {
                if (i == 3) continue;
                if (i > 6) break;
                total += i;
            }
            let j = 0;
            while (true) { j++; if (j >= 5) break; }
            do { j--; } while (j > 2);
            fuzzilli('FUZZILLI_PRINT', total, j);
        "#;
        assert_eq!(output_of(src), "18 2\n");
    }

    #[test]
    fn objects_and_arrays() {
        let src = r#"
            let o = { a: 1, 'b': 2, ['c' + 1]: 3, m() { return 'm'; } };
            o.d = o.a + o.b;
            let arr = [1, , 3];
            arr[4] = 'x';
            fuzzilli('FUZZILLI_PRINT', o.d, o.c1, o.m(), arr.length, arr, 'a' in o);
        "#;
        assert_eq!(output_of(src), "3 3 m 5 1,,3,,x true\n");
    }

    #[test]
    fn try_catch_finally() {
        let src = r#"
            let log = '';
            try { throw new Error('boom'); } catch (e) { log += e.message; } finally { log += '!'; }
            try { undefinedThing; } catch (e) { log += ' ' + e.name; }
            fuzzilli('FUZZILLI_PRINT', log);
        "#;
        assert_eq!(output_of(src), "boom! ReferenceError\n");
    }

    #[test]
    fn uncaught_throw_is_reported() {
        let (res, _) = run("throw new TypeError('bad');");
        assert_eq!(res, Err(ScriptError::Uncaught("TypeError: bad".into())));

        let (res, _) = run("null.x;");
        assert!(matches!(res, Err(ScriptError::Uncaught(msg)) if msg.starts_with("TypeError")));
    }

    #[test]
    fn syntax_error_is_reported_by_parse() {
        let (res, out) = run("fuzzilli('FUZZILLI_PRINT', 'never'");
        assert!(matches!(res, Err(ScriptError::Syntax(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn const_reassignment_throws() {
        let (res, _) = run("const x = 1; x = 2;");
        assert!(matches!(res, Err(ScriptError::Uncaught(msg)) if msg.contains("constant")));
    }

    #[test]
    fn microtasks_run_after_script() {
        let src = r#"
            queueMicrotask(() => fuzzilli('FUZZILLI_PRINT', 'second'));
            fuzzilli('FUZZILLI_PRINT', 'first');
        "#;
        assert_eq!(output_of(src), "first\nsecond\n");
    }

    #[test]
    fn microtask_exception_is_uncaught() {
        let (res, _) = run("queueMicrotask(() => { throw 'late'; });");
        assert_eq!(res, Err(ScriptError::Uncaught("late".into())));
    }

    #[test]
    fn print_intrinsic_handles_symbols_and_nul() {
        let src = r#"fuzzilli('FUZZILLI_PRINT', Symbol('s'), 'a\0b');"#;
        assert_eq!(output_of(src), "Symbol(s) a\\u0000b\n");
        assert_eq!(output_of("__fuzzilli('FUZZILLI_PRINT', 'alias');"), "alias\n");
    }

    #[test]
    fn print_intrinsic_propagates_tostring_exception() {
        let src = r#"
            let evil = { toString() { throw new Error('nope'); } };
            fuzzilli('FUZZILLI_PRINT', 'before', evil, 'after');
        "#;
        let (res, out) = run(src);
        assert_eq!(res, Err(ScriptError::Uncaught("Error: nope".into())));
        assert_eq!(out, "before");
    }

    #[test]
    fn print_intrinsic_exception_can_be_caught() {
        let src = r#"
            let evil = { toString() { throw 'x'; } };
            let caught = false;
            try { fuzzilli('FUZZILLI_PRINT', evil); } catch (e) { caught = e === 'x'; }
            fuzzilli('FUZZILLI_PRINT', caught);
        "#;
        assert_eq!(output_of(src), "true\n");
    }

    #[test]
    fn unknown_selector_is_a_noop() {
        assert_eq!(output_of("fuzzilli('FUZZILLI_print', 1); fuzzilli(1, 2); fuzzilli();"), "");
    }

    #[test]
    fn runaway_recursion_is_a_range_error() {
        // debug builds need more than the default test thread stack
        let res = std::thread::Builder::new()
            .stack_size(64 << 20)
            .spawn(|| run("function f() { return f(); } f();").0)
            .unwrap()
            .join()
            .unwrap();
        assert!(matches!(res, Err(ScriptError::Uncaught(msg)) if msg.starts_with("RangeError")));
    }

    fn on_big_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(256 << 20)
            .spawn(f)
            .unwrap()
            .join()
            .unwrap()
    }

    #[test]
    fn self_containing_array_joins_as_empty() {
        let src = r#"
            let a = [1];
            a[0] = a;
            fuzzilli('FUZZILLI_PRINT', a, [a, 2], String(a) === '');
        "#;
        assert_eq!(output_of(src), " ,2 true\n");
    }

    #[test]
    fn far_index_writes_stay_sparse() {
        let src = r#"
            let a = [];
            a[1e10] = 1;
            a[1e18] = 2;
            a[5] = 3;
            let name = 'none';
            try { '' + a; } catch (e) { name = e.name; }
            fuzzilli('FUZZILLI_PRINT', a[1e10], a[1e18], a[5], a[6], a.length > 1e17, name);
        "#;
        assert_eq!(output_of(src), "1 2 3 undefined true RangeError\n");

        let src = r#"
            let b = [0];
            b[3000] = 'far';
            b[2] = 'near';
            fuzzilli('FUZZILLI_PRINT', b.length, String(b).length, b[3000], b[2]);
        "#;
        assert_eq!(output_of(src), "3001 3008 far near\n");
    }

    #[test]
    fn deeply_nested_arrays_hit_the_nesting_limit() {
        let (res, out) = on_big_stack(|| {
            run(r#"
                let a = [];
                for (let i = 0; i < 100000; i++) a = [a];
                fuzzilli('FUZZILLI_PRINT', 'built');
                String(a);
            "#)
        });
        assert_eq!(out, "built\n");
        assert!(matches!(res, Err(ScriptError::Uncaught(msg)) if msg.starts_with("RangeError")));
    }

    #[test]
    fn nesting_limit_spans_calls_and_is_catchable() {
        let src = r#"
            function f(n) { return [[[[[[[[[[[[f(n + 1)]]]]]]]]]]]]; }
            let msg = '';
            try { f(0); } catch (e) { msg = e.message; }
            fuzzilli('FUZZILLI_PRINT', msg);
        "#;
        let out = on_big_stack(move || output_of(src));
        assert_eq!(out, "Maximum nesting depth exceeded\n");
    }

    #[test]
    fn symbol_concatenation_throws() {
        let (res, _) = run("'a' + Symbol('x');");
        assert!(matches!(res, Err(ScriptError::Uncaught(msg)) if msg.starts_with("TypeError")));
    }

    #[test]
    fn typeof_undeclared_is_undefined() {
        assert_eq!(
            output_of("fuzzilli('FUZZILLI_PRINT', typeof nothing, typeof 1, typeof fuzzilli);"),
            "undefined number function\n"
        );
    }
}
