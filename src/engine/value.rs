use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use swc_ecma_visit::swc_ecma_ast::{BlockStmt, Expr};

use crate::engine::interpreter::Interpreter;

/// A thrown value travels as `Err`.
pub type Completion<T> = Result<T, Value>;

pub type NativeFn = dyn Fn(&mut Interpreter, &[Value]) -> Completion<Value>;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Symbol(Rc<Symbol>),
    Object(Rc<RefCell<Object>>),
    Array(Rc<RefCell<Array>>),
    Function(Rc<Function>),
}

#[derive(Debug)]
pub struct Symbol {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Plain,
    Error,
}

#[derive(Clone)]
pub struct Object {
    pub class: ObjectClass,
    props: Vec<(Rc<str>, Value)>,
}

/// Indices past the dense part live in `extra`, so a far-away write does
/// not allocate every slot in between.
#[derive(Default)]
pub struct Array {
    elements: Vec<Value>,
    extra: Object,
    length: usize,
}

/// How far past the dense end a write may land and still grow it.
const DENSE_SLACK: usize = 1024;

pub enum Function {
    Native { name: &'static str, call: Box<NativeFn> },
    Closure(Closure),
}

pub struct Closure {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: FunctionBody,
    pub env: Env,
}

pub enum FunctionBody {
    Block(Rc<BlockStmt>),
    Expr(Rc<Expr>),
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn native<F>(name: &'static str, call: F) -> Self
    where
        F: Fn(&mut Interpreter, &[Value]) -> Completion<Value> + 'static,
    {
        Value::Function(Rc::new(Function::Native {
            name,
            call: Box::new(call),
        }))
    }

    pub fn object(obj: Object) -> Self {
        Value::Object(Rc::new(RefCell::new(obj)))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(Array::new(elements))))
    }

    pub fn downgrade(&self) -> Option<WeakRef> {
        match self {
            Value::Object(obj) => Some(WeakRef::Object(Rc::downgrade(obj))),
            Value::Array(items) => Some(WeakRef::Array(Rc::downgrade(items))),
            _ => None,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Object(_) | Value::Array(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Number conversion for values that cannot run script code.
    pub fn primitive_number(&self) -> Option<f64> {
        match self {
            Value::Undefined => Some(f64::NAN),
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Some(*n),
            Value::String(s) => Some(string_to_number(s)),
            _ => None,
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `==` without object-to-primitive conversion.
    pub fn loose_equals(&self, other: &Value) -> bool {
        if self.is_nullish() || other.is_nullish() {
            return self.is_nullish() && other.is_nullish();
        }
        match (self, other) {
            (Value::Number(_) | Value::String(_) | Value::Bool(_), Value::Number(_) | Value::String(_) | Value::Bool(_))
                if std::mem::discriminant(self) != std::mem::discriminant(other) =>
            {
                self.primitive_number() == other.primitive_number()
            }
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Symbol(sym) => write!(f, "Symbol({})", sym.description.as_deref().unwrap_or("")),
            Value::Object(_) => write!(f, "[object]"),
            Value::Array(items) => write!(f, "{:?}", items.borrow().elements),
            Value::Function(func) => write!(f, "[function {}]", func.name()),
        }
    }
}

impl Object {
    pub fn new() -> Self {
        Self {
            class: ObjectClass::Plain,
            props: Vec::new(),
        }
    }

    pub fn error(name: &str, message: &str) -> Self {
        let mut obj = Self {
            class: ObjectClass::Error,
            props: Vec::new(),
        };
        obj.set("name", Value::string(name));
        obj.set("message", Value::string(message));
        obj
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.props
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        match self.props.iter_mut().find(|(k, _)| &**k == key) {
            Some(slot) => slot.1 = value,
            None => self.props.push((key.into(), value)),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.props.iter().any(|(k, _)| &**k == key)
    }

    fn take(&mut self, key: &str) -> Option<Value> {
        let pos = self.props.iter().position(|(k, _)| &**k == key)?;
        Some(self.props.swap_remove(pos).1)
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        defer_drop(std::mem::take(&mut self.props).into_iter().map(|(_, v)| v));
    }
}

/// Canonical array index: decimal digits without a leading zero.
fn array_index(key: &str) -> Option<usize> {
    let digits = !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit());
    let canonical = key == "0" || (digits && !key.starts_with('0'));
    if canonical { key.parse().ok() } else { None }
}

impl Array {
    pub fn new(elements: Vec<Value>) -> Self {
        Self {
            length: elements.len(),
            elements,
            extra: Object::new(),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if key == "length" {
            return Some(Value::Number(self.length as f64));
        }
        match array_index(key) {
            Some(index) if index < self.elements.len() => Some(self.elements[index].clone()),
            _ => self.extra.get(key),
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        let Some(index) = array_index(key) else {
            self.extra.set(key, value);
            return;
        };
        let dense = self.elements.len();
        if index < dense {
            self.elements[index] = value;
        } else if index - dense < DENSE_SLACK {
            for hole in dense..index {
                let moved = self.extra.take(&hole.to_string()).unwrap_or(Value::Undefined);
                self.elements.push(moved);
            }
            self.extra.take(key);
            self.elements.push(value);
        } else {
            self.extra.set(key, value);
        }
        self.length = self.length.max(index.saturating_add(1));
    }

    /// Every element in index order; holes read as undefined.
    pub fn values(&self) -> Vec<Value> {
        let mut values = self.elements.clone();
        if self.length > values.len() {
            let mut sparse: Vec<(usize, Value)> = self
                .extra
                .props
                .iter()
                .filter_map(|(k, v)| array_index(k).map(|i| (i, v.clone())))
                .collect();
            sparse.sort_by_key(|(i, _)| *i);
            for (index, value) in sparse {
                if values.len() < index {
                    values.resize(index, Value::Undefined);
                }
                values.push(value);
            }
            values.resize(self.length, Value::Undefined);
        }
        values
    }
}

impl Drop for Array {
    fn drop(&mut self) {
        defer_drop(std::mem::take(&mut self.elements));
    }
}

thread_local! {
    static DROP_QUEUE: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Drops container contents from a worklist instead of recursively, so a
/// long chain of nested arrays or objects cannot exhaust the stack.
fn defer_drop(values: impl IntoIterator<Item = Value>) {
    let mut values = values
        .into_iter()
        .filter(|v| matches!(v, Value::Object(_) | Value::Array(_) | Value::Function(_)))
        .peekable();
    if values.peek().is_none() {
        return;
    }
    DROP_QUEUE.with(|queue| queue.borrow_mut().extend(values));
    if DRAINING.get() {
        return;
    }
    DRAINING.set(true);
    while let Some(value) = DROP_QUEUE.with(|queue| queue.borrow_mut().pop()) {
        drop(value);
    }
    DRAINING.set(false);
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Native { name, .. } => name,
            Function::Closure(closure) => closure.name.as_deref().unwrap_or(""),
        }
    }
}

/// A lexical scope chain.
#[derive(Clone)]
pub struct Env(Rc<RefCell<Scope>>);

pub struct Scope {
    vars: HashMap<String, Binding>,
    parent: Option<Env>,
}

struct Binding {
    value: Value,
    mutable: bool,
}

impl Drop for Scope {
    fn drop(&mut self) {
        defer_drop(std::mem::take(&mut self.vars).into_values().map(|b| b.value));
    }
}

/// A weak handle to anything that can sit on a reference cycle.
pub enum WeakRef {
    Scope(Weak<RefCell<Scope>>),
    Object(Weak<RefCell<Object>>),
    Array(Weak<RefCell<Array>>),
}

impl WeakRef {
    pub fn is_live(&self) -> bool {
        match self {
            WeakRef::Scope(w) => w.strong_count() > 0,
            WeakRef::Object(w) => w.strong_count() > 0,
            WeakRef::Array(w) => w.strong_count() > 0,
        }
    }

    /// Drop everything the target holds, breaking any cycle through it.
    pub fn clear(&self) {
        match self {
            WeakRef::Scope(w) => {
                if let Some(scope) = w.upgrade() {
                    Env(scope).clear();
                }
            }
            WeakRef::Object(w) => {
                if let Some(obj) = w.upgrade() {
                    let props = std::mem::take(&mut obj.borrow_mut().props);
                    drop(props);
                }
            }
            WeakRef::Array(w) => {
                if let Some(items) = w.upgrade() {
                    let items = std::mem::take(&mut *items.borrow_mut());
                    drop(items);
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AssignError {
    Undeclared,
    Constant,
}

impl Env {
    pub fn root() -> Self {
        Env(Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: None,
        })))
    }

    pub fn child(&self) -> Self {
        Env(Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: Some(self.clone()),
        })))
    }

    pub fn downgrade(&self) -> WeakRef {
        WeakRef::Scope(Rc::downgrade(&self.0))
    }

    /// Drop every binding, breaking reference cycles through closures.
    pub fn clear(&self) {
        let vars = std::mem::take(&mut self.0.borrow_mut().vars);
        drop(vars);
    }

    pub fn declare(&self, name: &str, value: Value, mutable: bool) {
        self.0
            .borrow_mut()
            .vars
            .insert(name.to_string(), Binding { value, mutable });
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let scope = self.0.borrow();
        match scope.vars.get(name) {
            Some(binding) => Some(binding.value.clone()),
            None => scope.parent.as_ref().and_then(|p| p.lookup(name)),
        }
    }

    pub fn assign(&self, name: &str, value: Value) -> Result<(), AssignError> {
        let mut scope = self.0.borrow_mut();
        match scope.vars.get_mut(name) {
            Some(binding) if !binding.mutable => Err(AssignError::Constant),
            Some(binding) => {
                binding.value = value;
                Ok(())
            }
            None => match &scope.parent {
                Some(parent) => parent.assign(name, value),
                None => Err(AssignError::Undeclared),
            },
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |v| v as f64);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        // Rust accepts "inf" and "nan", JavaScript does not.
        _ if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => trimmed.parse().unwrap_or(f64::NAN),
    }
}

pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 as u64 & 0xffff_ffff) as u32 as i32
}
