use swc_common::sync::Lrc;
use swc_common::{FileName, SourceMap};
use swc_ecma_parser::{EsSyntax, Syntax, parse_file_as_script};
use swc_ecma_visit::{Visit, VisitWith, swc_ecma_ast::*};

use crate::engine::ScriptError;

/// Deepest nesting handed to the parser. Parsing, visiting, evaluating and
/// dropping the tree all recurse once per level.
const MAX_SOURCE_NESTING: usize = 500;

/// Prefix and infix keywords that add a level to the expression they sit in.
const CHAINING_KEYWORDS: &[&str] = &[
    "typeof", "void", "delete", "new", "in", "instanceof", "await", "yield", "else",
];

pub fn parse_script(src: &str) -> Result<Script, ScriptError> {
    check_nesting(src)?;

    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(FileName::Custom("fuzz.js".into()).into(), src.to_string());
    let syntax = Syntax::Es(EsSyntax {
        jsx: false,
        decorators: false,
        ..Default::default()
    });

    let mut errs = vec![];
    let script = parse_file_as_script(&fm, syntax, EsVersion::Es2024, None, &mut errs)
        .map_err(|e| ScriptError::Syntax(e.kind().msg().to_string()))?;
    if let Some(err) = errs.first() {
        return Err(ScriptError::Syntax(err.kind().msg().to_string()));
    }

    let mut check = UnsupportedSyntax::default();
    script.visit_with(&mut check);
    if let Some(what) = check.found {
        return Err(ScriptError::Syntax(format!("{what} is not supported")));
    }
    Ok(script)
}

struct Frame {
    chain: usize,
    template: bool,
}

/// Running estimate of how deep the syntax tree gets. Brackets open a frame;
/// operators and chaining keywords stack up inside a frame until a `;`, `,`
/// or closing brace ends the expression.
struct NestingScan {
    frames: Vec<Frame>,
    total: usize,
}

impl NestingScan {
    fn new() -> Self {
        Self {
            frames: vec![Frame {
                chain: 0,
                template: false,
            }],
            total: 0,
        }
    }

    fn check(&self) -> Result<(), ScriptError> {
        if self.total > MAX_SOURCE_NESTING {
            return Err(ScriptError::Syntax(format!(
                "nesting deeper than {MAX_SOURCE_NESTING} levels is not supported"
            )));
        }
        Ok(())
    }

    fn chain(&mut self) -> Result<(), ScriptError> {
        if let Some(top) = self.frames.last_mut() {
            top.chain += 1;
            self.total += 1;
        }
        self.check()
    }

    fn open(&mut self, template: bool) -> Result<(), ScriptError> {
        self.chain()?;
        self.frames.push(Frame { chain: 0, template });
        self.total += 1;
        self.check()
    }

    /// Pops the innermost frame. Unbalanced closers are left to the parser.
    fn close(&mut self) -> Option<Frame> {
        if self.frames.len() < 2 {
            return None;
        }
        let frame = self.frames.pop()?;
        self.total -= frame.chain + 1;
        Some(frame)
    }

    fn reset(&mut self) {
        if let Some(top) = self.frames.last_mut() {
            self.total -= top.chain;
            top.chain = 0;
        }
    }
}

/// Rejects sources nested too deeply for the recursive stages after it,
/// scanning once without recursion.
fn check_nesting(src: &str) -> Result<(), ScriptError> {
    let bytes = src.as_bytes();
    let mut scan = NestingScan::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'"' | b'\'' => i = skip_string(bytes, i),
            b'`' => {
                let (next, opened) = skip_template(bytes, i + 1);
                if opened {
                    scan.open(true)?;
                }
                i = next;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_past(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_past(bytes, i + 2, b"*/"),
            b'(' | b'[' | b'{' => {
                scan.open(false)?;
                i += 1;
            }
            b')' | b']' | b'}' => {
                i += 1;
                match scan.close() {
                    Some(frame) if frame.template => {
                        let (next, opened) = skip_template(bytes, i);
                        if opened {
                            scan.open(true)?;
                        }
                        i = next;
                    }
                    _ if b == b'}' && !else_follows(bytes, i) => scan.reset(),
                    _ => {}
                }
            }
            b';' | b',' => {
                i += 1;
                if !else_follows(bytes, i) {
                    scan.reset();
                }
            }
            b'!' | b'~' | b'+' | b'-' | b'*' | b'/' | b'%' | b'<' | b'>' | b'=' | b'&' | b'|'
            | b'^' | b'?' | b':' | b'.' => {
                scan.chain()?;
                i += 1;
            }
            b'0'..=b'9' => {
                i = skip_while(bytes, i, |c| c.is_ascii_alphanumeric() || c == b'.' || c == b'_');
            }
            _ if is_ident_byte(b) => {
                let end = skip_while(bytes, i, is_ident_byte);
                if CHAINING_KEYWORDS.contains(&&src[i..end]) {
                    scan.chain()?;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    Ok(())
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn skip_while(bytes: &[u8], mut i: usize, keep: impl Fn(u8) -> bool) -> usize {
    while i < bytes.len() && keep(bytes[i]) {
        i += 1;
    }
    i
}

fn skip_past(bytes: &[u8], from: usize, end: &[u8]) -> usize {
    bytes[from.min(bytes.len())..]
        .windows(end.len())
        .position(|w| w == end)
        .map_or(bytes.len(), |pos| from + pos + end.len())
}

/// Index just past the closing quote of the string starting at `start`.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skips template text. Returns where scanning resumes and whether it
/// stopped at a `${` substitution rather than the closing backtick.
fn skip_template(bytes: &[u8], mut i: usize) -> (usize, bool) {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return (i + 1, false),
            b'$' if bytes.get(i + 1) == Some(&b'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (bytes.len(), false)
}

fn else_follows(bytes: &[u8], i: usize) -> bool {
    let start = skip_while(bytes, i, |c| c.is_ascii_whitespace());
    let rest = &bytes[start.min(bytes.len())..];
    rest.starts_with(b"else") && !rest.get(4).is_some_and(|&c| is_ident_byte(c))
}

/// Turn the raw text of a string or template literal into its value.
/// Lone surrogates become U+FFFD.
pub fn cook_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            out.push('\\');
            break;
        };
        match esc {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' if !chars.peek().is_some_and(|c| c.is_ascii_digit()) => out.push('\0'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                push_code_unit(&mut out, u32::from_str_radix(&hex, 16).ok());
            }
            'u' if chars.peek() == Some(&'{') => {
                chars.next();
                let hex: String = chars.by_ref().take_while(|&c| c != '}').collect();
                push_code_unit(&mut out, u32::from_str_radix(&hex, 16).ok());
            }
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                let Some(unit) = u32::from_str_radix(&hex, 16).ok() else {
                    out.push(char::REPLACEMENT_CHARACTER);
                    continue;
                };
                if (0xD800..0xDC00).contains(&unit) {
                    // try to pair with a following \uDC00-\uDFFF
                    let mut lookahead = chars.clone();
                    if lookahead.next() == Some('\\') && lookahead.next() == Some('u') {
                        let low: String = lookahead.by_ref().take(4).collect();
                        if let Ok(low) = u32::from_str_radix(&low, 16) {
                            if (0xDC00..0xE000).contains(&low) {
                                chars = lookahead;
                                let cp = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                                push_code_unit(&mut out, Some(cp));
                                continue;
                            }
                        }
                    }
                }
                push_code_unit(&mut out, Some(unit));
            }
            // line continuation
            '\n' | '\u{2028}' | '\u{2029}' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn push_code_unit(out: &mut String, unit: Option<u32>) {
    out.push(unit.and_then(char::from_u32).unwrap_or(char::REPLACEMENT_CHARACTER));
}

/// Finds the first construct the interpreter has no semantics for.
#[derive(Default)]
struct UnsupportedSyntax {
    found: Option<&'static str>,
}

impl UnsupportedSyntax {
    fn flag(&mut self, what: &'static str) {
        if self.found.is_none() {
            self.found = Some(what);
        }
    }
}

impl Visit for UnsupportedSyntax {
    fn visit_class(&mut self, _: &Class) {
        self.flag("class");
    }

    fn visit_function(&mut self, n: &Function) {
        if n.is_async {
            self.flag("async function");
        }
        if n.is_generator {
            self.flag("generator");
        }
        n.visit_children_with(self);
    }

    fn visit_arrow_expr(&mut self, n: &ArrowExpr) {
        if n.is_async {
            self.flag("async arrow function");
        }
        n.visit_children_with(self);
    }

    fn visit_pat(&mut self, n: &Pat) {
        match n {
            Pat::Ident(_) => n.visit_children_with(self),
            _ => self.flag("destructuring or default parameter"),
        }
    }

    fn visit_expr_or_spread(&mut self, n: &ExprOrSpread) {
        if n.spread.is_some() {
            self.flag("spread");
        }
        n.visit_children_with(self);
    }

    fn visit_spread_element(&mut self, _: &SpreadElement) {
        self.flag("spread");
    }

    fn visit_lit(&mut self, n: &Lit) {
        match n {
            Lit::Regex(_) => self.flag("regular expression"),
            Lit::BigInt(_) => self.flag("BigInt"),
            _ => {}
        }
    }

    fn visit_this_expr(&mut self, _: &ThisExpr) {
        self.flag("this");
    }

    fn visit_getter_prop(&mut self, _: &GetterProp) {
        self.flag("getter");
    }

    fn visit_setter_prop(&mut self, _: &SetterProp) {
        self.flag("setter");
    }

    fn visit_labeled_stmt(&mut self, _: &LabeledStmt) {
        self.flag("label");
    }

    fn visit_switch_stmt(&mut self, _: &SwitchStmt) {
        self.flag("switch");
    }

    fn visit_for_in_stmt(&mut self, _: &ForInStmt) {
        self.flag("for-in");
    }

    fn visit_for_of_stmt(&mut self, _: &ForOfStmt) {
        self.flag("for-of");
    }

    fn visit_with_stmt(&mut self, _: &WithStmt) {
        self.flag("with");
    }

    fn visit_tagged_tpl(&mut self, _: &TaggedTpl) {
        self.flag("tagged template");
    }

    fn visit_opt_chain_expr(&mut self, _: &OptChainExpr) {
        self.flag("optional chaining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_script() {
        let script = parse_script("let a = 1;\nfunction f(x) { return x + a; }\nf(2);").unwrap();
        assert_eq!(script.body.len(), 3);
    }

    #[test]
    fn reports_syntax_errors() {
        assert!(matches!(parse_script("let = ;"), Err(ScriptError::Syntax(_))));
        assert!(matches!(parse_script("(("), Err(ScriptError::Syntax(_))));
    }

    #[test]
    fn rejects_unsupported_constructs() {
        for src in [
            "class A {}",
            "async function f() {}",
            "function* g() {}",
            "let [a, b] = [1, 2];",
            "f(...args);",
            "let r = /ab+/;",
            "switch (1) { case 1: break; }",
        ] {
            let err = parse_script(src).unwrap_err();
            assert!(
                matches!(&err, ScriptError::Syntax(msg) if msg.ends_with("is not supported")),
                "{src}: {err:?}"
            );
        }
    }

    #[test]
    fn rejects_deep_nesting_before_parsing() {
        for src in [
            "!".repeat(50_000) + "1",
            "(".repeat(50_000),
            "[".repeat(600) + "]".repeat(600).as_str(),
            "1+".repeat(5_000) + "1",
            "x = ".repeat(1_000) + "1;",
            "if (x) {} else ".repeat(1_000) + "{}",
            "`${".repeat(1_000),
            "typeof ".repeat(1_000) + "x",
        ] {
            let err = parse_script(&src).unwrap_err();
            assert!(
                matches!(&err, ScriptError::Syntax(msg) if msg.starts_with("nesting deeper than")),
                "{}: {err:?}",
                &src[..20]
            );
        }
    }

    #[test]
    fn long_flat_scripts_are_accepted() {
        let src = "let x = 0;\n".to_string() + "x = x + 1; // (((\n".repeat(5_000).as_str();
        assert_eq!(parse_script(&src).unwrap().body.len(), 5_001);

        let src = format!("let a = [{}];", "1, ".repeat(5_000));
        assert!(parse_script(&src).is_ok());

        let src = "function f() { return '((((' + `${1}`; }\n".repeat(1_000);
        assert!(parse_script(&src).is_ok());
    }

    #[test]
    fn cooks_escapes() {
        assert_eq!(cook_string(r"a\nb\tc"), "a\nb\tc");
        assert_eq!(cook_string(r"\x41B\u{43}"), "ABC");
        assert_eq!(cook_string(r"nul\0here"), "nul\0here");
        assert_eq!(cook_string(r#"\'\"\\"#), "'\"\\");
        assert_eq!(cook_string(r"😀"), "😀");
        assert_eq!(cook_string(r"\uD800"), "\u{FFFD}");
        assert_eq!(cook_string(r"\uD83D\uDE00"), "😀");
        assert_eq!(cook_string("line\\\ncontinued"), "linecontinued");
    }
}
