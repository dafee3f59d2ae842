//! Static import scanner for Python source files.
//!
//! This is not a Python parser. It tokenizes just enough (names, strings,
//! brackets, operators) to split the file into logical lines, tracks block
//! nesting from indentation, and recognizes `import` / `from ... import`
//! statements. An import is *conditional* when any enclosing block is a
//! `try`/`except`/`finally`, an `if`/`elif`/`else`, a loop, a `match` arm or a
//! function body. `class` and `with` blocks inherit their surroundings.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{IoContext, Result};

/// One import statement (or one name of a multi-name `import a, b`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    /// Dotted module name; empty for `from . import x`.
    pub module: String,
    /// Number of leading dots of a relative import (0 for absolute).
    pub level: usize,
    /// Names after `from M import`; `None` for a plain `import M`.
    /// A star import is the single name `*`.
    pub names: Option<Vec<String>>,
    pub conditional: bool,
    pub line: usize,
}

impl ImportStatement {
    pub fn is_star(&self) -> bool {
        self.names.as_ref().is_some_and(|n| n.iter().any(|x| x == "*"))
    }
}

/// Everything the finder learns from reading a module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub imports: Vec<ImportStatement>,
    /// Names bound at module level (functions, classes, assignments, imports).
    pub globals: BTreeSet<String>,
    /// The module reads `__file__`, which usually means it looks for data
    /// files next to itself and cannot run from a zip archive.
    pub uses_dunder_file: bool,
}

/// Scan a source file.
pub fn scan_file(path: &Path) -> Result<ScanResult> {
    let bytes = std::fs::read(path).at("Failed to read", path)?;
    Ok(scan_source(&String::from_utf8_lossy(&bytes)))
}

/// Scan source text.
pub fn scan_source(src: &str) -> ScanResult {
    let mut result = ScanResult::default();
    let mut stack: Vec<Block> = Vec::new();

    for line in logical_lines(src) {
        while stack.last().is_some_and(|b| b.indent >= line.indent) {
            stack.pop();
        }
        let ctx = Ctx {
            conditional: stack.iter().any(|b| b.conditional),
            module_scope: !stack.iter().any(|b| b.scope),
            line: line.number,
        };

        if line.toks.iter().any(|t| t.is_name("__file__")) {
            result.uses_dunder_file = true;
        }
        scan_dynamic_imports(&line.toks, line.number, &mut result);

        let mut statements = split_statements(&line.toks).into_iter();
        let Some(first) = statements.next() else {
            continue;
        };

        if let Some(header) = Header::detect(first) {
            let colon = top_level_position(first, |t| t.is_op(":")).unwrap_or(first.len());
            if ctx.module_scope {
                if let Some(name) = header.binds {
                    result.globals.insert(name);
                }
            }
            let inner = Ctx {
                conditional: ctx.conditional || header.conditional,
                module_scope: ctx.module_scope && !header.scope,
                line: ctx.line,
            };
            let body = &first[(colon + 1).min(first.len())..];
            if body.is_empty() {
                stack.push(Block {
                    indent: line.indent,
                    conditional: header.conditional,
                    scope: header.scope,
                });
            } else {
                for stmt in split_statements(body).into_iter().chain(statements) {
                    simple_statement(stmt, inner, &mut result);
                }
            }
            continue;
        }

        simple_statement(first, ctx, &mut result);
        for stmt in statements {
            simple_statement(stmt, ctx, &mut result);
        }
    }

    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Name(String),
    Str(String),
    Op(String),
    Number,
}

impl Tok {
    fn is_name(&self, s: &str) -> bool {
        matches!(self, Tok::Name(n) if n == s)
    }

    fn is_op(&self, s: &str) -> bool {
        matches!(self, Tok::Op(o) if o == s)
    }

    fn name(&self) -> Option<&str> {
        match self {
            Tok::Name(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct LogicalLine {
    indent: usize,
    number: usize,
    toks: Vec<Tok>,
}

#[derive(Debug)]
struct Block {
    indent: usize,
    conditional: bool,
    scope: bool,
}

#[derive(Debug, Clone, Copy)]
struct Ctx {
    conditional: bool,
    module_scope: bool,
    line: usize,
}

const TWO_CHAR_OPS: &[&str] = &[
    "==", "!=", "<=", ">=", ":=", "->", "**", "//", "<<", ">>", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=", "@=",
];

fn logical_lines(src: &str) -> Vec<LogicalLine> {
    let chars: Vec<char> = src.chars().collect();
    let n = chars.len();
    let mut lines = Vec::new();
    let mut toks = Vec::new();
    let mut depth = 0usize;
    let mut number = 1;
    let mut start = 1;
    let mut indent = 0;
    let mut at_bol = true;
    let mut i = 0;

    while i < n {
        if at_bol {
            let mut col = 0;
            while i < n && matches!(chars[i], ' ' | '\t' | '\x0c') {
                col = match chars[i] {
                    '\t' => (col / 8 + 1) * 8,
                    '\x0c' => 0,
                    _ => col + 1,
                };
                i += 1;
            }
            if i >= n {
                break;
            }
            match chars[i] {
                '\n' => {
                    number += 1;
                    i += 1;
                    continue;
                }
                '\r' => {
                    i += 1;
                    continue;
                }
                '#' => {
                    while i < n && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                _ => {}
            }
            indent = col;
            start = number;
            at_bol = false;
        }

        let c = chars[i];
        match c {
            '\n' => {
                number += 1;
                i += 1;
                if depth == 0 {
                    if !toks.is_empty() {
                        lines.push(LogicalLine {
                            indent,
                            number: start,
                            toks: std::mem::take(&mut toks),
                        });
                    }
                    at_bol = true;
                }
            }
            ' ' | '\t' | '\r' | '\x0c' => i += 1,
            '#' => {
                while i < n && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\\' => {
                i += 1;
                if i < n && chars[i] == '\r' {
                    i += 1;
                }
                if i < n && chars[i] == '\n' {
                    i += 1;
                    number += 1;
                }
            }
            '"' | '\'' => {
                let (s, next, newlines) = read_string(&chars, i);
                toks.push(Tok::Str(s));
                number += newlines;
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let begin = i;
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[begin..i].iter().collect();
                let is_prefix = word.len() <= 2
                    && word.chars().all(|ch| "rRbBuUfF".contains(ch))
                    && i < n
                    && matches!(chars[i], '"' | '\'');
                if is_prefix {
                    let (s, next, newlines) = read_string(&chars, i);
                    toks.push(Tok::Str(s));
                    number += newlines;
                    i = next;
                } else {
                    toks.push(Tok::Name(word));
                }
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                toks.push(Tok::Number);
            }
            '(' | '[' | '{' => {
                depth += 1;
                toks.push(Tok::Op(c.to_string()));
                i += 1;
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                toks.push(Tok::Op(c.to_string()));
                i += 1;
            }
            _ => {
                let pair: String = chars[i..(i + 2).min(n)].iter().collect();
                if TWO_CHAR_OPS.contains(&pair.as_str()) {
                    toks.push(Tok::Op(pair));
                    i += 2;
                } else {
                    toks.push(Tok::Op(c.to_string()));
                    i += 1;
                }
            }
        }
    }

    if !toks.is_empty() {
        lines.push(LogicalLine {
            indent,
            number: start,
            toks,
        });
    }
    lines
}

/// Read a string literal starting at the opening quote. Returns the raw
/// contents, the index after the literal and the number of newlines crossed.
fn read_string(chars: &[char], start: usize) -> (String, usize, usize) {
    let n = chars.len();
    let quote = chars[start];
    let triple = start + 2 < n && chars[start + 1] == quote && chars[start + 2] == quote;
    let mut i = if triple { start + 3 } else { start + 1 };
    let mut out = String::new();
    let mut newlines = 0;

    while i < n {
        let c = chars[i];
        if c == '\\' && i + 1 < n {
            if chars[i + 1] == '\n' {
                newlines += 1;
            }
            out.push(c);
            out.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if triple {
            if c == quote && i + 2 < n && chars[i + 1] == quote && chars[i + 2] == quote {
                return (out, i + 3, newlines);
            }
        } else if c == quote {
            return (out, i + 1, newlines);
        } else if c == '\n' {
            // Unterminated literal; leave the newline to end the line.
            return (out, i, newlines);
        }
        if c == '\n' {
            newlines += 1;
        }
        out.push(c);
        i += 1;
    }
    (out, n, newlines)
}

/// Position of the first token at bracket depth zero matching `pred`.
fn top_level_position(toks: &[Tok], pred: impl Fn(&Tok) -> bool) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, tok) in toks.iter().enumerate() {
        if let Tok::Op(o) = tok {
            match o.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        if depth == 0 && pred(tok) {
            return Some(idx);
        }
    }
    None
}

fn split_statements(toks: &[Tok]) -> Vec<&[Tok]> {
    let mut out = Vec::new();
    let mut rest = toks;
    while let Some(pos) = top_level_position(rest, |t| t.is_op(";")) {
        if pos > 0 {
            out.push(&rest[..pos]);
        }
        rest = &rest[pos + 1..];
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

#[derive(Debug)]
struct Header {
    conditional: bool,
    scope: bool,
    binds: Option<String>,
}

impl Header {
    fn detect(toks: &[Tok]) -> Option<Self> {
        let first = toks.first()?.name()?;
        top_level_position(toks, |t| t.is_op(":"))?;

        let header = |conditional, scope| Header {
            conditional,
            scope,
            binds: None,
        };
        let named = |conditional, scope, idx: usize| Header {
            conditional,
            scope,
            binds: toks.get(idx).and_then(Tok::name).map(String::from),
        };

        match first {
            "if" | "elif" | "else" | "try" | "except" | "finally" | "while" | "for" => {
                Some(header(true, false))
            }
            "with" => Some(header(false, false)),
            "def" => Some(named(true, true, 1)),
            "class" => Some(named(false, true, 1)),
            "async" => match toks.get(1)?.name()? {
                "def" => Some(named(true, true, 2)),
                "for" => Some(header(true, false)),
                "with" => Some(header(false, false)),
                _ => None,
            },
            // Soft keywords: only a header when the line ends in the colon.
            "match" | "case" => {
                let ends_in_colon = toks.last().is_some_and(|t| t.is_op(":"));
                let assigns = toks.get(1).is_some_and(|t| {
                    matches!(t, Tok::Op(o) if o == "=" || o == "." || o.ends_with('='))
                });
                (ends_in_colon && toks.len() > 2 && !assigns).then(|| header(true, false))
            }
            _ => None,
        }
    }
}

fn simple_statement(toks: &[Tok], ctx: Ctx, result: &mut ScanResult) {
    let Some(first) = toks.first() else {
        return;
    };

    if first.is_name("import") {
        for (module, alias) in parse_import_list(&toks[1..]) {
            if ctx.module_scope {
                let bound = alias.unwrap_or_else(|| {
                    module.split('.').next().unwrap_or(&module).to_string()
                });
                result.globals.insert(bound);
            }
            result.imports.push(ImportStatement {
                module,
                level: 0,
                names: None,
                conditional: ctx.conditional,
                line: ctx.line,
            });
        }
        return;
    }

    if first.is_name("from") {
        if let Some(stmt) = parse_from(&toks[1..], ctx) {
            if ctx.module_scope {
                if let Some(names) = &stmt.1 {
                    result.globals.extend(names.iter().filter(|n| *n != "*").cloned());
                }
            }
            result.imports.push(stmt.0);
        }
        return;
    }

    if ctx.module_scope {
        collect_assignment_targets(toks, &mut result.globals);
    }
}

/// `a.b as c, d` -> [("a.b", Some("c")), ("d", None)]
fn parse_import_list(toks: &[Tok]) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < toks.len() {
        let (dotted, next) = parse_dotted(toks, i);
        i = next;
        if dotted.is_empty() {
            break;
        }
        let mut alias = None;
        if toks.get(i).is_some_and(|t| t.is_name("as")) {
            alias = toks.get(i + 1).and_then(Tok::name).map(String::from);
            i += 2;
        }
        out.push((dotted, alias));
        if toks.get(i).is_some_and(|t| t.is_op(",")) {
            i += 1;
        } else {
            break;
        }
    }
    out
}

fn parse_dotted(toks: &[Tok], mut i: usize) -> (String, usize) {
    let mut parts: Vec<&str> = Vec::new();
    while let Some(name) = toks.get(i).and_then(Tok::name) {
        if name == "import" || name == "as" {
            break;
        }
        parts.push(name);
        i += 1;
        if toks.get(i).is_some_and(|t| t.is_op(".")) {
            i += 1;
        } else {
            break;
        }
    }
    (parts.join("."), i)
}

/// Parse the tail of `from <...>`. Returns the statement and the names it
/// binds locally (aliases applied).
fn parse_from(toks: &[Tok], ctx: Ctx) -> Option<(ImportStatement, Option<Vec<String>>)> {
    let mut i = 0;
    let mut level = 0;
    while let Some(Tok::Op(o)) = toks.get(i) {
        if o != "." {
            break;
        }
        level += 1;
        i += 1;
    }
    let (module, next) = parse_dotted(toks, i);
    i = next;
    if !toks.get(i)?.is_name("import") {
        return None;
    }
    i += 1;

    let mut names = Vec::new();
    let mut bound = Vec::new();
    while i < toks.len() {
        match &toks[i] {
            Tok::Op(o) if o == "*" => {
                names.push("*".to_string());
                bound.push("*".to_string());
                i += 1;
            }
            Tok::Name(n) => {
                names.push(n.clone());
                if toks.get(i + 1).is_some_and(|t| t.is_name("as")) {
                    if let Some(alias) = toks.get(i + 2).and_then(Tok::name) {
                        bound.push(alias.to_string());
                    }
                    i += 3;
                } else {
                    bound.push(n.clone());
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    if module.is_empty() && level == 0 {
        return None;
    }

    Some((
        ImportStatement {
            module,
            level,
            names: Some(names),
            conditional: ctx.conditional,
            line: ctx.line,
        },
        Some(bound),
    ))
}

/// `x = ...`, `x: int = ...`, `a, b = ...`
fn collect_assignment_targets(toks: &[Tok], globals: &mut BTreeSet<String>) {
    let Some(Tok::Name(first)) = toks.first() else {
        return;
    };
    if toks.get(1).is_some_and(|t| t.is_op(":") || t.is_op("=")) {
        globals.insert(first.clone());
        return;
    }
    if let Some(eq) = top_level_position(toks, |t| t.is_op("=")) {
        let targets = &toks[..eq];
        if targets
            .iter()
            .all(|t| matches!(t, Tok::Name(_)) || t.is_op(","))
        {
            globals.extend(targets.iter().filter_map(Tok::name).map(String::from));
        }
    }
}

/// `importlib.import_module("x")` and `__import__("x")` with a literal name.
fn scan_dynamic_imports(toks: &[Tok], line: usize, result: &mut ScanResult) {
    for window in toks.windows(3) {
        let [callee, open, arg] = window else {
            continue;
        };
        let is_call = (callee.is_name("import_module") || callee.is_name("__import__"))
            && open.is_op("(");
        if !is_call {
            continue;
        }
        if let Tok::Str(name) = arg {
            let valid = !name.is_empty()
                && name
                    .split('.')
                    .all(|p| !p.is_empty() && p.chars().all(|c| c.is_alphanumeric() || c == '_'));
            if valid {
                result.imports.push(ImportStatement {
                    module: name.clone(),
                    level: 0,
                    names: None,
                    conditional: true,
                    line,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules(result: &ScanResult) -> Vec<(&str, bool)> {
        result
            .imports
            .iter()
            .map(|i| (i.module.as_str(), i.conditional))
            .collect()
    }

    #[test]
    fn test_plain_imports() {
        let r = scan_source("import os\nimport a.b as c, d\n");
        assert_eq!(modules(&r), vec![("os", false), ("a.b", false), ("d", false)]);
        assert!(r.globals.contains("os"));
        assert!(r.globals.contains("c"));
        assert!(r.globals.contains("d"));
        assert!(!r.globals.contains("a"));
    }

    #[test]
    fn test_from_imports_relative_and_parenthesized() {
        let src = "from . import sibling\nfrom ..pkg.mod import (\n    a,\n    b as bee,\n)\nfrom x import *\n";
        let r = scan_source(src);
        assert_eq!(r.imports.len(), 3);

        assert_eq!(r.imports[0].level, 1);
        assert_eq!(r.imports[0].module, "");
        assert_eq!(r.imports[0].names, Some(vec!["sibling".to_string()]));

        assert_eq!(r.imports[1].level, 2);
        assert_eq!(r.imports[1].module, "pkg.mod");
        assert_eq!(r.imports[1].names, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(r.globals.contains("bee"));

        assert!(r.imports[2].is_star());
        assert_eq!(r.imports[2].line, 6);
    }

    #[test]
    fn test_conditional_blocks() {
        let src = r#"
import top
try:
    import fast
except ImportError:
    fast = None
if sys.platform == "win32":
    import winreg
else:
    import posix_only
def helper():
    import lazy
class Thing:
    import in_class
    def method(self):
        import in_method
with ctx():
    import in_with
import after
"#;
        let r = scan_source(src);
        assert_eq!(
            modules(&r),
            vec![
                ("top", false),
                ("fast", true),
                ("winreg", true),
                ("posix_only", true),
                ("lazy", true),
                ("in_class", false),
                ("in_method", true),
                ("in_with", false),
                ("after", false),
            ]
        );
        assert!(r.globals.contains("helper"));
        assert!(r.globals.contains("Thing"));
        assert!(r.globals.contains("fast"));
        assert!(!r.globals.contains("lazy"));
        assert!(!r.globals.contains("method"));
    }

    #[test]
    fn test_inline_compound_body() {
        let r = scan_source("if TYPE_CHECKING: import typing_extensions; import other\nimport plain\n");
        assert_eq!(
            modules(&r),
            vec![
                ("typing_extensions", true),
                ("other", true),
                ("plain", false)
            ]
        );
    }

    #[test]
    fn test_strings_and_comments_are_ignored() {
        let src = "\"\"\"\nimport not_real\n\"\"\"\n# import nope\nx = 'import fake'\nimport real\n";
        let r = scan_source(src);
        assert_eq!(modules(&r), vec![("real", false)]);
        assert_eq!(r.imports[0].line, 6);
    }

    #[test]
    fn test_line_continuation() {
        let r = scan_source("from pkg import \\\n    thing\n");
        assert_eq!(r.imports[0].names, Some(vec!["thing".to_string()]));
    }

    #[test]
    fn test_match_soft_keyword() {
        let src = "match = 3\nmatch command:\n    case 'x':\n        import inside\nimport outside\n";
        let r = scan_source(src);
        assert_eq!(modules(&r), vec![("inside", true), ("outside", false)]);
        assert!(r.globals.contains("match"));
    }

    #[test]
    fn test_globals_from_assignments() {
        let r = scan_source("A = 1\nB: int = 2\nc, d = 3, 4\nx += 1\nfoo(bar=1)\n");
        for name in ["A", "B", "c", "d"] {
            assert!(r.globals.contains(name), "{name}");
        }
        assert!(!r.globals.contains("x"));
        assert!(!r.globals.contains("foo"));
    }

    #[test]
    fn test_dunder_file_and_dynamic_imports() {
        let src = "import importlib\nHERE = __file__\nmod = importlib.import_module('plugins.core')\n__import__(name)\n";
        let r = scan_source(src);
        assert!(r.uses_dunder_file);
        assert!(
            r.imports
                .iter()
                .any(|i| i.module == "plugins.core" && i.conditional)
        );
        assert_eq!(r.imports.len(), 2);
    }

    #[test]
    fn test_string_prefixes() {
        let r = scan_source("x = rb'import a'\ny = f\"{v}\"\nimport b\n");
        assert_eq!(modules(&r), vec![("b", false)]);
    }
}
