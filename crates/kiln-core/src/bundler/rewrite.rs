//! Module body rewriting.
//!
//! Turns ES module syntax into calls against the bundle's module registry.
//! The rewriter works on the token stream of [`tokenize`], so comments,
//! strings and templates are never touched. Every replacement keeps the
//! newlines of the text it replaces: the output has the line count of the
//! source and source maps stay line-accurate.
//!
//! Imported names are live. An import statement binds one module variable
//! (`__kiln_m0`) and every reference to an imported name reads through it
//! (`__kiln_m0.name`), so a module in an import cycle sees a binding as soon
//! as the exporting module has initialised it.

use super::error::ParseError;
use super::loader::js_string;
use super::scan::{Tok, Token, tokenize};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// Answers the questions the rewriter has about a module's imports.
pub(crate) trait RewriteContext {
    /// Registry key of the module a specifier resolved to.
    fn module_key(&self, specifier: &str) -> Option<String>;

    /// Expression replacing `import(specifier)`.
    fn dynamic_import(&self, specifier: &str) -> Option<String>;
}

/// A rewritten module body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rewritten {
    /// Export definitions to run before the body, for ES modules.
    pub header: Option<String>,
    /// One output line per source line.
    pub lines: Vec<String>,
}

/// Rewrite a module's source. `jsx` enables JSX lexing.
///
/// # Errors
/// Returns `ParseError::SyntaxInvalid` when the source cannot be lexed.
pub(crate) fn rewrite_module(
    source: &str,
    jsx: bool,
    ctx: &dyn RewriteContext,
) -> Result<Rewritten, ParseError> {
    let tokens = tokenize(source, jsx)?;
    let mut rewriter = Rewriter::new(source, &tokens, ctx);
    rewriter.imports();
    rewriter.exports();
    rewriter.scopes();
    rewriter.references();
    Ok(rewriter.finish())
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Keywords that may precede an object literal.
const OPERATOR_KEYWORDS: &[&str] = &[
    "return", "typeof", "yield", "await", "case", "in", "of", "new", "delete", "void", "throw",
    "default", "instanceof",
];

struct Rewriter<'a> {
    source: &'a str,
    tokens: &'a [Token],
    ctx: &'a dyn RewriteContext,
    /// Matching bracket of every bracket token.
    partner: Vec<Option<usize>>,
    /// Innermost bracket token enclosing each token.
    enclosing: Vec<Option<usize>>,
    /// Tokens inside a replaced statement.
    consumed: Vec<bool>,
    edits: Vec<Edit>,
    /// Imported local name → expression reading the live binding.
    bindings: HashMap<String, String>,
    /// Specifier → module variable.
    module_vars: HashMap<String, String>,
    /// (exported name, getter expression)
    exports: Vec<(String, String)>,
    /// Tokens that declare a name.
    declared: HashSet<usize>,
    /// Imported names redeclared over an inclusive token range.
    shadows: Vec<(String, usize, usize)>,
    class_bodies: HashSet<usize>,
    esm: bool,
}

impl<'a> Rewriter<'a> {
    fn new(source: &'a str, tokens: &'a [Token], ctx: &'a dyn RewriteContext) -> Self {
        let mut partner = vec![None; tokens.len()];
        let mut enclosing = vec![None; tokens.len()];
        let mut stack: Vec<usize> = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            match token.tok {
                Tok::Punct(')' | ']' | '}') | Tok::JsxBrace('}') => {
                    if let Some(open) = stack.pop() {
                        partner[open] = Some(i);
                        partner[i] = Some(open);
                    }
                    enclosing[i] = stack.last().copied();
                }
                Tok::Punct('(' | '[' | '{') | Tok::JsxBrace('{') => {
                    enclosing[i] = stack.last().copied();
                    stack.push(i);
                }
                _ => enclosing[i] = stack.last().copied(),
            }
        }

        Self {
            source,
            tokens,
            ctx,
            partner,
            enclosing,
            consumed: vec![false; tokens.len()],
            edits: Vec::new(),
            bindings: HashMap::default(),
            module_vars: HashMap::default(),
            exports: Vec::new(),
            declared: HashSet::default(),
            shadows: Vec::new(),
            class_bodies: HashSet::default(),
            esm: false,
        }
    }

    fn tok(&self, i: usize) -> Option<&'a Tok> {
        self.tokens.get(i).map(|t| &t.tok)
    }

    fn ident(&self, i: usize) -> Option<&'a str> {
        self.tokens.get(i).and_then(Token::ident)
    }

    fn string(&self, i: usize) -> Option<&'a str> {
        match self.tok(i) {
            Some(Tok::Str(s)) => Some(s),
            _ => None,
        }
    }

    fn punct(&self, i: usize, c: char) -> bool {
        self.tokens.get(i).is_some_and(|t| t.is_punct(c))
    }

    fn after_dot(&self, i: usize) -> bool {
        i > 0 && self.punct(i - 1, '.')
    }

    fn top_level(&self, i: usize) -> bool {
        self.enclosing[i].is_none()
    }

    /// `=>` starting at `i`.
    fn is_arrow(&self, i: usize) -> bool {
        self.punct(i, '=')
            && self.punct(i + 1, '>')
            && self.tokens[i].end == self.tokens[i + 1].start
    }

    fn is_spread(&self, i: usize) -> bool {
        self.punct(i, '.') && self.punct(i + 1, '.') && self.punct(i + 2, '.')
    }

    /// Closing partner of an opening bracket at `i`.
    fn closer(&self, i: usize) -> Option<usize> {
        self.partner.get(i).copied().flatten().filter(|&p| p > i)
    }

    fn replace(&mut self, start: usize, end: usize, text: impl Into<String>) {
        self.edits.push(Edit {
            start,
            end,
            text: text.into(),
        });
    }

    /// Replace tokens `first..=last` and everything between them.
    fn replace_tokens(&mut self, first: usize, last: usize, text: impl Into<String>) {
        let (start, end) = (self.tokens[first].start, self.tokens[last].end);
        self.replace(start, end, text);
        for consumed in &mut self.consumed[first..=last] {
            *consumed = true;
        }
    }

    fn key(&self, specifier: &str) -> String {
        js_string(
            &self
                .ctx
                .module_key(specifier)
                .unwrap_or_else(|| specifier.to_string()),
        )
    }

    /// Index of the `from` specifier of the clause starting at `j`.
    fn find_from(&self, mut j: usize) -> Option<usize> {
        while let Some(tok) = self.tok(j) {
            match tok {
                Tok::Punct('{') => j = self.closer(j)?,
                Tok::Punct(';') => return None,
                Tok::Ident(w) if w == "from" && self.string(j + 1).is_some() => return Some(j + 1),
                Tok::Ident(w) if w == "import" || w == "export" => return None,
                _ => {}
            }
            j += 1;
        }
        None
    }

    /// Last token of a statement whose specifier is at `spec`: import
    /// attributes and the semicolon belong to it.
    fn statement_tail(&self, spec: usize) -> usize {
        let mut end = spec;
        if matches!(self.ident(end + 1), Some("with" | "assert")) && self.punct(end + 2, '{') {
            end = self.closer(end + 2).unwrap_or(end);
        }
        if self.punct(end + 1, ';') {
            end += 1;
        }
        end
    }

    /// `name`, `name as alias` or `"str" as alias` in `start..end`.
    /// Type-only specifiers yield `None`.
    fn specifier(&self, start: usize, end: usize) -> Option<(String, String)> {
        let name = |i: usize| match self.tok(i) {
            Some(Tok::Ident(s) | Tok::Str(s)) if i < end => Some(s.clone()),
            _ => None,
        };
        let len = end.saturating_sub(start);
        if self.ident(start) == Some("type")
            && len != 1
            && !(len == 3 && self.ident(start + 1) == Some("as"))
        {
            return None;
        }
        let first = name(start)?;
        if len >= 3 && self.ident(start + 1) == Some("as") {
            Some((first, name(start + 2)?))
        } else {
            Some((first.clone(), first))
        }
    }

    /// Specifiers of the `{ ... }` list opening at `open`.
    fn specifier_list(&self, open: usize) -> (Vec<(String, String)>, bool) {
        let close = self.closer(open).unwrap_or(open);
        let mut items = Vec::new();
        let mut skipped_types = false;
        let mut k = open + 1;
        while k < close {
            let item_end = (k..close).find(|&m| self.punct(m, ',')).unwrap_or(close);
            match self.specifier(k, item_end) {
                Some(item) => items.push(item),
                None if item_end > k => skipped_types = true,
                None => {}
            }
            k = item_end + 1;
        }
        (items, skipped_types)
    }

    fn imports(&mut self) {
        let mut i = 0;
        while i < self.tokens.len() {
            if self.ident(i) == Some("import") && self.top_level(i) && !self.after_dot(i) {
                if let Some(end) = self.import_statement(i) {
                    i = end + 1;
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Rewrite the import declaration at `i`; returns its last token.
    fn import_statement(&mut self, i: usize) -> Option<usize> {
        // import "./side-effect";
        if let Some(spec) = self.string(i + 1) {
            let end = self.statement_tail(i + 1);
            let text = format!("require({});", self.key(spec));
            self.replace_tokens(i, end, text);
            self.esm = true;
            return Some(end);
        }
        if !matches!(
            self.tok(i + 1),
            Some(Tok::Ident(_) | Tok::Punct('{' | '*'))
        ) {
            return None;
        }

        let from = self.find_from(i + 1)?;
        let spec = self.string(from)?;
        let end = self.statement_tail(from);
        self.esm = true;

        // `import type from` binds a value named `type`
        let type_only = self.ident(i + 1) == Some("type")
            && !self.punct(i + 2, ',')
            && !(self.ident(i + 2) == Some("from") && from == i + 3);
        if type_only {
            self.replace_tokens(i, end, "");
            return Some(end);
        }

        let mut j = i + 1;
        let mut default = None;
        if let Some(name) = self.ident(j) {
            default = Some(name);
            j += 1;
            if self.punct(j, ',') {
                j += 1;
            }
        }
        let mut namespace = None;
        let mut named = Vec::new();
        let mut skipped_types = false;
        if self.punct(j, '*') {
            namespace = self.ident(j + 2);
        } else if self.punct(j, '{') {
            (named, skipped_types) = self.specifier_list(j);
        }

        let key = self.key(spec);
        let text = if let Some(ns) = namespace {
            self.bind(ns, default, &named);
            format!("const {ns} = __kiln.interop(require({key}));")
        } else if default.is_none() && named.is_empty() {
            if skipped_types {
                String::new()
            } else {
                format!("require({key});")
            }
        } else {
            let (var, fresh) = self.module_var(spec);
            self.bind(&var, default, &named);
            if fresh {
                format!("const {var} = __kiln.interop(require({key}));")
            } else {
                String::new()
            }
        };
        self.replace_tokens(i, end, text);
        Some(end)
    }

    fn module_var(&mut self, spec: &str) -> (String, bool) {
        if let Some(var) = self.module_vars.get(spec) {
            return (var.clone(), false);
        }
        let var = format!("__kiln_m{}", self.module_vars.len());
        self.module_vars.insert(spec.to_string(), var.clone());
        (var, true)
    }

    fn bind(&mut self, var: &str, default: Option<&str>, named: &[(String, String)]) {
        if let Some(local) = default {
            self.bindings
                .insert(local.to_string(), format!("{var}.default"));
        }
        for (imported, local) in named {
            self.bindings.insert(local.clone(), member(var, imported));
        }
    }

    fn exports(&mut self) {
        let mut i = 0;
        while i < self.tokens.len() {
            if self.ident(i) == Some("export")
                && self.top_level(i)
                && !self.after_dot(i)
                && !self.consumed[i]
            {
                self.esm = true;
                i = self.export_statement(i) + 1;
                continue;
            }
            i += 1;
        }
    }

    /// Rewrite the export at `i`; returns the last token handled.
    fn export_statement(&mut self, i: usize) -> usize {
        let next = i + 1;
        match self.tok(next) {
            Some(Tok::Ident(w)) if w == "type" && (self.punct(i + 2, '{') || self.punct(i + 2, '*')) => {
                let end = match self.find_from(i + 2) {
                    Some(spec) => self.statement_tail(spec),
                    None => {
                        let close = self.closer(i + 2).unwrap_or(i + 2);
                        if self.punct(close + 1, ';') { close + 1 } else { close }
                    }
                };
                self.replace_tokens(i, end, "");
                end
            }
            Some(Tok::Punct('*')) => {
                let Some(from) = self.find_from(next) else {
                    return i;
                };
                let Some(spec) = self.string(from) else {
                    return i;
                };
                let end = self.statement_tail(from);
                let module = format!("__kiln.interop(require({}))", self.key(spec));
                let text = match (self.ident(next + 1), self.tok(next + 2)) {
                    (Some("as"), Some(Tok::Ident(ns) | Tok::Str(ns))) => format!(
                        "__kiln.reexport(exports, {module}, {{ {}: \"*\" }});",
                        property_key(ns)
                    ),
                    _ => format!("__kiln.reexport(exports, {module});"),
                };
                self.replace_tokens(i, end, text);
                end
            }
            Some(Tok::Punct('{')) => {
                let Some(close) = self.closer(next) else {
                    return i;
                };
                let (pairs, _) = self.specifier_list(next);
                if self.ident(close + 1) == Some("from") {
                    if let Some(spec) = self.string(close + 2) {
                        let end = self.statement_tail(close + 2);
                        let names: Vec<String> = pairs
                            .iter()
                            .map(|(imported, exported)| {
                                format!("{}: {}", property_key(exported), js_string(imported))
                            })
                            .collect();
                        let text = format!(
                            "__kiln.reexport(exports, __kiln.interop(require({})), {{ {} }});",
                            self.key(spec),
                            names.join(", ")
                        );
                        self.replace_tokens(i, end, text);
                        return end;
                    }
                }
                for (local, exported) in pairs {
                    let getter = self.bindings.get(&local).cloned().unwrap_or(local);
                    self.exports.push((exported, getter));
                }
                let end = if self.punct(close + 1, ';') { close + 1 } else { close };
                self.replace_tokens(i, end, "");
                end
            }
            Some(Tok::Ident(w)) if w == "default" => self.export_default(i),
            Some(Tok::Ident(_)) => self.export_declaration(i),
            _ => i,
        }
    }

    fn export_default(&mut self, i: usize) -> usize {
        let mut j = i + 2;
        if self.ident(j) == Some("async") && self.ident(j + 1) == Some("function") {
            j += 1;
        }
        let name = match self.ident(j) {
            Some("function") => {
                let k = if self.punct(j + 1, '*') { j + 2 } else { j + 1 };
                self.ident(k)
            }
            Some("class") => self
                .ident(j + 1)
                .filter(|n| !matches!(*n, "extends" | "implements")),
            _ => None,
        };
        match name {
            Some(name) if self.tokens.len() > i + 2 => {
                self.exports.push(("default".to_string(), name.to_string()));
                let (start, end) = (self.tokens[i].start, self.tokens[i + 2].start);
                self.replace(start, end, "");
            }
            _ => {
                let (start, end) = (self.tokens[i].start, self.tokens[i + 1].end);
                self.replace(start, end, "exports.default =");
            }
        }
        i + 1
    }

    fn export_declaration(&mut self, i: usize) -> usize {
        let mut j = i + 1;
        let (start, end) = (self.tokens[i].start, self.tokens[j].start);
        self.replace(start, end, "");

        if self.ident(j) == Some("declare") {
            return i;
        }
        while matches!(self.ident(j), Some("abstract" | "async")) {
            j += 1;
        }
        let names: Vec<usize> = match self.ident(j) {
            Some("const") if self.ident(j + 1) == Some("enum") => vec![j + 2],
            Some("const" | "let" | "var") => self.declarators(j + 1),
            Some("function") => {
                let k = if self.punct(j + 1, '*') { j + 2 } else { j + 1 };
                vec![k]
            }
            Some("class" | "enum" | "namespace") => vec![j + 1],
            _ => Vec::new(),
        };
        for idx in names {
            if let Some(name) = self.ident(idx) {
                self.exports.push((name.to_string(), name.to_string()));
            }
        }
        i
    }

    /// Token indices of the names bound by the declarators starting at `j`.
    fn declarators(&self, mut j: usize) -> Vec<usize> {
        let mut names = Vec::new();
        loop {
            j = self.pattern(j, &mut names);
            j = self.skip_binding_tail(j, self.tokens.len());
            if self.punct(j, ',') {
                j += 1;
            } else {
                return names;
            }
        }
    }

    /// Collect the names bound by the pattern at `i`; returns the index
    /// after it.
    fn pattern(&self, i: usize, out: &mut Vec<usize>) -> usize {
        match self.tok(i) {
            Some(Tok::Ident(_)) => {
                out.push(i);
                i + 1
            }
            Some(Tok::Punct('{')) => {
                let Some(close) = self.closer(i) else {
                    return i + 1;
                };
                let mut j = i + 1;
                while j < close {
                    if self.is_spread(j) {
                        j = self.pattern(j + 3, out);
                    } else {
                        let key_end = if self.punct(j, '[') {
                            self.closer(j).map_or(j + 1, |p| p + 1)
                        } else {
                            j + 1
                        };
                        if self.punct(key_end, ':') {
                            j = self.pattern(key_end + 1, out);
                        } else {
                            if self.ident(j).is_some() {
                                out.push(j);
                            }
                            j = key_end;
                        }
                    }
                    j = self.skip_binding_tail(j, close) + 1;
                }
                close + 1
            }
            Some(Tok::Punct('[')) => {
                let Some(close) = self.closer(i) else {
                    return i + 1;
                };
                let mut j = i + 1;
                while j < close {
                    if self.punct(j, ',') {
                        j += 1;
                        continue;
                    }
                    j = if self.is_spread(j) {
                        self.pattern(j + 3, out)
                    } else {
                        self.pattern(j, out)
                    };
                    j = self.skip_binding_tail(j, close) + 1;
                }
                close + 1
            }
            _ => i + 1,
        }
    }

    /// Skip a type annotation and a default value after a binding, up to
    /// the next `,` before `end`.
    fn skip_binding_tail(&self, mut j: usize, end: usize) -> usize {
        let start = j;
        let mut angle = 0usize;
        let mut in_type = false;
        let mut seen_eq = false;
        while j < end {
            let Some(tok) = self.tok(j) else {
                break;
            };
            if j > start && self.statement_break(j) {
                break;
            }
            match tok {
                Tok::Punct(',') if angle == 0 => break,
                Tok::Punct(';' | ')' | ']' | '}') | Tok::JsxBrace('}') => break,
                Tok::Punct('=') if self.is_arrow(j) => {
                    j += 2;
                    continue;
                }
                Tok::Punct('=') if angle == 0 => {
                    in_type = false;
                    seen_eq = true;
                }
                Tok::Punct(':') if !seen_eq && angle == 0 => in_type = true,
                Tok::Punct('<') if in_type => angle += 1,
                Tok::Punct('>') if in_type && angle > 0 => angle -= 1,
                _ => {}
            }
            j = self.closer(j).map_or(j + 1, |p| p + 1);
        }
        j
    }

    /// Index of the token ending the expression starting at `j`.
    fn expression_end(&self, j: usize) -> usize {
        let mut k = j;
        while let Some(tok) = self.tok(k) {
            if k > j && self.statement_break(k) {
                break;
            }
            if matches!(
                tok,
                Tok::Punct(',' | ';' | ')' | ']' | '}') | Tok::JsxBrace('}')
            ) {
                break;
            }
            k = self.closer(k).map_or(k + 1, |p| p + 1);
        }
        k
    }

    /// Whether a new statement starts at `j` by automatic semicolon
    /// insertion.
    fn statement_break(&self, j: usize) -> bool {
        let (Some(prev), Some(token)) = (
            j.checked_sub(1).and_then(|p| self.tokens.get(p)),
            self.tokens.get(j),
        ) else {
            return false;
        };
        token.line > prev.line
            && matches!(&token.tok, Tok::Ident(w)
                if !matches!(w.as_str(), "instanceof" | "in" | "of" | "as" | "satisfies"))
            && matches!(
                prev.tok,
                Tok::Ident(_) | Tok::Str(_) | Tok::Value | Tok::Punct(')' | ']' | '}')
            )
    }

    /// Last token of the body of the arrow whose `=>` starts at `arrow`.
    fn arrow_body_end(&self, arrow: usize) -> usize {
        let body = arrow + 2;
        if self.punct(body, '{') {
            self.closer(body).unwrap_or(body)
        } else {
            self.expression_end(body)
        }
    }

    /// Token range a `let`/`const`/`var`/`function`/`class` declared at `k`
    /// is visible in. Top-level declarations have none.
    fn block_scope(&self, k: usize) -> Option<(usize, usize)> {
        let open = self.enclosing[k]?;
        let for_head = self.punct(open, '(')
            && open > 0
            && (self.ident(open - 1) == Some("for")
                || (self.ident(open - 1) == Some("await")
                    && open > 1
                    && self.ident(open - 2) == Some("for")));
        if for_head {
            let close = self.closer(open)?;
            let end = if self.punct(close + 1, '{') {
                self.closer(close + 1)?
            } else {
                self.expression_end(close + 1)
            };
            return Some((open, end));
        }
        Some((open, self.closer(open)?))
    }

    fn declare(&mut self, names: &[usize], scope: Option<(usize, usize)>) {
        for &idx in names {
            self.declared.insert(idx);
            let Some(name) = self.ident(idx) else {
                continue;
            };
            if let Some((start, end)) = scope {
                if self.bindings.contains_key(name) {
                    self.shadows.push((name.to_string(), start, end));
                }
            }
        }
    }

    fn scopes(&mut self) {
        for k in 0..self.tokens.len() {
            if self.consumed[k] || self.after_dot(k) {
                continue;
            }
            match self.tok(k) {
                Some(Tok::Ident(word)) => match word.as_str() {
                    "var" | "let" | "const"
                        if matches!(
                            self.tok(k + 1),
                            Some(Tok::Ident(_) | Tok::Punct('{' | '['))
                        ) && self.ident(k + 1) != Some("enum") =>
                    {
                        let names = self.declarators(k + 1);
                        let scope = self.block_scope(k);
                        self.declare(&names, scope);
                    }
                    "function" => {
                        let name = if self.punct(k + 1, '*') { k + 2 } else { k + 1 };
                        if self.ident(name).is_some() {
                            let scope = self.block_scope(k);
                            self.declare(&[name], scope);
                        }
                    }
                    "class" => {
                        if self
                            .ident(k + 1)
                            .is_some_and(|n| !matches!(n, "extends" | "implements"))
                        {
                            let scope = self.block_scope(k);
                            self.declare(&[k + 1], scope);
                        }
                        let mut j = k + 1;
                        while let Some(tok) = self.tok(j) {
                            match tok {
                                Tok::Punct('{') => {
                                    self.class_bodies.insert(j);
                                    break;
                                }
                                Tok::Punct(';') => break,
                                _ => j = self.closer(j).map_or(j + 1, |p| p + 1),
                            }
                        }
                    }
                    _ if self.is_arrow(k + 1) => {
                        let end = self.arrow_body_end(k + 1);
                        self.declare(&[k], Some((k, end)));
                    }
                    _ => {}
                },
                Some(Tok::Punct('(')) => {
                    let Some(close) = self.closer(k) else {
                        continue;
                    };
                    let body_end = if self.punct(close + 1, '{') {
                        self.closer(close + 1)
                    } else if self.is_arrow(close + 1) {
                        Some(self.arrow_body_end(close + 1))
                    } else {
                        None
                    };
                    let control = k > 0
                        && matches!(
                            self.ident(k - 1),
                            Some("if" | "for" | "while" | "switch" | "with")
                        );
                    if let (Some(end), false) = (body_end, control) {
                        let names = self.parameters(k, close);
                        self.declare(&names, Some((k, end)));
                    }
                }
                _ => {}
            }
        }
    }

    fn parameters(&self, open: usize, close: usize) -> Vec<usize> {
        let mut names = Vec::new();
        let mut j = open + 1;
        while j < close {
            if self.is_spread(j) {
                j += 3;
            }
            while matches!(
                self.ident(j),
                Some("public" | "private" | "protected" | "readonly" | "override")
            ) && matches!(self.tok(j + 1), Some(Tok::Ident(_) | Tok::Punct('{' | '[')))
            {
                j += 1;
            }
            j = self.pattern(j, &mut names);
            j = self.skip_binding_tail(j, close) + 1;
        }
        names
    }

    fn shadowed(&self, name: &str, k: usize) -> bool {
        self.shadows
            .iter()
            .any(|(n, start, end)| n == name && *start <= k && k <= *end)
    }

    /// A brace that opens an object literal rather than a block.
    fn is_object_brace(&self, b: usize) -> bool {
        if !self.punct(b, '{') || b == 0 {
            return false;
        }
        match &self.tokens[b - 1].tok {
            Tok::Punct('>') => !(b >= 2 && self.is_arrow(b - 2)),
            Tok::Punct(c) => !matches!(c, ')' | ']' | '}' | '{' | ';'),
            Tok::Ident(w) => OPERATOR_KEYWORDS.contains(&w.as_str()),
            Tok::JsxBrace('{') => true,
            _ => false,
        }
    }

    /// `name() {}` in an object literal or class body.
    fn is_method_name(&self, k: usize) -> bool {
        if !self.punct(k + 1, '(') {
            return false;
        }
        let body = self.closer(k + 1).is_some_and(|close| self.punct(close + 1, '{'));
        let position = k == 0
            || matches!(self.tok(k - 1), Some(Tok::Punct('{' | ',' | ';' | '}' | '*')))
            || matches!(self.ident(k - 1), Some("get" | "set" | "static" | "async"));
        body && position
    }

    /// Whether the identifier at `k` reads a variable.
    fn is_reference(&self, k: usize) -> bool {
        let prev = k.checked_sub(1).and_then(|p| self.tok(p));
        // `obj.name`, but not `...name`
        if self.after_dot(k) && !(k >= 2 && self.punct(k - 2, '.')) {
            return false;
        }
        if matches!(prev, Some(Tok::Punct('#'))) {
            return false;
        }
        if matches!(prev, Some(Tok::Ident(w)) if w == "break" || w == "continue") {
            return false;
        }
        let Some(open) = self.enclosing[k] else {
            return true;
        };
        if !self.punct(open, '{') {
            return true;
        }
        let after_separator = matches!(prev, Some(Tok::Punct('{' | ',')));
        if after_separator && self.punct(k + 1, ':') {
            return false;
        }
        if self.is_method_name(k) {
            return false;
        }
        if self.class_bodies.contains(&open) {
            let member_position = matches!(prev, Some(Tok::Punct('{' | ';' | '}' | '*')))
                || matches!(
                    prev,
                    Some(Tok::Ident(w)) if matches!(
                        w.as_str(),
                        "static" | "get" | "set" | "async" | "readonly" | "public"
                            | "private" | "protected" | "accessor" | "declare" | "override"
                    )
                );
            if member_position {
                return false;
            }
        }
        true
    }

    /// `{ name }` in an object literal.
    fn is_shorthand(&self, k: usize) -> bool {
        self.enclosing[k].is_some_and(|open| self.is_object_brace(open))
            && matches!(
                k.checked_sub(1).and_then(|p| self.tok(p)),
                Some(Tok::Punct('{' | ','))
            )
            && matches!(self.tok(k + 1), Some(Tok::Punct(',' | '}')))
    }

    fn references(&mut self) {
        let tokens = self.tokens;
        for (k, token) in tokens.iter().enumerate() {
            if self.consumed[k] {
                continue;
            }
            match &token.tok {
                Tok::Ident(name) if name == "require" && !self.after_dot(k) => self.require_call(k),
                Tok::Ident(name) if name == "import" && !self.after_dot(k) => {
                    self.dynamic_import(k);
                }
                Tok::Ident(name) => {
                    let Some(expr) = self.bindings.get(name) else {
                        continue;
                    };
                    if self.declared.contains(&k)
                        || self.shadowed(name, k)
                        || !self.is_reference(k)
                    {
                        continue;
                    }
                    let text = if self.is_shorthand(k) {
                        format!("{name}: {expr}")
                    } else {
                        expr.clone()
                    };
                    self.replace(token.start, token.end, text);
                }
                Tok::JsxTag(name) => {
                    if let Some(expr) = self.bindings.get(name) {
                        if !self.shadowed(name, k) {
                            let text = expr.clone();
                            self.replace(token.start, token.end, text);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// `require("x")`: only the specifier changes.
    fn require_call(&mut self, k: usize) {
        if !(self.punct(k + 1, '(') && self.punct(k + 3, ')')) {
            return;
        }
        let Some(spec) = self.string(k + 2) else {
            return;
        };
        if let Some(key) = self.ctx.module_key(spec) {
            let token = &self.tokens[k + 2];
            let (start, end) = (token.start, token.end);
            self.replace(start, end, js_string(&key));
            self.consumed[k + 2] = true;
        }
    }

    /// `import("x")` becomes the context's loader expression.
    fn dynamic_import(&mut self, k: usize) {
        if !self.punct(k + 1, '(') {
            return;
        }
        let Some(spec) = self.string(k + 2) else {
            return;
        };
        if !(self.punct(k + 3, ')') || self.punct(k + 3, ',')) {
            return;
        }
        let Some(close) = self.closer(k + 1) else {
            return;
        };
        if let Some(expr) = self.ctx.dynamic_import(spec) {
            self.replace_tokens(k, close, expr);
        }
    }

    fn finish(mut self) -> Rewritten {
        self.edits.sort_by_key(|e| e.start);
        let mut out = String::with_capacity(self.source.len());
        let mut pos = 0;
        for edit in &self.edits {
            if edit.start < pos {
                continue;
            }
            out.push_str(&self.source[pos..edit.start]);
            out.push_str(&edit.text);
            let newlines = self.source[edit.start..edit.end].matches('\n').count();
            out.push_str(&"\n".repeat(newlines));
            pos = edit.end;
        }
        out.push_str(&self.source[pos..]);

        let header = self.esm.then(|| {
            let mut seen = HashSet::default();
            let getters: Vec<String> = self
                .exports
                .iter()
                .filter(|(name, _)| seen.insert(name.clone()))
                .map(|(name, getter)| format!("{}: () => {getter}", property_key(name)))
                .collect();
            if getters.is_empty() {
                "__kiln.esm(exports, {});".to_string()
            } else {
                format!("__kiln.esm(exports, {{ {} }});", getters.join(", "))
            }
        });

        // A line emptied by a replacement still counts
        let mut lines: Vec<String> = out
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        if self.source.is_empty() || self.source.ends_with('\n') {
            lines.pop();
        }

        Rewritten { header, lines }
    }
}

fn is_plain_name(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn property_key(name: &str) -> String {
    if is_plain_name(name) {
        name.to_string()
    } else {
        js_string(name)
    }
}

/// `var.name`, or `var["name"]` for names that are not identifiers.
fn member(var: &str, name: &str) -> String {
    if is_plain_name(name) {
        format!("{var}.{name}")
    } else {
        format!("{var}[{}]", js_string(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Keys;

    impl RewriteContext for Keys {
        fn module_key(&self, specifier: &str) -> Option<String> {
            specifier
                .strip_prefix("./")
                .map(|s| format!("src/{s}.js"))
        }

        fn dynamic_import(&self, specifier: &str) -> Option<String> {
            self.module_key(specifier)
                .map(|key| format!("__lazy({})", js_string(&key)))
        }
    }

    fn rewrite(source: &str) -> Rewritten {
        rewrite_module(source, false, &Keys).unwrap()
    }

    fn rewrite_jsx(source: &str) -> Rewritten {
        rewrite_module(source, true, &Keys).unwrap()
    }

    #[test]
    fn test_import_forms() {
        let module_a = "const __kiln_m0 = __kiln.interop(require(\"src/a.js\"));";
        let cases = [
            ("import './a';", "require(\"src/a.js\");"),
            ("import a from './a';", module_a),
            ("import { x, y as z } from \"./a\";", module_a),
            ("import a, { x } from './a';", module_a),
            (
                "import * as ns from './a';",
                "const ns = __kiln.interop(require(\"src/a.js\"));",
            ),
            (
                "import d, * as ns from './a';",
                "const ns = __kiln.interop(require(\"src/a.js\"));",
            ),
            ("import {} from './a';", "require(\"src/a.js\");"),
            ("import type { T } from './a';", ""),
            ("import { type T } from './a';", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(rewrite(input).lines, vec![expected.to_string()], "{input}");
        }
    }

    #[test]
    fn test_imported_names_read_through_module_variable() {
        let source = "import a, { x, y as z, 'odd-name' as odd } from './a';\nimport d, * as ns from './b';\nconsole.log(a, x, z, odd, d, ns.x);\n";
        let out = rewrite(source);
        assert_eq!(
            out.lines[2],
            "console.log(__kiln_m0.default, __kiln_m0.x, __kiln_m0.y, __kiln_m0[\"odd-name\"], ns.default, ns.x);"
        );
    }

    #[test]
    fn test_repeated_specifier_shares_variable() {
        let out = rewrite("import { a } from './a';\nimport { b } from './a';\nf(a, b);\n");
        assert_eq!(
            out.lines,
            vec![
                "const __kiln_m0 = __kiln.interop(require(\"src/a.js\"));",
                "",
                "f(__kiln_m0.a, __kiln_m0.b);",
            ]
        );
    }

    #[test]
    fn test_cyclic_modules_use_live_bindings() {
        let a = rewrite(
            "import { b } from './b';\nexport const a = 'A';\nconsole.log(b());\n",
        );
        assert_eq!(
            a.lines,
            vec![
                "const __kiln_m0 = __kiln.interop(require(\"src/b.js\"));",
                "const a = 'A';",
                "console.log(__kiln_m0.b());",
            ]
        );
        assert_eq!(a.header.as_deref(), Some("__kiln.esm(exports, { a: () => a });"));

        let b = rewrite("import { a } from './a';\nexport function b() { return 'b+' + a; }\n");
        assert_eq!(b.lines[1], "function b() { return 'b+' + __kiln_m0.a; }");
        assert_eq!(b.header.as_deref(), Some("__kiln.esm(exports, { b: () => b });"));
    }

    #[test]
    fn test_import_with_trailing_comment() {
        let source = "import { x } from './x'; // helper\nexport const y = x * 2; /* import { z } from './z'; */\n";
        let out = rewrite(source);
        assert_eq!(
            out.lines,
            vec![
                "const __kiln_m0 = __kiln.interop(require(\"src/x.js\")); // helper",
                "const y = __kiln_m0.x * 2; /* import { z } from './z'; */",
            ]
        );
    }

    #[test]
    fn test_import_text_in_strings_and_comments_is_untouched() {
        let source = "const s = `import { w } from './w';`;\n/*\nimport { v } from './v';\nexport default v;\n*/\nconst t = \"export * from './t'\";\n";
        let out = rewrite(source);
        assert_eq!(out.lines, source.lines().collect::<Vec<_>>());
        assert!(out.header.is_none());
    }

    #[test]
    fn test_multiline_import_keeps_line_count() {
        let source = "import {\n  a, // first\n  b,\n} from './a';\nconsole.log(a, b);\n";
        let out = rewrite(source);
        assert_eq!(out.lines.len(), 5);
        assert_eq!(
            out.lines[0],
            "const __kiln_m0 = __kiln.interop(require(\"src/a.js\"));"
        );
        assert_eq!(out.lines[1], "");
        assert_eq!(out.lines[3], "");
        assert_eq!(out.lines[4], "console.log(__kiln_m0.a, __kiln_m0.b);");
    }

    #[test]
    fn test_local_names_shadow_imports() {
        let source = [
            "import { item, render } from './ui';",
            "function list(item) { return item; }",
            "const f = (render) => render;",
            "const g = ({ item }) => item;",
            "const o = { item, render: 1, go() { return render; } };",
            "obj.item = item;",
            "try {} catch (item) { item; }",
            "{ let render = 2; render; }",
            "for (const item of []) { item; }",
            "class View { render() { return item; } }",
            "render(item);",
        ]
        .join("\n");
        let out = rewrite(&source);
        assert_eq!(
            out.lines[1..],
            [
                "function list(item) { return item; }",
                "const f = (render) => render;",
                "const g = ({ item }) => item;",
                "const o = { item: __kiln_m0.item, render: 1, go() { return __kiln_m0.render; } };",
                "obj.item = __kiln_m0.item;",
                "try {} catch (item) { item; }",
                "{ let render = 2; render; }",
                "for (const item of []) { item; }",
                "class View { render() { return __kiln_m0.item; } }",
                "__kiln_m0.render(__kiln_m0.item);",
            ]
        );
    }

    #[test]
    fn test_jsx_component_references() {
        let source = "import Button from './button';\nimport { Icon } from './icon';\nexport const App = () => <Button kind=\"x\"><Icon.Small />{Button.name}</Button>;\n";
        let out = rewrite_jsx(source);
        assert_eq!(
            out.lines[2],
            "const App = () => <__kiln_m0.default kind=\"x\"><__kiln_m1.Icon.Small />{__kiln_m0.default.name}</__kiln_m0.default>;"
        );
    }

    #[test]
    fn test_export_declarations() {
        let source = "export const a = 1;\nexport function f() {}\nexport class C {}\nexport let { p, q: r } = obj;\n";
        let out = rewrite(source);
        assert_eq!(
            out.lines,
            vec!["const a = 1;", "function f() {}", "class C {}", "let { p, q: r } = obj;"]
        );
        assert_eq!(
            out.header.as_deref(),
            Some("__kiln.esm(exports, { a: () => a, f: () => f, C: () => C, p: () => p, r: () => r });")
        );
    }

    #[test]
    fn test_export_default_forms() {
        let out = rewrite("export default function main() {}\n");
        assert_eq!(out.lines, vec!["function main() {}"]);
        assert_eq!(
            out.header.as_deref(),
            Some("__kiln.esm(exports, { default: () => main });")
        );

        let out = rewrite("export default { a: 1 };\n");
        assert_eq!(out.lines, vec!["exports.default = { a: 1 };"]);
        assert_eq!(out.header.as_deref(), Some("__kiln.esm(exports, {});"));
    }

    #[test]
    fn test_export_lists_and_reexports() {
        let source = "const a = 1, b = 2;\nexport { a, b as c };\nexport { x as y } from './x';\nexport * from './all';\nexport * as ns from './ns';\n";
        let out = rewrite(source);
        assert_eq!(out.lines[1], "");
        assert_eq!(
            out.lines[2],
            "__kiln.reexport(exports, __kiln.interop(require(\"src/x.js\")), { y: \"x\" });"
        );
        assert_eq!(
            out.lines[3],
            "__kiln.reexport(exports, __kiln.interop(require(\"src/all.js\")));"
        );
        assert_eq!(
            out.lines[4],
            "__kiln.reexport(exports, __kiln.interop(require(\"src/ns.js\")), { ns: \"*\" });"
        );
        assert_eq!(
            out.header.as_deref(),
            Some("__kiln.esm(exports, { a: () => a, c: () => b });")
        );
    }

    #[test]
    fn test_exported_import_stays_live() {
        let out = rewrite("import { v } from './v';\nexport { v, v as w };\n");
        assert_eq!(out.lines[1], "");
        assert_eq!(
            out.header.as_deref(),
            Some("__kiln.esm(exports, { v: () => __kiln_m0.v, w: () => __kiln_m0.v });")
        );
    }

    #[test]
    fn test_calls_are_rewritten() {
        let source = "const dep = require('./dep');\nconst lazy = () => import(\"./lazy\");\nobj.require('./no');\nrequire(name);\n// require('./comment');\n";
        let out = rewrite(source);
        assert_eq!(out.lines[0], "const dep = require(\"src/dep.js\");");
        assert_eq!(out.lines[1], "const lazy = () => __lazy(\"src/lazy.js\");");
        assert_eq!(out.lines[2], "obj.require('./no');");
        assert_eq!(out.lines[3], "require(name);");
        assert_eq!(out.lines[4], "// require('./comment');");
        assert!(out.header.is_none());
    }

    #[test]
    fn test_import_meta_untouched() {
        let out = rewrite("console.log(import.meta.url);\n");
        assert_eq!(out.lines, vec!["console.log(import.meta.url);"]);
        assert!(out.header.is_none());
    }

    #[test]
    fn test_unlexable_source_is_an_error() {
        let err = rewrite_module("function f( {\n", false, &Keys).unwrap_err();
        assert!(matches!(err, ParseError::SyntaxInvalid { line: 1, .. }));
    }
}
