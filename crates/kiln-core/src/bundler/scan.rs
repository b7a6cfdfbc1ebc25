//! Import scanner.
//!
//! Scans JavaScript/TypeScript source for import specifiers without building
//! an AST. The lexer understands comments, strings, template literals and
//! regular expression literals well enough to skip them and to reject
//! unbalanced or unterminated input.

use super::error::ParseError;
use super::graph::ModuleId;
use super::loader::Loader;
use rustc_hash::FxHashMap as HashMap;

/// How a module refers to one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportKind {
    /// `import x from "..."` / `import "..."`
    Static,
    /// `import("...")`
    Dynamic,
    /// `require("...")`
    Require,
    /// `export ... from "..."`
    ReExport,
}

impl ImportKind {
    /// Whether the dependency is loaded lazily.
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::Dynamic)
    }

    /// Short name used in metafiles.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "import-statement",
            Self::Dynamic => "dynamic-import",
            Self::Require => "require-call",
            Self::ReExport => "export-from",
        }
    }
}

/// Import specifier found in source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    /// Specifier exactly as written.
    pub specifier: String,
    /// How the dependency is referenced.
    pub kind: ImportKind,
    /// Line of the importing keyword (1-indexed).
    pub line: u32,
}

/// Extracts import records from module source.
///
/// The builder calls this once per changed module, possibly from several
/// threads at once.
pub trait ImportParser: Send + Sync {
    /// Parse `source` (the output of `loader`) and return its imports in
    /// first-appearance order, deduplicated by specifier.
    ///
    /// # Errors
    /// Returns `ParseError::SyntaxInvalid` when the source cannot be lexed.
    fn parse(
        &self,
        id: &ModuleId,
        loader: Loader,
        source: &str,
    ) -> Result<Vec<ImportRecord>, ParseError>;
}

/// Default lexical import scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scanner;

impl ImportParser for Scanner {
    fn parse(
        &self,
        _id: &ModuleId,
        loader: Loader,
        source: &str,
    ) -> Result<Vec<ImportRecord>, ParseError> {
        if !loader.is_script() {
            return Ok(Vec::new());
        }
        scan_imports(source, loader.allows_jsx())
    }
}

/// Scan source code for import specifiers.
///
/// With `jsx` set, `<` in expression position starts a JSX element whose
/// text children are skipped.
///
/// # Errors
/// Returns `ParseError::SyntaxInvalid` for unbalanced brackets or
/// unterminated comments, strings, templates, regular expressions and JSX
/// elements.
pub fn scan_imports(source: &str, jsx: bool) -> Result<Vec<ImportRecord>, ParseError> {
    let tokens = tokenize(source, jsx)?;
    Ok(collect_imports(&tokens))
}

/// Lex `source` into the tokens the import scanner and the module rewriter
/// work from. Comments, whitespace and JSX text produce no tokens.
pub(crate) fn tokenize(source: &str, jsx: bool) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source, jsx).run()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Tok {
    Ident(String),
    /// String literal, or a template without substitutions.
    Str(String),
    Punct(char),
    /// Number, regex, template with substitutions, or the end of a JSX
    /// element.
    Value,
    /// First segment of a JSX tag name that refers to a binding
    /// (`Button` in `<Button>`, `ui` in `<ui.Card>`).
    JsxTag(String),
    /// Brace opening or closing a JSX expression container.
    JsxBrace(char),
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: u32,
    /// Byte range in the source.
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub(crate) fn is_punct(&self, c: char) -> bool {
        self.tok == Tok::Punct(c)
    }

    pub(crate) fn ident(&self) -> Option<&str> {
        match &self.tok {
            Tok::Ident(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    Paren,
    Bracket,
    Brace,
    /// `${` inside a template literal
    TemplateExpr,
    /// `{` inside JSX
    JsxExpr,
}

impl Open {
    fn closer(self) -> char {
        match self {
            Self::Paren => ')',
            Self::Bracket => ']',
            Self::Brace | Self::TemplateExpr | Self::JsxExpr => '}',
        }
    }
}

/// Keywords after which a `/` starts a regular expression and a `<` starts
/// a JSX element.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "case", "default", "do", "else", "in", "of", "new",
    "delete", "void", "throw", "yield", "await",
];

struct Lexer<'s> {
    source: &'s str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: u32,
    jsx: bool,
    stack: Vec<(Open, u32)>,
    tokens: Vec<Token>,
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str, jsx: bool) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            line: 1,
            jsx,
            stack: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).map(|&(_, c)| c)
    }

    /// Byte offset of the current position.
    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map_or(self.source.len(), |&(i, _)| i)
    }

    /// Push a token ending at the current position.
    fn push(&mut self, tok: Tok, line: u32, start: usize) {
        let end = self.offset();
        self.tokens.push(Token {
            tok,
            line,
            start,
            end,
        });
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        // Shebang
        if self.peek(0) == Some('#') && self.peek(1) == Some('!') {
            self.skip_line();
        }

        self.lex_code()?;

        if let Some(&(open, line)) = self.stack.last() {
            let what = match open {
                Open::Paren => "'('",
                Open::Bracket => "'['",
                Open::Brace => "'{'",
                Open::TemplateExpr => "template substitution",
                Open::JsxExpr => "JSX expression",
            };
            return Err(ParseError::syntax(line, format!("unclosed {what}")));
        }

        Ok(self.tokens)
    }

    /// Lex code until the end of input, or until the `}` closing the
    /// innermost JSX expression (returns `true` in that case).
    fn lex_code(&mut self) -> Result<bool, ParseError> {
        while let Some(c) = self.peek(0) {
            let start = self.offset();
            match c {
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c.is_whitespace() => self.pos += 1,
                '/' if self.peek(1) == Some('/') => self.skip_line(),
                '/' if self.peek(1) == Some('*') => self.skip_block_comment()?,
                '/' if self.expression_allowed() => self.skip_regex()?,
                '<' if self.jsx && self.expression_allowed() && self.jsx_ahead() => {
                    if !self.read_jsx_element(false)? {
                        self.pos += 1;
                        self.push(Tok::Punct('<'), self.line, start);
                    }
                }
                '"' | '\'' => self.read_string(c)?,
                '`' => {
                    self.pos += 1;
                    self.read_template(start, false)?;
                }
                '(' | '[' | '{' => {
                    let open = match c {
                        '(' => Open::Paren,
                        '[' => Open::Bracket,
                        _ => Open::Brace,
                    };
                    self.stack.push((open, self.line));
                    self.pos += 1;
                    self.push(Tok::Punct(c), self.line, start);
                }
                ')' | ']' | '}' => {
                    self.pos += 1;
                    match self.stack.pop() {
                        Some((Open::TemplateExpr, _)) if c == '}' => {
                            self.read_template(start, true)?;
                        }
                        Some((Open::JsxExpr, _)) if c == '}' => return Ok(true),
                        Some((open, _)) if open.closer() == c => {
                            self.push(Tok::Punct(c), self.line, start);
                        }
                        Some((open, line)) => {
                            return Err(ParseError::syntax(
                                self.line,
                                format!(
                                    "unexpected '{c}', expected '{}' to close line {line}",
                                    open.closer()
                                ),
                            ));
                        }
                        None => {
                            return Err(ParseError::syntax(self.line, format!("unexpected '{c}'")));
                        }
                    }
                }
                c if c.is_ascii_digit() => {
                    while self
                        .peek(0)
                        .is_some_and(|c| c.is_alphanumeric() || c == '.' || c == '_')
                    {
                        self.pos += 1;
                    }
                    self.push(Tok::Value, self.line, start);
                }
                c if is_ident_start(c) => {
                    let ident = self.read_ident();
                    self.push(Tok::Ident(ident), self.line, start);
                }
                c => {
                    self.pos += 1;
                    self.push(Tok::Punct(c), self.line, start);
                }
            }
        }
        Ok(false)
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_part) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().map(|&(_, c)| c).collect()
    }

    /// Whether an operand may start here.
    fn expression_allowed(&self) -> bool {
        match self.tokens.last().map(|t| &t.tok) {
            None => true,
            // `</` closes a JSX element
            Some(Tok::Punct(c)) => !matches!(c, ')' | ']' | '}' | '<'),
            Some(Tok::Ident(word)) => {
                // `obj.default / 2` divides
                let member = self.tokens.len() >= 2
                    && self.tokens[self.tokens.len() - 2].is_punct('.');
                !member && EXPRESSION_KEYWORDS.contains(&word.as_str())
            }
            Some(Tok::JsxBrace(c)) => *c == '{',
            Some(Tok::Str(_) | Tok::Value | Tok::JsxTag(_)) => false,
        }
    }

    /// Whether the tokens before `end` put a `<` in a type: after `:` or
    /// after `type Name =`.
    fn type_position(&self, end: usize) -> bool {
        let tokens = &self.tokens[..end];
        match tokens {
            [.., last] if last.is_punct(':') => true,
            [.., keyword, _, eq] => eq.is_punct('=') && keyword.ident() == Some("type"),
            _ => false,
        }
    }

    fn jsx_ahead(&self) -> bool {
        self.peek(1).is_some_and(|c| c == '>' || is_ident_start(c))
    }

    fn skip_line(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ParseError> {
        let start_line = self.line;
        self.pos += 2;
        loop {
            match self.peek(0) {
                None => {
                    return Err(ParseError::syntax(start_line, "unterminated block comment"));
                }
                Some('*') if self.peek(1) == Some('/') => {
                    self.pos += 2;
                    return Ok(());
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<(), ParseError> {
        let start = self.offset();
        let start_line = self.line;
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek(0) {
                None | Some('\n') => {
                    return Err(ParseError::syntax(start_line, "unterminated string literal"));
                }
                Some('\\') => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    } else if let Some(escaped) = self.peek(1) {
                        value.push(escaped);
                    }
                    self.pos += 2;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
        self.push(Tok::Str(value), start_line, start);
        Ok(())
    }

    /// Read template text up to the closing backtick or the next `${`.
    /// The opening backtick, or the `}` closing a substitution when
    /// `resumed` is set, has already been consumed.
    fn read_template(&mut self, start: usize, resumed: bool) -> Result<(), ParseError> {
        let start_line = self.line;
        let mut value = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(ParseError::syntax(start_line, "unterminated template literal"));
                }
                Some('\\') => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                Some('`') => {
                    self.pos += 1;
                    // Templates without substitutions read like strings
                    if !resumed {
                        self.push(Tok::Str(value), start_line, start);
                    }
                    return Ok(());
                }
                Some('$') if self.peek(1) == Some('{') => {
                    self.pos += 2;
                    if !resumed {
                        self.push(Tok::Value, start_line, start);
                    }
                    self.stack.push((Open::TemplateExpr, self.line));
                    return Ok(());
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn skip_regex(&mut self) -> Result<(), ParseError> {
        let start = self.offset();
        let start_line = self.line;
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.peek(0) {
                None | Some('\n') => {
                    return Err(ParseError::syntax(
                        start_line,
                        "unterminated regular expression",
                    ));
                }
                Some('\\') => self.pos += 2,
                Some('[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some('/') if !in_class => {
                    self.pos += 1;
                    // Flags
                    while self.peek(0).is_some_and(is_ident_part) {
                        self.pos += 1;
                    }
                    self.push(Tok::Value, start_line, start);
                    return Ok(());
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn skip_jsx_space(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                self.line += 1;
            } else if !c.is_whitespace() {
                return;
            }
            self.pos += 1;
        }
    }

    /// Read a JSX tag name. Names that refer to bindings push a
    /// [`Tok::JsxTag`] for their first segment.
    fn read_jsx_name(&mut self) -> String {
        let start = self.offset();
        let first = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| is_ident_part(c) || matches!(c, '-' | ':' | '.'))
        {
            self.pos += 1;
        }
        let name: String = self.chars[first..self.pos].iter().map(|&(_, c)| c).collect();

        // Lowercase names without a member access are intrinsic elements
        let intrinsic = name.starts_with(|c: char| c.is_lowercase()) && !name.contains('.');
        if !intrinsic && !name.contains([':', '-']) {
            let head = name.split('.').next().unwrap_or_default();
            if !head.is_empty() {
                self.tokens.push(Token {
                    tok: Tok::JsxTag(head.to_string()),
                    line: self.line,
                    start,
                    end: start + head.len(),
                });
            }
        }
        name
    }

    /// Read a JSX element or fragment starting at `<`.
    ///
    /// Outside of JSX children, `<T,>`, `<T extends U>` and `<T>(` are type
    /// parameter lists; the position is restored and `false` returned.
    fn read_jsx_element(&mut self, in_children: bool) -> Result<bool, ParseError> {
        let (saved_pos, saved_line, saved_tokens) = (self.pos, self.line, self.tokens.len());
        let open_line = self.line;
        self.pos += 1;
        self.skip_jsx_space();

        let name = if self.peek(0) == Some('>') {
            String::new()
        } else {
            self.read_jsx_name()
        };

        if !in_children && !name.is_empty() {
            let (after, after_line) = (self.pos, self.line);
            self.skip_jsx_space();
            let generic = match self.peek(0) {
                Some(',') => true,
                Some('>') => self.peek(1) == Some('(') && self.type_position(saved_tokens),
                Some('e') => self.read_ident() == "extends",
                _ => false,
            };
            if generic {
                self.pos = saved_pos;
                self.line = saved_line;
                self.tokens.truncate(saved_tokens);
                return Ok(false);
            }
            self.pos = after;
            self.line = after_line;
        }

        loop {
            self.skip_jsx_space();
            match self.peek(0) {
                None => {
                    return Err(ParseError::syntax(
                        open_line,
                        format!("unterminated JSX tag <{name}>"),
                    ));
                }
                Some('/') if self.peek(1) == Some('>') => {
                    self.pos += 2;
                    self.push(Tok::Value, self.line, self.offset());
                    return Ok(true);
                }
                Some('>') => {
                    self.pos += 1;
                    break;
                }
                Some('{') => self.read_jsx_expression()?,
                Some(quote @ ('"' | '\'')) => self.skip_jsx_attribute_string(quote)?,
                Some(c) if is_ident_part(c) || matches!(c, '-' | ':' | '=') => self.pos += 1,
                Some(c) => {
                    return Err(ParseError::syntax(
                        self.line,
                        format!("unexpected '{c}' in JSX tag <{name}>"),
                    ));
                }
            }
        }

        self.read_jsx_children(open_line, &name)?;
        self.push(Tok::Value, self.line, self.offset());
        Ok(true)
    }

    /// Skip JSX children up to and including the closing tag of `name`.
    fn read_jsx_children(&mut self, open_line: u32, name: &str) -> Result<(), ParseError> {
        loop {
            match self.peek(0) {
                None => {
                    return Err(ParseError::syntax(
                        open_line,
                        format!("unclosed JSX element <{name}>"),
                    ));
                }
                Some('\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some('{') => self.read_jsx_expression()?,
                Some('<') if self.peek(1) == Some('/') => {
                    self.pos += 2;
                    self.skip_jsx_space();
                    let close = if self.peek(0) == Some('>') {
                        String::new()
                    } else {
                        self.read_jsx_name()
                    };
                    self.skip_jsx_space();
                    if self.peek(0) != Some('>') {
                        return Err(ParseError::syntax(
                            self.line,
                            format!("expected '>' after </{close}"),
                        ));
                    }
                    self.pos += 1;
                    if close != name {
                        return Err(ParseError::syntax(
                            self.line,
                            format!("expected </{name}> to close line {open_line}, found </{close}>"),
                        ));
                    }
                    return Ok(());
                }
                Some('<') => {
                    self.read_jsx_element(true)?;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn read_jsx_expression(&mut self) -> Result<(), ParseError> {
        let start = self.offset();
        let line = self.line;
        self.pos += 1;
        self.push(Tok::JsxBrace('{'), line, start);
        self.stack.push((Open::JsxExpr, line));
        if !self.lex_code()? {
            return Err(ParseError::syntax(line, "unclosed JSX expression"));
        }
        let close = self.offset() - 1;
        self.push(Tok::JsxBrace('}'), self.line, close);
        Ok(())
    }

    /// Attribute strings may span lines and have no escapes.
    fn skip_jsx_attribute_string(&mut self, quote: char) -> Result<(), ParseError> {
        let start_line = self.line;
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => {
                    return Err(ParseError::syntax(
                        start_line,
                        "unterminated JSX attribute string",
                    ));
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Walk the token stream and pick out import forms.
fn collect_imports(tokens: &[Token]) -> Vec<ImportRecord> {
    let mut results: Vec<ImportRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::default();

    let mut record = |specifier: &str, kind: ImportKind, line: u32| {
        if specifier.is_empty() {
            return;
        }
        if let Some(&existing) = index.get(specifier) {
            // A static reference wins over a lazy one
            if results[existing].kind.is_dynamic() && !kind.is_dynamic() {
                results[existing].kind = kind;
            }
            return;
        }
        index.insert(specifier.to_string(), results.len());
        results.push(ImportRecord {
            specifier: specifier.to_string(),
            kind,
            line,
        });
    };

    let ident = |i: usize| match tokens.get(i).map(|t| &t.tok) {
        Some(Tok::Ident(s)) => Some(s.as_str()),
        _ => None,
    };
    let string = |i: usize| match tokens.get(i).map(|t| &t.tok) {
        Some(Tok::Str(s)) => Some(s.as_str()),
        _ => None,
    };
    let punct = |i: usize, c: char| tokens.get(i).map(|t| &t.tok) == Some(&Tok::Punct(c));

    // Index of the `from` string after position `i`, stopping at `;` or at
    // the start of another statement keyword.
    let find_from = |mut i: usize| -> Option<usize> {
        let mut depth = 0usize;
        while i < tokens.len() {
            match &tokens[i].tok {
                Tok::Punct('{') => depth += 1,
                Tok::Punct('}') => depth = depth.saturating_sub(1),
                Tok::Punct(';') if depth == 0 => return None,
                Tok::Ident(w) if w == "from" && depth == 0 => {
                    if matches!(tokens.get(i + 1).map(|t| &t.tok), Some(Tok::Str(_))) {
                        return Some(i + 1);
                    }
                }
                Tok::Ident(w) if depth == 0 && (w == "import" || w == "export") => return None,
                _ => {}
            }
            i += 1;
        }
        None
    };

    let mut i = 0;
    while i < tokens.len() {
        let line = tokens[i].line;
        let after_dot = i > 0 && punct(i - 1, '.');

        match ident(i) {
            Some("import") if !after_dot => {
                if punct(i + 1, '(') {
                    if let Some(spec) = string(i + 2) {
                        if punct(i + 3, ')') || punct(i + 3, ',') {
                            record(spec, ImportKind::Dynamic, line);
                        }
                    }
                } else if punct(i + 1, '.') {
                    // import.meta
                } else if let Some(spec) = string(i + 1) {
                    record(spec, ImportKind::Static, line);
                } else {
                    let type_only = ident(i + 1) == Some("type")
                        && !(ident(i + 2) == Some("from") && string(i + 3).is_some())
                        && !punct(i + 2, ',');
                    if let Some(at) = find_from(i + 1) {
                        if !type_only {
                            if let Some(spec) = string(at) {
                                record(spec, ImportKind::Static, line);
                            }
                        }
                        i = at;
                    }
                }
            }
            Some("export") if !after_dot => {
                let type_only = ident(i + 1) == Some("type");
                let start = if type_only { i + 2 } else { i + 1 };
                if punct(start, '*') || punct(start, '{') {
                    if let Some(at) = find_from(start) {
                        if !type_only {
                            if let Some(spec) = string(at) {
                                record(spec, ImportKind::ReExport, line);
                            }
                        }
                        i = at;
                    }
                }
            }
            Some("require") if !after_dot => {
                if punct(i + 1, '(') && punct(i + 3, ')') {
                    if let Some(spec) = string(i + 2) {
                        record(spec, ImportKind::Require, line);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<ImportRecord> {
        scan_imports(source, false).unwrap()
    }

    fn specs(source: &str) -> Vec<(String, ImportKind)> {
        scan(source)
            .into_iter()
            .map(|r| (r.specifier, r.kind))
            .collect()
    }

    fn syntax_line(source: &str) -> u32 {
        match scan_imports(source, false) {
            Err(ParseError::SyntaxInvalid { line, .. }) => line,
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_esm_import_forms() {
        let source = r#"
import foo from "./default";
import { a, b as c } from './named';
import * as ns from "./ns";
import def, { x } from "./mixed";
import "./side-effect";
"#;
        let found: Vec<String> = scan(source).into_iter().map(|r| r.specifier).collect();
        assert_eq!(
            found,
            vec!["./default", "./named", "./ns", "./mixed", "./side-effect"]
        );
    }

    #[test]
    fn test_multiline_named_import() {
        let source = "import {\n  a,\n  b,\n} from \"./dep\";\n";
        let records = scan(source);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].specifier, "./dep");
        assert_eq!(records[0].line, 1);
    }

    #[test]
    fn test_dynamic_import_and_require() {
        let source = r#"
const lazy = () => import("./lazy");
const dep = require('./dep');
const tpl = import(`./tpl`);
"#;
        assert_eq!(
            specs(source),
            vec![
                ("./lazy".to_string(), ImportKind::Dynamic),
                ("./dep".to_string(), ImportKind::Require),
                ("./tpl".to_string(), ImportKind::Dynamic),
            ]
        );
    }

    #[test]
    fn test_reexports() {
        let source = r#"
export { foo } from "./foo";
export * from "./all";
export * as ns from "./ns";
export const local = 1;
"#;
        assert_eq!(
            specs(source),
            vec![
                ("./foo".to_string(), ImportKind::ReExport),
                ("./all".to_string(), ImportKind::ReExport),
                ("./ns".to_string(), ImportKind::ReExport),
            ]
        );
    }

    #[test]
    fn test_type_only_imports_are_skipped() {
        let source = r#"
import type { Props } from "./types";
export type { Other } from "./other-types";
import type from "./named-type";
"#;
        assert_eq!(
            specs(source),
            vec![("./named-type".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_ignores_comments_strings_and_members() {
        let source = r#"
// import a from "./commented";
/* import b from "./block"; */
const s = "import c from './in-string'";
const t = `require("./in-template")`;
obj.require("./member");
console.log(import.meta.url);
import real from "./real";
"#;
        assert_eq!(specs(source), vec![("./real".to_string(), ImportKind::Static)]);
    }

    #[test]
    fn test_template_substitution_is_lexed() {
        let source = "const s = `a ${fn({ x: `nested ${y}` })} b`;\nimport x from \"./x\";\n";
        assert_eq!(specs(source), vec![("./x".to_string(), ImportKind::Static)]);
    }

    #[test]
    fn test_regex_and_division() {
        let source = r#"
const re = /["'`]/g;
const half = total / 2 / 1;
if (/\/import/.test(s)) {}
import x from "./after-regex";
"#;
        assert_eq!(
            specs(source),
            vec![("./after-regex".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_dedup_prefers_static() {
        let source = r#"
const later = import("./dep");
import dep from "./dep";
"#;
        let records = scan(source);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ImportKind::Static);
        assert_eq!(records[0].line, 2);
    }

    #[test]
    fn test_line_numbers() {
        let source = "\nimport a from \"./a\";\n\nimport b from \"./b\";\n";
        let lines: Vec<u32> = scan(source).into_iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![2, 4]);
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(syntax_line("function f() {\n  return 1;\n"), 1);
        assert_eq!(syntax_line("const a = [1, 2);\n"), 1);
        assert_eq!(syntax_line("\n\nconst s = 'open;\n"), 3);
        assert_eq!(syntax_line("/* never closed\n"), 1);
        assert_eq!(syntax_line("const t = `open\n"), 1);
        assert_eq!(syntax_line("}\n"), 1);
    }

    #[test]
    fn test_jsx_text_and_attributes() {
        let source = r#"
import React from "react";
export const App = () => <p>Don't stop</p>;
export const Row = ({ a }) => (
  <li title="it's
  fine" onClick={() => go('/x')}>
    it's {a ? 'x' : "y"} <b>bold</b> 1 / 2 {/* note */}
    <>{[1, 2].map((n) => <i key={n}>{n}</i>)}</>
  </li>
);
"#;
        assert!(scan_imports(source, false).is_err());
        let records = scan_imports(source, true).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].specifier, "react");
    }

    #[test]
    fn test_jsx_syntax_errors() {
        let jsx_line = |source: &str| match scan_imports(source, true) {
            Err(ParseError::SyntaxInvalid { line, .. }) => line,
            other => panic!("expected syntax error, got {other:?}"),
        };
        assert_eq!(jsx_line("function broken() {\n  return (1;\n"), 2);
        assert_eq!(jsx_line("const s = 'open;\n"), 1);
        assert_eq!(jsx_line("const t = `open\n"), 1);
        assert_eq!(jsx_line("const a = <div>\n  text\n"), 1);
        assert_eq!(jsx_line("const a = <div>{x</div>;\n"), 1);
        assert_eq!(jsx_line("const a = <div></span>;\n"), 1);
    }

    #[test]
    fn test_tsx_type_parameters_are_not_elements() {
        let source = "const id = <T,>(x: T) => x;\nconst ok = <T extends object>(x: T) => x;\ntype F = <T>(x: T) => T;\nconst lt = a < b;\n";
        assert!(scan_imports(source, true).unwrap().is_empty());
    }

    #[test]
    fn test_jsx_component_tags_are_tokens() {
        let tokens = tokenize("<Button.Item onClick={go}>hi <div /></Button.Item>", true).unwrap();
        let tags: Vec<&Tok> = tokens
            .iter()
            .filter(|t| matches!(t.tok, Tok::JsxTag(_)))
            .map(|t| &t.tok)
            .collect();
        assert_eq!(
            tags,
            vec![
                &Tok::JsxTag("Button".to_string()),
                &Tok::JsxTag("Button".to_string())
            ]
        );
        let go = tokens.iter().find(|t| t.ident() == Some("go")).unwrap();
        assert_eq!((go.start, go.end), (22, 24));
    }

    #[test]
    fn test_token_spans_are_byte_offsets() {
        let source = "const é = \"ü\"; import x from './x';";
        let tokens = tokenize(source, false).unwrap();
        let spec = tokens.iter().find(|t| t.tok == Tok::Str("./x".to_string())).unwrap();
        assert_eq!(&source[spec.start..spec.end], "'./x'");
        let import = tokens.iter().find(|t| t.ident() == Some("import")).unwrap();
        assert_eq!(&source[import.start..import.end], "import");
    }

    #[test]
    fn test_scanner_skips_data_loaders() {
        let id = ModuleId::from_path("/data.json");
        let records = Scanner
            .parse(&id, Loader::Json, "export default {\"a\":1};")
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_empty_source() {
        assert!(scan("").is_empty());
        assert!(scan("#!/usr/bin/env node\nconsole.log('hi');").is_empty());
    }
}
