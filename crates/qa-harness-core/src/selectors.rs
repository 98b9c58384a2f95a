//! Selector grounding and structural checks for generated Selenium scripts.
//!
//! Every `find_element(s)` call is read as a locator, whichever way its
//! strategy is spelled: `By.ID`, the W3C strategy string (`"css selector"`),
//! the `by=`/`value=` keywords, or a legacy `find_element_by_*` method.
//! `By.X, "..."` pairs outside such calls (expected-condition tuples) are
//! read too. Each locator is mapped to CSS form where one exists and
//! compared (after [`normalize_selector`]) against the selectors of the
//! markup evidence. A locator that does not map to an allowed selector is a
//! violation, as is one whose strategy or argument cannot be resolved to a
//! literal.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::error::Violation;
use crate::markup::normalize_selector;

/// Locator strategy as written in the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Id,
    CssSelector,
    Name,
    XPath,
    ClassName,
    LinkText,
    PartialLinkText,
    TagName,
}

impl Strategy {
    fn from_by(name: &str) -> Option<Self> {
        Some(match name {
            "ID" => Strategy::Id,
            "CSS_SELECTOR" => Strategy::CssSelector,
            "NAME" => Strategy::Name,
            "XPATH" => Strategy::XPath,
            "CLASS_NAME" => Strategy::ClassName,
            "LINK_TEXT" => Strategy::LinkText,
            "PARTIAL_LINK_TEXT" => Strategy::PartialLinkText,
            "TAG_NAME" => Strategy::TagName,
            _ => return None,
        })
    }

    /// W3C WebDriver strategy strings, which the `By` constants expand to.
    fn from_w3c(name: &str) -> Option<Self> {
        Some(match name {
            "id" => Strategy::Id,
            "css selector" => Strategy::CssSelector,
            "name" => Strategy::Name,
            "xpath" => Strategy::XPath,
            "class name" => Strategy::ClassName,
            "link text" => Strategy::LinkText,
            "partial link text" => Strategy::PartialLinkText,
            "tag name" => Strategy::TagName,
            _ => return None,
        })
    }

    fn from_legacy(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "id" => Strategy::Id,
            "css_selector" => Strategy::CssSelector,
            "name" => Strategy::Name,
            "xpath" => Strategy::XPath,
            "class_name" => Strategy::ClassName,
            "link_text" => Strategy::LinkText,
            "partial_link_text" => Strategy::PartialLinkText,
            "tag_name" => Strategy::TagName,
            _ => return None,
        })
    }

    /// `By.ID` or `"id"`.
    fn from_expr(expr: &str) -> Option<Self> {
        let expr = expr.trim();
        match expr.strip_prefix("By.") {
            Some(name) => Self::from_by(name),
            None => string_literal(expr).and_then(|s| Self::from_w3c(&s)),
        }
    }
}

/// One locator found in a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    /// `None` when the strategy argument is not a known `By` constant or
    /// strategy string.
    pub strategy: Option<Strategy>,
    /// The string literal argument, or `None` when the argument is an expression.
    pub literal: Option<String>,
    /// 1-based line number.
    pub line: usize,
}

impl Locator {
    /// CSS form of the locator, when the strategy has one.
    pub fn as_css(&self) -> Option<String> {
        let lit = self.literal.as_deref()?.trim();
        match self.strategy? {
            Strategy::Id => Some(format!("#{}", lit)),
            Strategy::CssSelector => Some(normalize_selector(lit)),
            Strategy::Name => Some(format!("[name=\"{}\"]", lit)),
            Strategy::ClassName => Some(format!(".{}", lit)),
            Strategy::XPath => xpath_to_css(lit),
            Strategy::LinkText | Strategy::PartialLinkText | Strategy::TagName => None,
        }
    }
}

/// `//tag[@id='x']` and `//tag[@name='x']` map to CSS; anything else does not.
fn xpath_to_css(xpath: &str) -> Option<String> {
    let rest = xpath.strip_prefix("//")?;
    let open = rest.find('[')?;
    let tag = &rest[..open];
    if !(tag == "*" || (!tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric()))) {
        return None;
    }
    let pred = rest[open + 1..].strip_suffix(']')?;
    let (attr, value) = pred.strip_prefix('@')?.split_once('=')?;
    let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
    let tag = if tag == "*" { "" } else { tag };
    match attr.trim() {
        "id" => Some(format!("#{}", value)),
        "name" => Some(format!("{}[name=\"{}\"]", tag, value)),
        _ => None,
    }
}

const FIND_ELEMENT: &str = "find_element";

/// Find every locator in a Python Selenium script.
pub fn extract_locators(source: &str) -> Vec<Locator> {
    let code = source.lines().map(strip_comment).collect::<Vec<_>>().join("\n");
    let line_of = |pos: usize| code[..pos].matches('\n').count() + 1;

    let mut out: Vec<(usize, Locator)> = Vec::new();
    let mut calls: Vec<Range<usize>> = Vec::new();
    let mut search = 0;
    while let Some(rel) = code[search..].find(FIND_ELEMENT) {
        let at = search + rel;
        search = at + FIND_ELEMENT.len();
        let word_start = code[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));
        if !word_start {
            continue;
        }
        let after = &code[search..];
        let plural = usize::from(after.starts_with('s'));
        let after = &after[plural..];
        let (locator, consumed) = match after.strip_prefix("_by_") {
            Some(legacy) => {
                let suffix_len = legacy
                    .find(|c: char| !(c.is_ascii_lowercase() || c == '_'))
                    .unwrap_or(legacy.len());
                let args = legacy[suffix_len..]
                    .trim_start()
                    .strip_prefix('(')
                    .map(|a| call_args(a).0);
                let literal = args
                    .as_ref()
                    .and_then(|a| a.first())
                    .and_then(|a| string_literal(a));
                let strategy = Strategy::from_legacy(&legacy[..suffix_len]);
                (Locator { strategy, literal, line: line_of(at) }, plural + 4 + suffix_len)
            }
            None => {
                let Some(args_text) = after.trim_start().strip_prefix('(') else {
                    continue;
                };
                let args_start = code.len() - args_text.len();
                let (args, len) = call_args(args_text);
                calls.push(args_start..args_start + len);
                (locator_from_args(&args, line_of(at)), args_start + len - search)
            }
        };
        out.push((at, locator));
        search += consumed;
    }

    let mut search = 0;
    while let Some(rel) = code[search..].find("By.") {
        let at = search + rel;
        let after = &code[at + 3..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_uppercase() || c == '_'))
            .unwrap_or(after.len());
        search = at + 3 + name_len;
        if calls.iter().any(|r| r.contains(&at)) {
            continue;
        }
        if let Some(strategy) = Strategy::from_by(&after[..name_len]) {
            let arg = after[name_len..].trim_start();
            let literal = arg.strip_prefix(',').and_then(|a| string_literal(a.trim_start()));
            out.push((
                at,
                Locator {
                    strategy: Some(strategy),
                    literal,
                    line: line_of(at),
                },
            ));
        }
    }

    out.sort_by_key(|(at, _)| *at);
    out.into_iter().map(|(_, loc)| loc).collect()
}

/// Resolve `find_element(by, value)` arguments, positional or keyword.
/// Selenium's defaults apply: `by` is `By.ID` when only `value` is given.
fn locator_from_args(args: &[&str], line: usize) -> Locator {
    let mut positional = Vec::new();
    let mut by = None;
    let mut value = None;
    for arg in args {
        match keyword_arg(arg) {
            Some(("by", expr)) => by = Some(expr),
            Some(("value", expr)) => value = Some(expr),
            Some(_) => {}
            None => positional.push(*arg),
        }
    }
    let by = by.or_else(|| positional.first().copied());
    let value = value.or_else(|| positional.get(1).copied());
    let strategy = match (by, value) {
        (Some(expr), _) => Strategy::from_expr(expr),
        (None, Some(_)) => Some(Strategy::Id),
        (None, None) => None,
    };
    Locator {
        strategy,
        literal: value.and_then(string_literal),
        line,
    }
}

/// `name=expr` at the top level of one argument.
fn keyword_arg(arg: &str) -> Option<(&str, &str)> {
    let eq = arg.find('=')?;
    let name = arg[..eq].trim();
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !arg[eq + 1..].starts_with('=');
    valid.then(|| (name, arg[eq + 1..].trim()))
}

/// Split a call's arguments, starting just after `(`. Returns the trimmed
/// non-empty top-level arguments and the byte length up to and including
/// the closing `)` (or the rest of the text when the call is unterminated).
fn call_args(text: &str) -> (Vec<&str>, usize) {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut arg_start = 0;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' if depth == 0 => {
                push_arg(&mut args, &text[arg_start..i]);
                return (args, i + 1);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                push_arg(&mut args, &text[arg_start..i]);
                arg_start = i + 1;
            }
            _ => {}
        }
    }
    push_arg(&mut args, &text[arg_start..]);
    (args, text.len())
}

fn push_arg<'a>(args: &mut Vec<&'a str>, arg: &'a str) {
    let arg = arg.trim();
    if !arg.is_empty() {
        args.push(arg);
    }
}

/// Parse a Python string literal at the start of `s`, with optional r/u prefix.
fn string_literal(s: &str) -> Option<String> {
    let s = s
        .strip_prefix(|c: char| matches!(c, 'r' | 'R' | 'u' | 'U'))
        .filter(|t| t.starts_with(|c: char| c == '"' || c == '\''))
        .unwrap_or(s);
    let quote = s.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &s[1..];
    let mut out = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
            continue;
        }
        if c == quote {
            return Some(out);
        }
        out.push(c);
    }
    None
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Outcome of checking one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptCheck {
    /// Allowed selectors the script references, in their original form.
    pub referenced: BTreeSet<String>,
    pub violations: Vec<Violation>,
}

impl ScriptCheck {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check a script's locators against `allowed` and its overall structure.
pub fn check_script(test_case_id: &str, source: &str, allowed: &BTreeSet<String>) -> ScriptCheck {
    let by_normalized: BTreeMap<String, &String> = allowed
        .iter()
        .map(|s| (normalize_selector(s), s))
        .collect();
    let violation = |field: String, detail: String| Violation {
        subject: test_case_id.to_string(),
        field,
        detail,
    };

    let mut check = ScriptCheck::default();
    let locators = extract_locators(source);
    for loc in &locators {
        let field = format!("line {}", loc.line);
        let Some(strategy) = loc.strategy else {
            check.violations.push(violation(
                field,
                "locator strategy is not a By constant or WebDriver strategy string".to_string(),
            ));
            continue;
        };
        let Some(literal) = &loc.literal else {
            check.violations.push(violation(
                field,
                format!("{:?} locator argument is not a string literal", strategy),
            ));
            continue;
        };
        match loc.as_css().and_then(|css| resolve(&css, &by_normalized)) {
            Some(original) => {
                check.referenced.insert(original.clone());
            }
            None => check.violations.push(violation(
                field,
                format!(
                    "{:?} locator '{}' is not one of the allowed selectors",
                    strategy, literal
                ),
            )),
        }
    }

    if locators.is_empty() {
        check
            .violations
            .push(violation("script".to_string(), "does not locate any element".to_string()));
    }
    for problem in structure_problems(source) {
        check.violations.push(violation("script".to_string(), problem));
    }
    check
}

/// Map a CSS locator to an allowed selector. A bare `[name="x"]` also
/// matches `tag[name="x"]`.
fn resolve<'a>(css: &str, allowed: &BTreeMap<String, &'a String>) -> Option<&'a String> {
    let css = normalize_selector(css);
    if let Some(s) = allowed.get(&css) {
        return Some(s);
    }
    if css.starts_with("[name=") {
        return allowed.iter().find_map(|(norm, original)| {
            let (tag, attr) = norm.split_at(norm.find('[')?);
            (attr == css && tag.chars().all(|c| c.is_ascii_alphanumeric())).then_some(*original)
        });
    }
    None
}

/// Structural problems: missing Selenium import, driver setup, or assertion,
/// or unbalanced brackets.
pub fn structure_problems(source: &str) -> Vec<String> {
    let mut problems = Vec::new();
    let has_import = source.lines().any(|l| {
        let l = l.trim_start();
        l.starts_with("from selenium") || l.starts_with("import selenium")
    });
    if !has_import {
        problems.push("missing selenium import".to_string());
    }
    let has_driver = ["Chrome(", "Firefox(", "Edge(", "Safari(", "Remote("]
        .iter()
        .any(|ctor| source.contains(&format!("webdriver.{}", ctor)) || source.contains(&format!("= {}", ctor)));
    if !has_driver {
        problems.push("missing WebDriver setup".to_string());
    }
    let has_assert = source.lines().any(|l| {
        let l = strip_comment(l).trim_start();
        l.starts_with("assert ") || l.starts_with("assert(")
    });
    if !has_assert {
        problems.push("no assert statement".to_string());
    }
    if let Err(detail) = check_brackets(source) {
        problems.push(detail);
    }
    problems
}

fn check_brackets(source: &str) -> Result<(), String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        let code = strip_comment(line);
        let mut quote: Option<char> = None;
        let mut escaped = false;
        for c in code.chars() {
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => quote = Some(c),
                '(' | '[' | '{' => stack.push((c, idx + 1)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => return Err(format!("unbalanced '{}' on line {}", c, idx + 1)),
                    }
                }
                _ => {}
            }
        }
    }
    match stack.pop() {
        Some((open, line)) => Err(format!("unclosed '{}' opened on line {}", open, line)),
        None => Ok(()),
    }
}
