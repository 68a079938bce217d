// Variable expansion for task templates
//
// Expressions are `{{ name }}` or dotted paths such as `{{ out.stdout }}`.
// Expansion is a pure function of the scope and the template text.

use once_cell::sync::Lazy;
use regex::Regex;

use super::scope::Scope;
use crate::output::errors::ExpandError;

static EXPR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
        .expect("template expression regex is valid")
});

/// Expand every `{{ ... }}` expression in `text` against `scope`
pub fn expand(scope: &dyn Scope, text: &str) -> Result<String, ExpandError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in EXPR_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_literal(&mut out, &text[last..whole.start()], text)?;

        let path = &caps[1];
        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        let root = scope
            .get(head)
            .ok_or_else(|| ExpandError::Undefined(path.to_string()))?;
        let value = root
            .lookup(&rest)
            .ok_or_else(|| ExpandError::Undefined(path.to_string()))?;

        out.push_str(&value.to_string());
        last = whole.end();
    }

    push_literal(&mut out, &text[last..], text)?;
    Ok(out)
}

fn push_literal(out: &mut String, literal: &str, text: &str) -> Result<(), ExpandError> {
    if literal.contains("{{") {
        return Err(ExpandError::Unterminated(text.to_string()));
    }
    out.push_str(literal);
    Ok(())
}

/// Root variable names referenced by a template, in order of appearance
pub fn referenced_names(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in EXPR_RE.captures_iter(text) {
        let head = caps[1].split('.').next().unwrap_or_default().to_string();
        if !names.contains(&head) {
            names.push(head);
        }
    }
    names
}

/// Interpret an expanded `when` clause
pub fn boolify(text: &str) -> bool {
    !matches!(text.trim(), "" | "false" | "no")
}
