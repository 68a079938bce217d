// Argument text parsing for commands and module calls

use crate::output::errors::BindError;
use crate::parser::ast::{Value, Vars};

/// Split a command line into words with POSIX shell quoting rules
pub fn split_words(text: &str) -> Result<Vec<String>, BindError> {
    shlex::split(text).ok_or_else(|| {
        BindError::Malformed(format!("unbalanced quoting or trailing escape in '{}'", text))
    })
}

/// Parse `key=value key2="quoted value"` pairs
pub fn parse_simple_map(text: &str) -> Result<Vars, BindError> {
    let mut vars = Vars::new();

    for word in split_words(text)? {
        let (key, value) = word.split_once('=').ok_or_else(|| {
            BindError::Malformed(format!("expected key=value, got '{}'", word))
        })?;

        if key.is_empty() {
            return Err(BindError::Malformed(format!("empty key in '{}'", word)));
        }

        vars.insert(key.to_string(), Value::String(value.to_string()));
    }

    Ok(vars)
}
