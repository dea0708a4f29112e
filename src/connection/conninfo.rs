//! libpq-style connection string composition.

use crate::errors::Error;

/// Merge `options` into a `key=value` conninfo string. Options win over
/// keys already present in `base`; everything else is passed through in
/// its original order.
pub fn make_conninfo(base: &str, options: &[(&str, &str)]) -> Result<String, Error> {
    let mut entries = split_conninfo(base)?;
    for (key, value) in options {
        if key.is_empty() {
            return Err(Error::Programming("empty conninfo keyword".into()));
        }
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = (*value).to_owned(),
            None => entries.push(((*key).to_owned(), (*value).to_owned())),
        }
    }
    Ok(entries
        .iter()
        .map(|(k, v)| format!("{k}={}", quote_value(v)))
        .collect::<Vec<_>>()
        .join(" "))
}

fn split_conninfo(s: &str) -> Result<Vec<(String, String)>, Error> {
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut chars = s.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(entries);
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) if !c.is_whitespace() => key.push(c),
                _ => {
                    return Err(Error::Programming(format!(
                        "malformed conninfo string: missing value after {key:?}"
                    )))
                }
            }
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => {
                            return Err(Error::Programming(
                                "malformed conninfo string: unterminated quote".into(),
                            ))
                        }
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::Programming(
                            "malformed conninfo string: unterminated quote".into(),
                        ))
                    }
                }
            }
        } else {
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                value.push(chars.next().unwrap_or_default());
            }
        }
        entries.push((key, value));
    }
}

fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\t', '\n', '\'', '\\']) {
        return value.to_owned();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}
