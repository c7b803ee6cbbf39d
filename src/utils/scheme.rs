// src/utils/scheme.rs: `name(key=value,...)[+|-]` call lists used by --filter and --exporters
use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::config::defs::PipelineError;

lazy_static! {
    static ref CALL_RE: Regex = Regex::new(r"^\s*(?P<name>\w+)\s*\((?P<args>.*)\)\s*(?P<sign>[+-]?)\s*$").unwrap();
}

/// One parsed call of a scheme string.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemeCall {
    pub name: String,
    pub kwargs: HashMap<String, String>,
    /// `-` suffix.
    pub negate: bool,
}

impl SchemeCall {
    /// Parses a keyword argument, falling back to `default` when absent.
    pub fn arg<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, PipelineError> {
        match self.kwargs.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                PipelineError::InvalidConfig(format!("{}(): bad value '{}' for argument '{}'", self.name, raw, key))
            }),
        }
    }

    /// Rejects keyword arguments outside `known`.
    pub fn only_args(&self, known: &[&str]) -> Result<(), PipelineError> {
        match self.kwargs.keys().find(|k| !known.contains(&k.as_str())) {
            Some(k) => Err(PipelineError::InvalidConfig(format!("{}() takes no argument '{}'", self.name, k))),
            None => Ok(()),
        }
    }
}

/// Splits `s` on `sep` wherever it is not inside parentheses.
fn split_top_level(s: &str, sep: char) -> Result<Vec<&str>, PipelineError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(PipelineError::InvalidConfig(format!("unbalanced ')' in '{}'", s)));
                }
            }
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PipelineError::InvalidConfig(format!("unbalanced '(' in '{}'", s)));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn parse_call(text: &str) -> Result<SchemeCall, PipelineError> {
    let caps = CALL_RE
        .captures(text)
        .ok_or_else(|| PipelineError::InvalidConfig(format!("cannot parse '{}', expected name(key=value,...)", text.trim())))?;
    let name = caps["name"].to_string();
    let mut kwargs = HashMap::new();
    for pair in caps["args"].split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').ok_or_else(|| {
            PipelineError::InvalidConfig(format!("{}(): argument '{}' should be key=value", name, pair))
        })?;
        kwargs.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(SchemeCall { name, kwargs, negate: &caps["sign"] == "-" })
}

/// Parses a `sep`-separated list of calls. Empty entries are skipped.
pub fn parse_scheme(s: &str, sep: char) -> Result<Vec<SchemeCall>, PipelineError> {
    split_top_level(s, sep)?
        .into_iter()
        .filter(|part| !part.trim().is_empty())
        .map(parse_call)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scheme() -> Result<(), PipelineError> {
        let calls = parse_scheme("dup(),qual()", ',')?;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "dup");
        assert!(calls[0].kwargs.is_empty());
        assert!(!calls[1].negate);
        Ok(())
    }

    #[test]
    fn test_arguments_and_negation() -> Result<(), PipelineError> {
        let calls = parse_scheme("qual(q=30)-, dup(kind=start) +, polya(n=8)", ',')?;
        assert_eq!(calls[0].arg("q", 10u8)?, 30);
        assert!(calls[0].negate);
        assert_eq!(calls[1].kwargs["kind"], "start");
        assert!(!calls[1].negate);
        assert_eq!(calls[2].arg("n", 5usize)?, 8);
        assert_eq!(calls[2].arg("missing", 7usize)?, 7);
        Ok(())
    }

    #[test]
    fn test_separator_inside_parens() -> Result<(), PipelineError> {
        let calls = parse_scheme("tab(a=1,b=2);long()", ';')?;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].kwargs.len(), 2);
        Ok(())
    }

    #[test]
    fn test_bad_schemes() {
        assert!(parse_scheme("dup(", ',').is_err());
        assert!(parse_scheme("dup)", ',').is_err());
        assert!(parse_scheme("dup", ',').is_err());
        assert!(parse_scheme("qual(30)", ',').is_err());
        let call = parse_call("qual(q=abc)").unwrap();
        assert!(call.arg("q", 10u8).is_err());
        assert!(call.only_args(&["n"]).is_err());
    }
}
