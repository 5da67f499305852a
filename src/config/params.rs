use std::env;
use std::sync::OnceLock;

use regex::Regex;

fn unix_env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\$(\w+)\}").unwrap())
}

fn windows_env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{%(\w+)%\}").unwrap())
}

/// Splits a parameter string into arguments.
///
/// The default split is whitespace with double- and single-quoted segments
/// kept whole. A leading `:<delim>:` selects a literal delimiter instead,
/// which lets arguments contain spaces: `:~:-e~90` is `["-e", "90"]`.
pub fn parse_args(param: &str) -> Vec<String> {
    if param.is_empty() {
        return Vec::new();
    }
    if let Some(rest) = param.strip_prefix(':') {
        let mut delim = " ".to_string();
        let mut body = rest;
        if let Some(pos) = rest.find(':') {
            if pos > 0 {
                delim = rest[..pos].to_string();
                body = &rest[pos + 1..];
            }
        }
        return body.split(&delim).map(str::to_string).collect();
    }
    split_quoted(param)
}

fn split_quoted(param: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;

    for c in param.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => {
                current.push(c);
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                pending = true;
            }
            None if c.is_whitespace() => {
                if pending || !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            None => {
                current.push(c);
            }
        }
    }
    if pending || !current.is_empty() {
        args.push(current);
    }
    args
}

/// Expands `{$NAME}` (Unix form) and `{%NAME%}` (Windows form) references
/// from the process environment. Unset variables expand to the empty string.
pub fn expand_env(value: &str) -> String {
    let pass1 = unix_env_re().replace_all(value, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    windows_env_re()
        .replace_all(&pass1, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Splits `NAME=value` entries from `app.env`, expanding variable
/// references in the value part.
pub fn parse_env_entries(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), expand_env(value)))
        })
        .collect()
}
