//! Minimal template language for job files.
//!
//! Text outside the delimiters is copied verbatim. Inside them one action is
//! allowed:
//!
//! ```text
//! [[ key "service/web/image" ]]
//! [[ keyOrDefault "service/web/count" "1" ]]
//! [[ env "NOMADSPACE_ID" ]]
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{NomadSpaceError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Key(String),
    KeyOrDefault(String, String),
    Env(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Action(Action),
}

/// Result of rendering against a KV snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Complete(String),
    /// Some `key` actions have no value yet
    Missing(BTreeSet<String>),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r#""((?:[^"\\]|\\.)*)"|(\S+)"#).expect("token regex is valid")
    })
}

impl Template {
    /// Parse `source`, using `left`/`right` as action delimiters.
    pub fn parse(name: &str, source: &str, left: &str, right: &str) -> Result<Self> {
        let err = |reason: String| NomadSpaceError::Template {
            template: name.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find(left) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + left.len()..];
            let end = after
                .find(right)
                .ok_or_else(|| err(format!("unclosed action, expected {:?}", right)))?;
            let action = parse_action(after[..end].trim()).map_err(err)?;
            segments.push(Segment::Action(action));
            rest = &after[end + right.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Template { segments })
    }

    /// KV paths this template reads.
    pub fn kv_keys(&self) -> BTreeSet<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Action(Action::Key(path))
                | Segment::Action(Action::KeyOrDefault(path, _)) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Render against `kv` (path to value, `None` when absent) and `env`.
    pub fn render(
        &self,
        kv: &HashMap<String, Option<String>>,
        env: &HashMap<String, String>,
    ) -> Rendered {
        let mut out = String::new();
        let mut missing = BTreeSet::new();

        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(Action::Key(path)) => match kv.get(path).cloned().flatten() {
                    Some(value) => out.push_str(&value),
                    None => {
                        missing.insert(format!("kv.block({})", path));
                    }
                },
                Segment::Action(Action::KeyOrDefault(path, default)) => {
                    match kv.get(path).cloned().flatten() {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(default),
                    }
                }
                Segment::Action(Action::Env(name)) => {
                    out.push_str(env.get(name).map(String::as_str).unwrap_or_default())
                }
            }
        }

        if missing.is_empty() {
            Rendered::Complete(out)
        } else {
            Rendered::Missing(missing)
        }
    }
}

fn parse_action(body: &str) -> std::result::Result<Action, String> {
    let mut tokens = token_regex().captures_iter(body).map(|cap| {
        match (cap.get(1), cap.get(2)) {
            (Some(quoted), _) => Token::Str(unescape(quoted.as_str())),
            (None, Some(bare)) => Token::Bare(bare.as_str().to_string()),
            (None, None) => Token::Bare(String::new()),
        }
    });

    let func = match tokens.next() {
        Some(Token::Bare(func)) => func,
        Some(Token::Str(_)) => return Err(format!("expected a function name in {:?}", body)),
        None => return Err("empty action".to_string()),
    };

    let mut args = Vec::new();
    for token in tokens {
        match token {
            Token::Str(s) => args.push(s),
            Token::Bare(b) => return Err(format!("arguments must be quoted strings, got {:?}", b)),
        }
    }

    match (func.as_str(), args.as_slice()) {
        ("key", [path]) => Ok(Action::Key(path.clone())),
        ("keyOrDefault", [path, default]) => Ok(Action::KeyOrDefault(path.clone(), default.clone())),
        ("env", [name]) => Ok(Action::Env(name.clone())),
        ("key" | "keyOrDefault" | "env", _) => {
            Err(format!("wrong number of arguments for {}: {}", func, args.len()))
        }
        _ => Err(format!("unknown function {:?}", func)),
    }
}

enum Token {
    Str(String),
    Bare(String),
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
