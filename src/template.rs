//! `[[ ... ]]` template rendering.
//!
//! Configuration strings (IP ranges, header patterns, external-data request
//! headers, custom request headers) may embed actions between `[[` and `]]`.
//! The language is deliberately narrow: there are no loops, conditionals or
//! user-defined functions, only value lookups and three builtins.
//!
//! | Expression | Result |
//! |------------|--------|
//! | `.data.ranges` | field lookup in the render context |
//! | `.` | the whole render context |
//! | `"literal"` | a string literal |
//! | `env "NAME"` | value of an environment variable (empty when unset) |
//! | `file "PATH"` | contents of a file |
//! | `index .Req.Header "X-Api-Key"` | key / array-position lookup |
//!
//! Rendering a scalar writes it verbatim. Rendering an array or an object
//! writes its scalar elements joined with `,`, so a list of CIDRs fetched
//! from an external source expands to a comma-separated range string.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use tls_guard::template::Template;
//!
//! let tpl = Template::parse("[[ .data.net ]]/24").unwrap();
//! let out = tpl.render(&json!({"data": {"net": "10.1.2.0"}})).unwrap();
//! assert_eq!(out, "10.1.2.0/24");
//! ```

use std::fmt::Write as _;
use std::fs;

use serde_json::Value;

use crate::{Error, Result};

const OPEN: &str = "[[";
const CLOSE: &str = "]]";

/// A parsed template, ready to be rendered any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Action(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(String),
    Path(Vec<String>),
    Env(Box<Expr>),
    File(Box<Expr>),
    Index(Box<Expr>, Vec<Expr>),
}

impl Template {
    /// Parse a template string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Template`] on an unclosed action, an empty action, an
    /// unknown function, or a malformed argument list.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or_else(|| Error::Template(format!("unclosed action in {source:?}")))?;
            let expr = parse_action(&after_open[..end])
                .map_err(|e| Error::Template(format!("{e} in {source:?}")))?;
            segments.push(Segment::Action(expr));
            rest = &after_open[end + CLOSE.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render the template against `context`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Template`] when a looked-up field does not exist or
    /// `file` cannot read its path.
    pub fn render(&self, context: &Value) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(expr) => {
                    let value = eval(expr, context)?;
                    write_value(&mut out, &value);
                }
            }
        }
        Ok(out)
    }
}

/// Parse and render `source` in one step.
///
/// # Errors
///
/// Returns [`Error::Template`] on a parse or render failure.
pub fn render_str(source: &str, context: &Value) -> Result<String> {
    Template::parse(source)?.render(context)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Path(Vec<String>),
    Ident(String),
    Int(usize),
}

fn parse_action(action: &str) -> std::result::Result<Expr, String> {
    let tokens = tokenize(action)?;
    let mut iter = tokens.into_iter();
    let head = iter.next().ok_or("empty action")?;
    let args: Vec<Token> = iter.collect();

    match head {
        Token::Ident(name) => {
            let args = args
                .into_iter()
                .map(operand)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            call(&name, args)
        }
        other if args.is_empty() => operand(other),
        _ => Err("unexpected arguments after value".to_string()),
    }
}

fn call(name: &str, mut args: Vec<Expr>) -> std::result::Result<Expr, String> {
    match name {
        "env" | "file" => {
            if args.len() != 1 {
                return Err(format!("{name} expects exactly one argument"));
            }
            let arg = Box::new(args.remove(0));
            Ok(if name == "env" {
                Expr::Env(arg)
            } else {
                Expr::File(arg)
            })
        }
        "index" => {
            if args.len() < 2 {
                return Err("index expects a value and at least one key".to_string());
            }
            let target = Box::new(args.remove(0));
            Ok(Expr::Index(target, args))
        }
        other => Err(format!("unknown function {other:?}")),
    }
}

fn operand(token: Token) -> std::result::Result<Expr, String> {
    match token {
        Token::Str(s) => Ok(Expr::Literal(s)),
        Token::Int(n) => Ok(Expr::Literal(n.to_string())),
        Token::Path(p) => Ok(Expr::Path(p)),
        Token::Ident(name) => Err(format!("function {name:?} used as a value")),
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            tokens.push(Token::Str(read_string(&mut chars)?));
        } else if c == '.' {
            let word = read_word(&mut chars);
            let fields: Vec<String> = word
                .split('.')
                .skip(1)
                .filter(|f| !f.is_empty())
                .map(str::to_owned)
                .collect();
            if word.len() > 1 && fields.len() != word.matches('.').count() {
                return Err(format!("malformed field path {word:?}"));
            }
            tokens.push(Token::Path(fields));
        } else if c.is_ascii_digit() {
            let word = read_word(&mut chars);
            let n = word
                .parse()
                .map_err(|_| format!("malformed number {word:?}"))?;
            tokens.push(Token::Int(n));
        } else if c.is_alphabetic() || c == '_' {
            tokens.push(Token::Ident(read_word(&mut chars)));
        } else {
            return Err(format!("unexpected character {c:?}"));
        }
    }

    Ok(tokens)
}

fn read_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == '"' {
            break;
        }
        word.push(c);
        chars.next();
    }
    word
}

fn read_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> std::result::Result<String, String> {
    let mut s = String::new();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Ok(s),
            '\\' => match chars.next() {
                Some('n') => s.push('\n'),
                Some('t') => s.push('\t'),
                Some(other) => s.push(other),
                None => break,
            },
            _ => s.push(c),
        }
    }
    Err("unterminated string literal".to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

fn eval(expr: &Expr, context: &Value) -> Result<Value> {
    match expr {
        Expr::Literal(s) => Ok(Value::String(s.clone())),
        Expr::Path(fields) => {
            let mut current = context;
            for field in fields {
                current = current
                    .get(field.as_str())
                    .ok_or_else(|| Error::Template(format!("no field {field:?}")))?;
            }
            Ok(current.clone())
        }
        Expr::Env(arg) => {
            let name = eval_string(arg, context)?;
            Ok(Value::String(std::env::var(&name).unwrap_or_default()))
        }
        Expr::File(arg) => {
            let path = eval_string(arg, context)?;
            let contents = fs::read_to_string(&path)
                .map_err(|e| Error::Template(format!("file {path:?}: {e}")))?;
            Ok(Value::String(contents))
        }
        Expr::Index(target, keys) => {
            let mut current = eval(target, context)?;
            for key in keys {
                let key = eval_string(key, context)?;
                current = lookup(&current, &key)
                    .ok_or_else(|| Error::Template(format!("index {key:?} not found")))?;
            }
            Ok(current)
        }
    }
}

fn eval_string(expr: &Expr, context: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, &eval(expr, context)?);
    Ok(out)
}

fn lookup(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Array(items) => join_into(out, items.iter()),
        Value::Object(map) => join_into(out, map.values()),
    }
}

fn join_into<'a>(out: &mut String, items: impl Iterator<Item = &'a Value>) {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(out, item);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    #[test]
    fn plain_text_renders_unchanged() {
        let tpl = Template::parse("10.0.0.0/8").unwrap();
        assert!(tpl.segments.iter().all(|s| matches!(s, Segment::Text(_))));
        assert_eq!(tpl.render(&json!({})).unwrap(), "10.0.0.0/8");
    }

    #[test]
    fn field_path_resolves_nested_value() {
        // GIVEN: a context with nested data
        let ctx = json!({"data": {"office": {"cidr": "192.168.10.0/24"}}});
        // WHEN: rendering a path expression
        let out = render_str("[[ .data.office.cidr ]]", &ctx).unwrap();
        // THEN: the nested value is substituted
        assert_eq!(out, "192.168.10.0/24");
    }

    #[test]
    fn array_values_render_comma_joined() {
        let ctx = json!({"data": ["10.0.0.0/8", "172.16.0.0/12"]});
        let out = render_str("[[.data]]", &ctx).unwrap();
        assert_eq!(out, "10.0.0.0/8,172.16.0.0/12");
    }

    #[test]
    fn env_function_reads_environment() {
        let expected = std::env::var("PATH").unwrap_or_default();
        let out = render_str("[[ env \"PATH\" ]]", &json!({})).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn env_function_unset_variable_renders_empty() {
        let out = render_str("[[env \"TLS_GUARD_DEFINITELY_UNSET_VAR\"]]", &json!({})).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn file_function_reads_contents() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "^token-").unwrap();
        let src = format!("[[ file \"{}\" ]]", f.path().display());
        assert_eq!(render_str(&src, &json!({})).unwrap(), "^token-");
    }

    #[test]
    fn file_function_missing_file_is_error() {
        let err = render_str("[[ file \"/nonexistent/tls-guard/x\" ]]", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn index_handles_keys_with_dashes() {
        let ctx = json!({"Req": {"Header": {"X-Api-Key": "abc"}}});
        let out = render_str("key=[[ index .Req.Header \"X-Api-Key\" ]]", &ctx).unwrap();
        assert_eq!(out, "key=abc");
    }

    #[test]
    fn index_into_array_by_position() {
        let ctx = json!({"Cert": {"DNSNames": ["a.example", "b.example"]}});
        let out = render_str("[[ index .Cert.DNSNames 1 ]]", &ctx).unwrap();
        assert_eq!(out, "b.example");
    }

    #[test]
    fn missing_field_is_render_error() {
        let tpl = Template::parse("[[ .Cert.Subject.CommonName ]]").unwrap();
        let err = tpl.render(&json!({"Req": {}})).unwrap_err();
        assert!(err.to_string().contains("Cert"), "got: {err}");
    }

    #[test]
    fn unclosed_action_is_parse_error() {
        assert!(Template::parse("[[ .data ").is_err());
    }

    #[test]
    fn unknown_function_is_parse_error() {
        let err = Template::parse("[[ exec \"rm\" ]]").unwrap_err();
        assert!(err.to_string().contains("unknown function"));
    }

    #[test]
    fn empty_action_is_parse_error() {
        assert!(Template::parse("[[ ]]").is_err());
    }

    #[test]
    fn mixed_text_and_actions() {
        let ctx = json!({"Req": {"Method": "GET", "URL": {"Path": "/x"}}});
        let out = render_str("[[.Req.Method]] [[.Req.URL.Path]]!", &ctx).unwrap();
        assert_eq!(out, "GET /x!");
    }

    #[test]
    fn string_literal_with_escapes() {
        let out = render_str(r#"[[ "a\"b" ]]"#, &json!({})).unwrap();
        assert_eq!(out, "a\"b");
    }
}
