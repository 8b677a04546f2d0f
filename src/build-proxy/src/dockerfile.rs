//! Dockerfile parser.
//!
//! Parses a Dockerfile into a sequence of commands, keeping the original
//! text of every line so that untouched instructions re-render exactly.
//! Supports line continuations (`\`), comments, and both shell and JSON
//! (exec) forms.

use a3s_box_core::error::{BoxError, Result};

/// Pseudo-instruction name for comments and blank lines.
pub const COMMENT: &str = "COMMENT";

/// Arguments of a single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArgs {
    /// Free-form text (shell form, `WORKDIR`, `USER`, ...)
    Text(String),
    /// Ordered words or exec-form elements
    List(Vec<String>),
    /// Ordered `key=value` pairs (`ENV`, `LABEL`)
    Map(Vec<(String, String)>),
}

/// A single Dockerfile instruction (or comment).
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Upper-cased instruction keyword, or [`COMMENT`]
    pub name: String,
    pub args: CommandArgs,
    /// Original source text, including continuations
    pub raw: Option<String>,
}

impl Command {
    /// Build a synthetic command with no original text.
    pub fn new(name: impl Into<String>, args: CommandArgs) -> Self {
        Self {
            name: name.into(),
            args,
            raw: None,
        }
    }

    /// A comment or blank line, rendered from its original text.
    pub fn comment(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            name: COMMENT.to_string(),
            args: CommandArgs::Text(raw.clone()),
            raw: Some(raw),
        }
    }

    pub fn is_comment(&self) -> bool {
        self.name == COMMENT
    }

    pub fn is_from(&self) -> bool {
        self.name == "FROM"
    }
}

/// Parse Dockerfile text into commands, one per logical line.
///
/// Comments and blank lines become [`COMMENT`] pseudo-commands, so joining
/// the raw text of the result with `\n` reproduces the input.
pub fn parse(content: &str) -> Result<Vec<Command>> {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut commands = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            commands.push(Command::comment(lines[i]));
            i += 1;
            continue;
        }

        let start = i;
        let mut logical = String::new();
        while i < lines.len() {
            let line = lines[i].trim_end();
            i += 1;

            // Comments and blank lines inside a continuation are dropped
            let inner = line.trim_start();
            if i - 1 > start && (inner.is_empty() || inner.starts_with('#')) {
                continue;
            }

            match line.strip_suffix('\\') {
                Some(head) => logical.push_str(head),
                None => {
                    logical.push_str(line);
                    break;
                }
            }
        }

        let raw = lines[start..i].join("\n");
        commands.push(parse_instruction(&logical, start + 1, raw)?);
    }

    Ok(commands)
}

/// Parse a single logical line into a Command.
fn parse_instruction(line: &str, line_num: usize, raw: String) -> Result<Command> {
    let (keyword, rest) = split_first_word(line);
    let name = keyword.to_uppercase();

    if rest.is_empty() {
        return Err(BoxError::BuildError(format!(
            "Line {}: {} requires arguments",
            line_num, name
        )));
    }

    let args = match name.as_str() {
        "ENV" | "LABEL" => CommandArgs::Map(parse_key_values(rest, line_num)?),
        "RUN" | "CMD" | "ENTRYPOINT" | "SHELL" | "VOLUME" => parse_exec_or_text(rest),
        "COPY" | "ADD" => CommandArgs::List(parse_copy_args(rest)),
        "FROM" | "ARG" | "EXPOSE" => CommandArgs::List(words(rest)),
        "WORKDIR" | "USER" | "MAINTAINER" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" => {
            CommandArgs::Text(rest.to_string())
        }
        _ => {
            return Err(BoxError::BuildError(format!(
                "Line {}: Unknown instruction '{}'",
                line_num, keyword
            )))
        }
    };

    Ok(Command {
        name,
        args,
        raw: Some(raw),
    })
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// JSON exec form when the argument is a valid string array, shell form otherwise.
fn parse_exec_or_text(rest: &str) -> CommandArgs {
    if rest.starts_with('[') {
        if let Ok(parts) = serde_json::from_str::<Vec<String>>(rest) {
            return CommandArgs::List(parts);
        }
    }
    CommandArgs::Text(rest.to_string())
}

/// `COPY`/`ADD`: leading `--flags`, then either a JSON array or words.
fn parse_copy_args(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut remaining = rest;
    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        args.push(flag.to_string());
        remaining = after;
    }

    if remaining.starts_with('[') {
        if let Ok(parts) = serde_json::from_str::<Vec<String>>(remaining) {
            args.extend(parts);
            return args;
        }
    }
    args.extend(words(remaining));
    args
}

/// `ENV`/`LABEL` arguments: `k=v k2="v 2"` pairs, or legacy `KEY value`.
fn parse_key_values(rest: &str, line_num: usize) -> Result<Vec<(String, String)>> {
    let (first, value) = split_first_word(rest);
    if !first.contains('=') {
        return Ok(vec![(first.to_string(), unquote(value))]);
    }

    let tokens = shlex::split(rest).ok_or_else(|| {
        BoxError::BuildError(format!(
            "Line {}: Unbalanced quotes in '{}'",
            line_num, rest
        ))
    })?;

    tokens
        .into_iter()
        .map(|token| match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(BoxError::BuildError(format!(
                "Line {}: Expected key=value, got '{}'",
                line_num, token
            ))),
        })
        .collect()
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
