//! Renders parsed Dockerfile commands back to text.

use crate::dockerfile::{Command, CommandArgs};

/// Instructions whose list form is written space-separated rather than as a
/// JSON exec-form array.
const ARGUMENT_LIST_INSTRUCTIONS: &[&str] = &["FROM", "ARG", "EXPOSE", "LABEL"];

/// Render a command sequence, one instruction per line.
pub fn serialize_dockerfile(commands: &[Command]) -> String {
    commands
        .iter()
        .map(serialize_command)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a single command.
///
/// Commands carrying their original text are reproduced verbatim.
pub fn serialize_command(command: &Command) -> String {
    if let Some(raw) = &command.raw {
        return raw.clone();
    }
    if command.is_comment() {
        return match &command.args {
            CommandArgs::Text(text) => text.clone(),
            other => serialize_args(&command.name, other),
        };
    }
    format!("{} {}", command.name, serialize_args(&command.name, &command.args))
}

fn serialize_args(name: &str, args: &CommandArgs) -> String {
    match args {
        CommandArgs::Text(text) => text.clone(),
        CommandArgs::List(items) => {
            let mut output = String::new();
            let mut items = items.as_slice();
            if let Some((first, rest)) = items.split_first() {
                if first.starts_with("--") {
                    output.push_str(first);
                    output.push(' ');
                    items = rest;
                }
            }

            if ARGUMENT_LIST_INSTRUCTIONS.contains(&name) {
                output.push_str(&items.join(" "));
            } else {
                output.push_str(&exec_form(items));
            }
            output
        }
        CommandArgs::Map(pairs) => pairs
            .iter()
            .map(|(key, value)| format!("{}={}", key, quote(value)))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// `["a","b"]`, with JSON string escaping.
fn exec_form(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| quote(item)).collect();
    format!("[{}]", quoted.join(","))
}

/// Double-quote a value with JSON escaping rules.
fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
