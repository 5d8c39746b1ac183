//! External tool invocation descriptors.
//!
//! A [`ToolCommand`] is a program plus the arguments that always precede the
//! per-invocation ones, so a tool can be reached through a wrapper such as
//! `docker exec box gadgetron` without going through a shell.

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Parse a command prefix such as `docker exec box gadgetron`. Returns
    /// `None` for a blank line.
    #[must_use]
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = split_command_line(command_line).into_iter();
        let program = words.next()?;
        Some(Self {
            program,
            leading_args: words.collect(),
        })
    }

    /// Run `script` through `sh -c`; per-invocation arguments become `$1..`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: "sh".to_owned(),
            leading_args: vec!["-c".to_owned(), script.into(), "tool".to_owned()],
        }
    }

    /// A `Command` with the program and leading arguments applied.
    #[must_use]
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        command
    }

    /// Human-readable rendering of a full invocation, for logs and errors.
    #[must_use]
    pub fn render<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        std::iter::once(self.program.clone())
            .chain(self.leading_args.iter().cloned())
            .chain(
                args.into_iter()
                    .map(|arg| arg.as_ref().to_string_lossy().into_owned()),
            )
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(std::iter::empty::<&str>()))
    }
}

/// Split a free-form argument string into words. Whitespace separates words;
/// single quotes keep their content literally, double quotes allow `\"` and
/// `\\` escapes, and a backslash outside quotes escapes the next character.
#[must_use]
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '"' => {
                in_word = true;
                while let Some(quoted) = chars.next() {
                    match quoted {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => current.push('\\'),
                        },
                        _ => current.push(quoted),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ch if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(ch);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::{ToolCommand, split_command_line};

    #[test]
    fn split_handles_quotes_and_escapes() {
        assert_eq!(
            split_command_line(r#"--parameter 'a b' "c \"d\"" e\ f  "#),
            vec!["--parameter", "a b", r#"c "d""#, "e f"]
        );
        assert!(split_command_line("   ").is_empty());
        assert_eq!(split_command_line("''"), vec![String::new()]);
    }

    #[test]
    fn parse_splits_program_from_prefix() {
        let tool = ToolCommand::parse("docker exec box gadgetron").expect("non-empty");
        assert_eq!(tool.program, "docker");
        assert_eq!(tool.leading_args, vec!["exec", "box", "gadgetron"]);
        assert!(ToolCommand::parse("  ").is_none());
    }

    #[test]
    fn render_appends_invocation_args() {
        let tool = ToolCommand::new("gadgetron");
        assert_eq!(tool.render(["--from_stream", "-c", "x.xml"]), "gadgetron --from_stream -c x.xml");
        assert_eq!(tool.to_string(), "gadgetron");
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_passes_positional_args() {
        let tool = ToolCommand::shell("printf '%s|%s' \"$1\" \"$2\"");
        let output = tool.command().args(["one", "two"]).output().expect("sh runs");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "one|two");
    }
}
