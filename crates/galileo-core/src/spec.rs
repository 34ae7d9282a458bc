use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("command line is empty")]
    EmptyCommand,
    #[error("unterminated {quote} quote in command line: {line}")]
    UnterminatedQuote { quote: char, line: String },
}

/// A raw process invocation: executable path plus literal arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Splits `line` into program and arguments.
    ///
    /// Whitespace separates arguments; single and double quotes group, and a
    /// backslash escapes the next character outside single quotes. Nothing
    /// else is interpreted: no globbing, expansion or redirection.
    pub fn parse(line: &str) -> Result<Self, SpecError> {
        let mut parts = split_command_line(line)?.into_iter();
        let program = parts.next().ok_or(SpecError::EmptyCommand)?;
        Ok(Self::new(program).args(parts))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Quoted form suitable for logs; `parse` of this string yields the same argv.
    pub fn command_line(&self) -> String {
        let program = self.program.to_string_lossy();
        std::iter::once(program.as_ref())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// A process tree. Modifiers wrap exactly one child, so every branch ends in
/// a single [`ProcessSpec::Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessSpec {
    Command(Invocation),
    /// Start the child `offset` after the enclosing shell's epoch.
    Delay {
        offset: Duration,
        child: Box<ProcessSpec>,
    },
    /// Terminate the child `duration` after its process actually started.
    RunFor {
        duration: Duration,
        child: Box<ProcessSpec>,
    },
    /// Sample performance counters for the child's lifetime.
    Perf { child: Box<ProcessSpec> },
}

impl ProcessSpec {
    pub fn command(line: &str) -> Result<Self, SpecError> {
        Invocation::parse(line).map(ProcessSpec::Command)
    }

    pub fn child(&self) -> Option<&ProcessSpec> {
        match self {
            ProcessSpec::Command(_) => None,
            ProcessSpec::Delay { child, .. }
            | ProcessSpec::RunFor { child, .. }
            | ProcessSpec::Perf { child } => Some(child),
        }
    }

    /// The raw invocation at the bottom of this branch.
    pub fn invocation(&self) -> &Invocation {
        let mut node = self;
        loop {
            match node {
                ProcessSpec::Command(invocation) => return invocation,
                ProcessSpec::Delay { child, .. }
                | ProcessSpec::RunFor { child, .. }
                | ProcessSpec::Perf { child } => node = child,
            }
        }
    }

    pub fn is_instrumented(&self) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if matches!(current, ProcessSpec::Perf { .. }) {
                return true;
            }
            node = current.child();
        }
        false
    }
}

impl From<Invocation> for ProcessSpec {
    fn from(invocation: Invocation) -> Self {
        ProcessSpec::Command(invocation)
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessSpec::Command(invocation) => write!(f, "{}", invocation),
            ProcessSpec::Delay { offset, child } => write!(f, "delay({:?}, {})", offset, child),
            ProcessSpec::RunFor { duration, child } => {
                write!(f, "run_for({:?}, {})", duration, child)
            }
            ProcessSpec::Perf { child } => write!(f, "perf({})", child),
        }
    }
}

pub fn delay(offset: Duration, spec: impl Into<ProcessSpec>) -> ProcessSpec {
    ProcessSpec::Delay {
        offset,
        child: Box::new(spec.into()),
    }
}

pub fn run_for(duration: Duration, spec: impl Into<ProcessSpec>) -> ProcessSpec {
    ProcessSpec::RunFor {
        duration,
        child: Box::new(spec.into()),
    }
}

pub fn perf(spec: impl Into<ProcessSpec>) -> ProcessSpec {
    ProcessSpec::Perf {
        child: Box::new(spec.into()),
    }
}

fn split_command_line(line: &str) -> Result<Vec<String>, SpecError> {
    let unterminated = |quote| SpecError::UnterminatedQuote {
        quote,
        line: line.to_string(),
    };
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_token = true;
                let quote = c;
                loop {
                    match chars.next() {
                        Some(q) if q == quote => break,
                        Some('\\') if quote == '"' => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(unterminated(quote)),
                        },
                        Some(other) => current.push(other),
                        None => return Err(unterminated(quote)),
                    }
                }
            }
            '\\' => {
                in_token = true;
                current.push(chars.next().unwrap_or('\\'));
            }
            c if c.is_whitespace() => {
                if in_token {
                    parts.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        parts.push(current);
    }
    Ok(parts)
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_program_and_literal_arguments() {
        let inv = Invocation::parse("/opt/mutilate -s 127.0.0.1 -t 25").expect("parse");
        assert_eq!(inv.program, PathBuf::from("/opt/mutilate"));
        assert_eq!(inv.args, vec!["-s", "127.0.0.1", "-t", "25"]);
        assert_eq!(inv.working_dir, None);
    }

    #[test]
    fn parse_groups_quotes_without_interpreting_metacharacters() {
        let inv = Invocation::parse(r#"sh -c 'echo $HOME > out' "a \"b\"" c\ d"#).expect("parse");
        assert_eq!(inv.program, PathBuf::from("sh"));
        assert_eq!(inv.args, vec!["-c", "echo $HOME > out", "a \"b\"", "c d"]);
    }

    #[test]
    fn parse_keeps_empty_quoted_arguments() {
        let inv = Invocation::parse("prog '' x").expect("parse");
        assert_eq!(inv.args, vec!["", "x"]);
    }

    #[test]
    fn parse_rejects_empty_and_unterminated_lines() {
        assert_eq!(Invocation::parse("   "), Err(SpecError::EmptyCommand));
        match Invocation::parse("echo 'oops") {
            Err(SpecError::UnterminatedQuote { quote, .. }) => assert_eq!(quote, '\''),
            other => panic!("expected unterminated quote, got {:?}", other),
        }
    }

    #[test]
    fn command_line_round_trips_through_parse() {
        let inv = Invocation::new("/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .arg("it's");
        let reparsed = Invocation::parse(&inv.command_line()).expect("reparse");
        assert_eq!(reparsed, inv);
    }

    #[test]
    fn combinators_build_nested_tree() {
        let spec = delay(
            Duration::from_secs(3),
            run_for(
                Duration::from_secs(25),
                ProcessSpec::command("./mutilate -t 25").expect("command"),
            ),
        );
        assert_eq!(
            spec.to_string(),
            "delay(3s, run_for(25s, ./mutilate -t 25))"
        );
        assert_eq!(spec.invocation().program, PathBuf::from("./mutilate"));
        assert!(!spec.is_instrumented());
        assert!(perf(spec.clone()).is_instrumented());
        assert!(matches!(spec.child(), Some(ProcessSpec::RunFor { .. })));
    }
}
