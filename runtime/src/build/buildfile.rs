//! Build file parser.
//!
//! Parses a Dockerfile-style build file into an ordered list of
//! instructions. Supports line continuations (`\`), comments, and both shell
//! and JSON (exec) forms for RUN/CMD/ENTRYPOINT. Instruction order is
//! preserved exactly; it is significant for layer caching.

use std::path::Path;

use strata_core::error::{Result, StrataError};

/// File names probed in the build context when no build file is given.
pub const DEFAULT_BUILD_FILES: &[&str] = &["Stratafile", "Dockerfile"];

/// A single build instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From { image: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { vars: Vec<(String, String)> },
    /// `COPY <src>... <dst>`
    Copy { src: Vec<String>, dst: String },
    /// `RUN <command>` or `RUN ["exec", "form"]`
    Run { command: Command },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `LABEL <key>=<value>`
    Label { key: String, value: String },
}

/// Command body of a RUN instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Run through the configured shell
    Shell(String),
    /// Run directly as an argument vector
    Exec(Vec<String>),
}

impl Command {
    /// Whether the command text mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        match self {
            Command::Shell(s) => s.split_whitespace().any(|w| word_names(w, needle)),
            Command::Exec(args) => args.iter().any(|a| word_names(a, needle)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Shell(s) => write!(f, "{}", s),
            Command::Exec(args) => write!(f, "{}", serde_json::to_string(args).unwrap_or_default()),
        }
    }
}

/// `-r requirements.txt`, `--requirement=./requirements.txt`, `requirements.txt`
fn word_names(word: &str, file_name: &str) -> bool {
    let word = word.rsplit('=').next().unwrap_or(word);
    let word = word.trim_start_matches("./");
    word == file_name || word.ends_with(&format!("/{}", file_name))
}

/// An instruction together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    /// 1-based line of the instruction's first physical line
    pub line: usize,
    /// Instruction text as written (continuations joined)
    pub text: String,
    pub instruction: Instruction,
}

/// Parsed build file: instructions in declaration order.
#[derive(Debug, Clone)]
pub struct BuildFile {
    pub instructions: Vec<Located>,
}

impl BuildFile {
    /// Parse a build file from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let instruction = parse_instruction(trimmed, line_num)?;
            instructions.push(Located {
                line: line_num,
                text: trimmed.to_string(),
                instruction,
            });
        }

        if instructions.is_empty() {
            return Err(StrataError::BuildFile(
                "build file is empty or contains no instructions".to_string(),
            ));
        }

        let first_non_arg = instructions
            .iter()
            .find(|l| !matches!(l.instruction, Instruction::Arg { .. }));
        if !matches!(
            first_non_arg.map(|l| &l.instruction),
            Some(Instruction::From { .. })
        ) {
            return Err(StrataError::BuildFile(
                "first instruction must be FROM (or ARG before FROM)".to_string(),
            ));
        }

        if let Some(second) = instructions
            .iter()
            .filter(|l| matches!(l.instruction, Instruction::From { .. }))
            .nth(1)
        {
            return Err(StrataError::BuildFile(format!(
                "line {}: multi-stage builds are not supported (second FROM)",
                second.line
            )));
        }

        Ok(BuildFile { instructions })
    }

    /// Parse a build file from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::BuildFile(format!(
                "failed to read build file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// Join lines ending with `\` into logical lines, keeping each one's
/// starting line number.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        // Comment lines inside a continuation are dropped
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num),
        "ARG" => parse_arg(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "EXPOSE" => parse_expose(rest, line_num),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint {
            exec: parse_exec_or_shell("ENTRYPOINT", rest, line_num)?,
        }),
        "CMD" => Ok(Instruction::Cmd {
            exec: parse_exec_or_shell("CMD", rest, line_num)?,
        }),
        "LABEL" => parse_label(rest, line_num),
        "ADD" | "VOLUME" | "USER" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD"
        | "MAINTAINER" => Err(StrataError::BuildFile(format!(
            "line {}: unsupported instruction '{}'",
            line_num, keyword_upper
        ))),
        _ => Err(StrataError::BuildFile(format!(
            "line {}: unknown instruction '{}'",
            line_num, keyword
        ))),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn require<'a>(keyword: &str, rest: &'a str, what: &str, line_num: usize) -> Result<&'a str> {
    if rest.trim().is_empty() {
        return Err(StrataError::BuildFile(format!(
            "line {}: {} requires {}",
            line_num, keyword, what
        )));
    }
    Ok(rest.trim())
}

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("FROM", rest, "an image argument", line_num)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        [image] | [image, _, _] if parts.len() == 1 || parts[1].eq_ignore_ascii_case("AS") => {
            Ok(Instruction::From {
                image: image.to_string(),
            })
        }
        _ => Err(StrataError::BuildFile(format!(
            "line {}: expected 'FROM <image> [AS <name>]'",
            line_num
        ))),
    }
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("ARG", rest, "a name", line_num)?;
    match rest.split_once('=') {
        Some((name, default)) => Ok(Instruction::Arg {
            name: name.trim().to_string(),
            default: Some(unquote(default)),
        }),
        None => Ok(Instruction::Arg {
            name: rest.to_string(),
            default: None,
        }),
    }
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    let path = require("WORKDIR", rest, "a path", line_num)?;
    Ok(Instruction::Workdir {
        path: unquote(path),
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("ENV", rest, "a key and value", line_num)?;

    // Legacy `ENV KEY some value`: no '=' in the first word
    let (first, value) = split_first_word(rest);
    if !first.contains('=') {
        return Ok(Instruction::Env {
            vars: vec![(first.to_string(), unquote(value))],
        });
    }

    let mut vars = Vec::new();
    for word in split_quoted_words(rest, line_num)? {
        let (key, value) = word.split_once('=').ok_or_else(|| {
            StrataError::BuildFile(format!(
                "line {}: ENV expects KEY=VALUE pairs, got '{}'",
                line_num, word
            ))
        })?;
        if key.is_empty() {
            return Err(StrataError::BuildFile(format!(
                "line {}: ENV key must not be empty",
                line_num
            )));
        }
        vars.push((key.to_string(), value.to_string()));
    }
    Ok(Instruction::Env { vars })
}

/// Split on unquoted whitespace, dropping the quotes. Inside double quotes
/// a backslash escapes the next character.
fn split_quoted_words(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            (Some(_), c) => word.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            (None, c) => {
                word.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(StrataError::BuildFile(format!(
            "line {}: unterminated quote",
            line_num
        )));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("COPY", rest, "source and destination", line_num)?;

    let mut parts: Vec<&str> = rest.split_whitespace().collect();
    if let Some(flag) = parts.iter().find(|p| p.starts_with("--")) {
        return Err(StrataError::BuildFile(format!(
            "line {}: COPY flag '{}' is not supported",
            line_num, flag
        )));
    }
    if parts.len() < 2 {
        return Err(StrataError::BuildFile(format!(
            "line {}: COPY requires at least one source and a destination",
            line_num
        )));
    }

    let dst = parts.pop().map(str::to_string).unwrap_or_default();
    let src = parts.into_iter().map(str::to_string).collect();
    Ok(Instruction::Copy { src, dst })
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("RUN", rest, "a command", line_num)?;
    let command = if rest.starts_with('[') {
        Command::Exec(parse_json_array(rest, line_num)?)
    } else {
        Command::Shell(rest.to_string())
    };
    Ok(Instruction::Run { command })
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("EXPOSE", rest, "at least one port", line_num)?;
    Ok(Instruction::Expose {
        ports: rest.split_whitespace().map(str::to_string).collect(),
    })
}

fn parse_exec_or_shell(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<String>> {
    let rest = require(keyword, rest, "an argument", line_num)?;
    let exec = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()]
    };
    if exec.is_empty() || exec[0].is_empty() {
        return Err(StrataError::BuildFile(format!(
            "line {}: {} must name a program",
            line_num, keyword
        )));
    }
    Ok(exec)
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = require("LABEL", rest, "key=value", line_num)?;
    match rest.split_once('=') {
        Some((key, value)) => Ok(Instruction::Label {
            key: unquote(key),
            value: unquote(value),
        }),
        None => {
            let (key, value) = split_first_word(rest);
            Ok(Instruction::Label {
                key: key.to_string(),
                value: unquote(value),
            })
        }
    }
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        StrataError::BuildFile(format!(
            "line {}: invalid JSON array '{}': {}",
            line_num, s, e
        ))
    })
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
