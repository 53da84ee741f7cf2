//! Dockerfile parser.
//!
//! Parses a Dockerfile into a sequence of build instructions.
//! Supports line continuations (`\`), comments, quoted arguments, and both
//! shell and JSON (exec) forms for RUN/CMD/ENTRYPOINT/COPY/ADD.

use std::collections::BTreeMap;
use std::path::Path;

use dockyard_core::error::{PipelineError, Result};

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        alias: Option<String>,
    },
    /// `RUN <command>`
    Run { command: String },
    /// `COPY [--from=<stage>] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        from: Option<String>,
    },
    /// `ADD <src>... <dst>`
    Add { src: Vec<String>, dst: String },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { pairs: Vec<(String, String)> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `LABEL <key>=<value> ...`
    Label { pairs: Vec<(String, String)> },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
    /// Recognized instruction with no effect on the image we produce
    /// (VOLUME, SHELL, STOPSIGNAL, HEALTHCHECK, ONBUILD, MAINTAINER).
    Ignored { keyword: String, args: String },
}

impl Instruction {
    /// Upper-case keyword, for step logging.
    pub fn keyword(&self) -> &str {
        match self {
            Self::From { .. } => "FROM",
            Self::Run { .. } => "RUN",
            Self::Copy { .. } => "COPY",
            Self::Add { .. } => "ADD",
            Self::Workdir { .. } => "WORKDIR",
            Self::Env { .. } => "ENV",
            Self::Entrypoint { .. } => "ENTRYPOINT",
            Self::Cmd { .. } => "CMD",
            Self::Expose { .. } => "EXPOSE",
            Self::Label { .. } => "LABEL",
            Self::User { .. } => "USER",
            Self::Arg { .. } => "ARG",
            Self::Ignored { keyword, .. } => keyword,
        }
    }
}

/// Parsed Dockerfile: a list of instructions in order.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub instructions: Vec<Instruction>,
}

impl Dockerfile {
    /// Parse a Dockerfile from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            instructions.push(parse_instruction(trimmed, line_num)?);
        }

        if instructions.is_empty() {
            return Err(PipelineError::build(
                "Dockerfile is empty or contains no instructions",
            ));
        }

        // First non-ARG instruction must be FROM
        let first_non_arg = instructions
            .iter()
            .find(|i| !matches!(i, Instruction::Arg { .. }));
        if !matches!(first_non_arg, Some(Instruction::From { .. })) {
            return Err(PipelineError::build(
                "First instruction must be FROM (or ARG before FROM)",
            ));
        }

        Ok(Dockerfile { instructions })
    }

    /// Parse a Dockerfile from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::build(format!(
                "Failed to read Dockerfile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// Join lines ending with `\` into logical lines, keeping the line number
/// each logical line starts on. Comment lines inside a continuation are dropped.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        } else if line.trim_start().starts_with('#') {
            continue;
        }

        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                logical_lines.push((start, std::mem::take(&mut current)));
            }
        }
    }

    // Trailing continuation without a final line
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
        "RUN" => parse_run(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "ADD" => parse_add(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "ENTRYPOINT" => parse_exec("ENTRYPOINT", rest, line_num)
            .map(|exec| Instruction::Entrypoint { exec }),
        "CMD" => parse_exec("CMD", rest, line_num).map(|exec| Instruction::Cmd { exec }),
        "EXPOSE" => parse_expose(rest, line_num),
        "LABEL" => parse_label(rest, line_num),
        "USER" => parse_user(rest, line_num),
        "ARG" => parse_arg(rest, line_num),
        "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" | "MAINTAINER" => {
            Ok(Instruction::Ignored {
                keyword: keyword_upper,
                args: rest.to_string(),
            })
        }
        _ => Err(PipelineError::build(format!(
            "Line {}: Unknown instruction '{}'",
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

fn require_args(keyword: &str, rest: &str, what: &str, line_num: usize) -> Result<()> {
    if rest.trim().is_empty() {
        return Err(PipelineError::build(format!(
            "Line {}: {} requires {}",
            line_num, keyword, what
        )));
    }
    Ok(())
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    require_args("FROM", rest, "an image argument", line_num)?;

    let words: Vec<&str> = rest
        .split_whitespace()
        .filter(|w| !w.starts_with("--platform="))
        .collect();
    let image = words
        .first()
        .map(|w| w.to_string())
        .ok_or_else(|| PipelineError::build(format!("Line {}: FROM requires an image", line_num)))?;

    let alias = match words.as_slice() {
        [_, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => Some(alias.to_string()),
        [_] => None,
        _ => {
            return Err(PipelineError::build(format!(
                "Line {}: expected 'FROM <image> [AS <name>]'",
                line_num
            )))
        }
    };

    Ok(Instruction::From { image, alias })
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    require_args("RUN", rest, "a command", line_num)?;

    let command = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?.join(" ")
    } else {
        rest.to_string()
    };

    Ok(Instruction::Run { command })
}

/// Split `[--flag=value ...] <src>... <dst>` into flags, sources and destination.
fn parse_sources(
    keyword: &str,
    rest: &str,
    line_num: usize,
) -> Result<(Vec<(String, String)>, Vec<String>, String)> {
    require_args(keyword, rest, "source and destination", line_num)?;

    let mut flags = Vec::new();
    let mut remaining = rest.trim();
    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        let (name, value) = flag[2..].split_once('=').unwrap_or((&flag[2..], ""));
        flags.push((name.to_string(), value.to_string()));
        remaining = after;
    }

    let mut parts = if remaining.starts_with('[') {
        parse_json_array(remaining, line_num)?
    } else {
        split_words(remaining, line_num)?
    };
    if parts.len() < 2 {
        return Err(PipelineError::build(format!(
            "Line {}: {} requires at least one source and a destination",
            line_num, keyword
        )));
    }

    let dst = parts.pop().unwrap_or_default();
    Ok((flags, parts, dst))
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let (flags, src, dst) = parse_sources("COPY", rest, line_num)?;
    let mut from = None;
    for (name, value) in flags {
        match name.as_str() {
            "from" => from = Some(value),
            "chown" | "chmod" | "link" => {
                tracing::warn!(line = line_num, flag = %name, "COPY flag ignored");
            }
            other => {
                return Err(PipelineError::build(format!(
                    "Line {}: Unknown COPY flag '--{}'",
                    line_num, other
                )))
            }
        }
    }
    Ok(Instruction::Copy { src, dst, from })
}

fn parse_add(rest: &str, line_num: usize) -> Result<Instruction> {
    let (flags, src, dst) = parse_sources("ADD", rest, line_num)?;
    for (name, _) in flags {
        tracing::warn!(line = line_num, flag = %name, "ADD flag ignored");
    }
    Ok(Instruction::Add { src, dst })
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    require_args("WORKDIR", rest, "a path", line_num)?;
    Ok(Instruction::Workdir {
        path: unquote(rest),
    })
}

/// `KEY=VALUE ...` pairs, or the legacy `KEY VALUE` form where the value is
/// the rest of the line.
fn parse_pairs(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<(String, String)>> {
    require_args(keyword, rest, "a key and value", line_num)?;

    let (first, tail) = split_first_word(rest);
    if !first.contains('=') {
        if tail.is_empty() {
            return Err(PipelineError::build(format!(
                "Line {}: {} {} is missing a value",
                line_num, keyword, first
            )));
        }
        return Ok(vec![(first.to_string(), unquote(tail))]);
    }

    split_words(rest, line_num)?
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(PipelineError::build(format!(
                "Line {}: {} expects KEY=VALUE, got '{}'",
                line_num, keyword, word
            ))),
        })
        .collect()
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    parse_pairs("ENV", rest, line_num).map(|pairs| Instruction::Env { pairs })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    parse_pairs("LABEL", rest, line_num).map(|pairs| Instruction::Label { pairs })
}

/// Exec form is used verbatim; shell form is wrapped in `/bin/sh -c`.
fn parse_exec(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<String>> {
    require_args(keyword, rest, "an argument", line_num)?;

    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    require_args("EXPOSE", rest, "a port", line_num)?;
    Ok(Instruction::Expose {
        ports: rest.split_whitespace().map(str::to_string).collect(),
    })
}

fn parse_user(rest: &str, line_num: usize) -> Result<Instruction> {
    require_args("USER", rest, "a username", line_num)?;
    Ok(Instruction::User {
        user: rest.split_whitespace().next().unwrap_or(rest).to_string(),
    })
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    require_args("ARG", rest, "a name", line_num)?;

    match rest.split_once('=') {
        Some((name, default)) => Ok(Instruction::Arg {
            name: name.trim().to_string(),
            default: Some(unquote(default)),
        }),
        None => Ok(Instruction::Arg {
            name: rest.trim().to_string(),
            default: None,
        }),
    }
}

// --- Helpers ---

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        PipelineError::build(format!(
            "Line {}: Invalid JSON array '{}': {}",
            line_num, s, e
        ))
    })
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Whitespace split that honours single/double quotes and backslash escapes.
fn split_words(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(PipelineError::build(format!(
            "Line {}: unterminated quote in '{}'",
            line_num, s
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Expand `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR:+alternate}`.
///
/// Unknown variables expand to the empty string; `\$` is a literal dollar.
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                out.push('$');
                chars.next();
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    out.push_str("${");
                    out.push_str(&body);
                    continue;
                }
                out.push_str(&expand_braced(&body, vars));
            }
            '$' if chars
                .peek()
                .map_or(false, |c| c.is_ascii_alphabetic() || *c == '_') =>
            {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(value) = vars.get(&name) {
                    out.push_str(value);
                }
            }
            c => out.push(c),
        }
    }

    out
}

fn expand_braced(body: &str, vars: &BTreeMap<String, String>) -> String {
    if let Some((name, default)) = body.split_once(":-") {
        match vars.get(name) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => substitute(default, vars),
        }
    } else if let Some((name, alternate)) = body.split_once(":+") {
        match vars.get(name) {
            Some(value) if !value.is_empty() => substitute(alternate, vars),
            _ => String::new(),
        }
    } else {
        vars.get(body).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // --- join_continuation_lines ---

    #[test]
    fn test_join_continuation_simple() {
        let input = "COPY a \\\n    b /dst/";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 1);
        assert!(lines[0].1.contains("a b"));
    }

    #[test]
    fn test_join_continuation_keeps_line_numbers() {
        let input = "FROM scratch\nENV A=1 \\\n  B=2\nCMD [\"x\"]";
        let lines = join_continuation_lines(input);
        let starts: Vec<usize> = lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(starts, vec![1, 2, 4]);
    }

    #[test]
    fn test_join_continuation_skips_inner_comments() {
        let input = "ENV A=1 \\\n# note\n    B=2";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].1.contains("note"));
    }

    // --- Dockerfile::parse ---

    #[test]
    fn test_parse_minimal_node_dockerfile() {
        let content = r#"
# syntax=docker/dockerfile:1
ARG NODE_VERSION=20
FROM node:${NODE_VERSION}-alpine AS runtime
WORKDIR /app
COPY package.json server.js ./
ENV NODE_ENV=production PORT=3000
EXPOSE 3000
CMD ["node", "server.js"]
"#;
        let dockerfile = Dockerfile::parse(content).unwrap();
        let keywords: Vec<&str> = dockerfile.instructions.iter().map(|i| i.keyword()).collect();
        assert_eq!(
            keywords,
            vec!["ARG", "FROM", "WORKDIR", "COPY", "ENV", "EXPOSE", "CMD"]
        );
    }

    #[test]
    fn test_parse_empty() {
        assert!(Dockerfile::parse("# only a comment\n\n").is_err());
    }

    #[test]
    fn test_parse_requires_from_first() {
        let err = Dockerfile::parse("COPY a /a\nFROM scratch").unwrap_err();
        assert!(err.to_string().contains("FROM"));
    }

    #[test]
    fn test_parse_unknown_instruction() {
        let err = Dockerfile::parse("FROM scratch\nFROBNICATE now").unwrap_err();
        assert!(err.to_string().contains("Line 2"));
        assert!(err.to_string().contains("FROBNICATE"));
    }

    #[test]
    fn test_parse_ignored_instruction() {
        let dockerfile = Dockerfile::parse("FROM scratch\nVOLUME /data").unwrap();
        assert_eq!(
            dockerfile.instructions[1],
            Instruction::Ignored {
                keyword: "VOLUME".to_string(),
                args: "/data".to_string(),
            }
        );
    }

    // --- parse_from ---

    #[test]
    fn test_parse_from_with_alias() {
        assert_eq!(
            parse_from("golang:1.21 AS builder", 1).unwrap(),
            Instruction::From {
                image: "golang:1.21".to_string(),
                alias: Some("builder".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_from_platform_flag() {
        assert_eq!(
            parse_from("--platform=linux/amd64 scratch", 1).unwrap(),
            Instruction::From {
                image: "scratch".to_string(),
                alias: None,
            }
        );
    }

    #[test]
    fn test_parse_from_garbage() {
        assert!(parse_from("", 1).is_err());
        assert!(parse_from("a b c d", 1).is_err());
    }

    // --- parse_run ---

    #[test]
    fn test_parse_run_json() {
        assert_eq!(
            parse_run(r#"["npm", "ci"]"#, 1).unwrap(),
            Instruction::Run {
                command: "npm ci".to_string(),
            }
        );
    }

    // --- parse_copy / parse_add ---

    #[test]
    fn test_parse_copy_multiple_sources() {
        assert_eq!(
            parse_copy("file1.txt file2.txt /dest/", 1).unwrap(),
            Instruction::Copy {
                src: vec!["file1.txt".to_string(), "file2.txt".to_string()],
                dst: "/dest/".to_string(),
                from: None,
            }
        );
    }

    #[test]
    fn test_parse_copy_from_stage() {
        assert_eq!(
            parse_copy("--from=builder /app/bin /usr/local/bin/", 1).unwrap(),
            Instruction::Copy {
                src: vec!["/app/bin".to_string()],
                dst: "/usr/local/bin/".to_string(),
                from: Some("builder".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_copy_json_form() {
        assert_eq!(
            parse_copy(r#"["my file.txt", "/opt/app/"]"#, 1).unwrap(),
            Instruction::Copy {
                src: vec!["my file.txt".to_string()],
                dst: "/opt/app/".to_string(),
                from: None,
            }
        );
    }

    #[test]
    fn test_parse_copy_ignores_chown() {
        let result = parse_copy("--chown=node:node . /app", 1).unwrap();
        assert!(matches!(result, Instruction::Copy { from: None, .. }));
    }

    #[test]
    fn test_parse_copy_unknown_flag() {
        assert!(parse_copy("--bogus=1 a /b", 1).is_err());
    }

    #[test]
    fn test_parse_copy_single_arg() {
        assert!(parse_copy("onlysource", 1).is_err());
    }

    #[test]
    fn test_parse_add() {
        assert_eq!(
            parse_add("vendor.tar.gz /opt/", 1).unwrap(),
            Instruction::Add {
                src: vec!["vendor.tar.gz".to_string()],
                dst: "/opt/".to_string(),
            }
        );
    }

    // --- parse_env / parse_label ---

    #[test]
    fn test_parse_env_multiple_pairs() {
        assert_eq!(
            parse_env(r#"A=1 MSG="hello world" EMPTY="#, 1).unwrap(),
            Instruction::Env {
                pairs: vec![
                    ("A".to_string(), "1".to_string()),
                    ("MSG".to_string(), "hello world".to_string()),
                    ("EMPTY".to_string(), String::new()),
                ],
            }
        );
    }

    #[test]
    fn test_parse_env_legacy() {
        assert_eq!(
            parse_env("MY_VAR my value", 1).unwrap(),
            Instruction::Env {
                pairs: vec![("MY_VAR".to_string(), "my value".to_string())],
            }
        );
    }

    #[test]
    fn test_parse_env_missing_value() {
        assert!(parse_env("LONELY", 1).is_err());
    }

    #[test]
    fn test_parse_label_quoted() {
        assert_eq!(
            parse_label(r#"org.opencontainers.image.title="My App" version=1.0"#, 1).unwrap(),
            Instruction::Label {
                pairs: vec![
                    ("org.opencontainers.image.title".to_string(), "My App".to_string()),
                    ("version".to_string(), "1.0".to_string()),
                ],
            }
        );
    }

    #[test]
    fn test_split_words_unterminated_quote() {
        assert!(split_words(r#"A="oops"#, 1).is_err());
    }

    // --- parse_exec ---

    #[test]
    fn test_parse_entrypoint_shell() {
        assert_eq!(
            parse_exec("ENTRYPOINT", "/bin/app --listen", 1).unwrap(),
            vec!["/bin/sh", "-c", "/bin/app --listen"]
        );
    }

    #[test]
    fn test_parse_cmd_exec() {
        assert_eq!(
            parse_exec("CMD", r#"["java", "-jar", "app.jar"]"#, 1).unwrap(),
            vec!["java", "-jar", "app.jar"]
        );
    }

    #[test]
    fn test_parse_cmd_bad_json() {
        assert!(parse_exec("CMD", r#"["unterminated"#, 1).is_err());
    }

    // --- misc ---

    #[test]
    fn test_parse_expose_multiple() {
        assert_eq!(
            parse_expose("8080/tcp 9090", 1).unwrap(),
            Instruction::Expose {
                ports: vec!["8080/tcp".to_string(), "9090".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_arg_with_default() {
        assert_eq!(
            parse_arg(r#"GO_VERSION="1.22""#, 1).unwrap(),
            Instruction::Arg {
                name: "GO_VERSION".to_string(),
                default: Some("1.22".to_string()),
            }
        );
    }

    // --- substitute ---

    #[test]
    fn test_substitute_forms() {
        let v = vars(&[("NAME", "web"), ("EMPTY", "")]);
        assert_eq!(substitute("/srv/$NAME/bin", &v), "/srv/web/bin");
        assert_eq!(substitute("${NAME}-1", &v), "web-1");
        assert_eq!(substitute("${MISSING:-fallback}", &v), "fallback");
        assert_eq!(substitute("${EMPTY:-fallback}", &v), "fallback");
        assert_eq!(substitute("${NAME:+set}", &v), "set");
        assert_eq!(substitute("${MISSING:+set}", &v), "");
        assert_eq!(substitute("$MISSING", &v), "");
    }

    #[test]
    fn test_substitute_escapes_and_literals() {
        let v = vars(&[("A", "1")]);
        assert_eq!(substitute(r"\$A", &v), "$A");
        assert_eq!(substitute("cost: $5", &v), "cost: $5");
        assert_eq!(substitute("${A", &v), "${A");
    }
}
