// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash command parsing.
//!
//! Supported syntax:
//!   /command
//!   /command arg1 arg2
//!   /command "arg with spaces"
//!
//! Parsing is pure; dispatch lives in the app.

/// A submitted input line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Plain text for the model.
    Text(String),
    /// `/name arg…`.
    Command { name: String, args: Vec<String> },
    /// Nothing to do.
    Empty,
}

/// Classify a submitted line.  Leading `/` makes it a command; quoted
/// arguments keep their spaces.
pub fn parse(input: &str) -> ParsedLine {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ParsedLine::Empty;
    }
    let Some(body) = trimmed.strip_prefix('/') else {
        return ParsedLine::Text(trimmed.to_string());
    };
    let mut tokens = tokenise(body);
    if tokens.is_empty() {
        return ParsedLine::Empty;
    }
    let name = tokens.remove(0);
    ParsedLine::Command { name, args: tokens }
}

/// Split a command body on whitespace, respecting double-quoted strings and
/// collapsing runs of spaces.  Quotes are stripped from the tokens.
pub fn tokenise(s: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut had_quotes = false;

    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                had_quotes = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || had_quotes {
                    tokens.push(std::mem::take(&mut current));
                    had_quotes = false;
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || had_quotes {
        tokens.push(current);
    }
    tokens
}

/// Arguments of `/fork`: optional `--model <spec>` followed by a free-form
/// prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkArgs {
    pub model_spec: Option<String>,
    pub prompt: Option<String>,
}

pub fn parse_fork_args(args: &[String]) -> Result<ForkArgs, String> {
    let mut out = ForkArgs::default();
    let mut rest = args;
    if rest.first().map(String::as_str) == Some("--model") {
        match rest.get(1) {
            Some(spec) => {
                out.model_spec = Some(spec.clone());
                rest = &rest[2..];
            }
            None => return Err("--model requires a value".into()),
        }
    }
    if !rest.is_empty() {
        out.prompt = Some(rest.join(" "));
    }
    Ok(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("hello world"), ParsedLine::Text("hello world".into()));
    }

    #[test]
    fn empty_and_whitespace_lines_are_empty() {
        assert_eq!(parse(""), ParsedLine::Empty);
        assert_eq!(parse("   "), ParsedLine::Empty);
        assert_eq!(parse("/"), ParsedLine::Empty);
    }

    #[test]
    fn bare_command_has_no_args() {
        assert_eq!(
            parse("/clear"),
            ParsedLine::Command { name: "clear".into(), args: vec![] }
        );
    }

    #[test]
    fn command_with_args() {
        assert_eq!(
            parse("/kill ab12"),
            ParsedLine::Command { name: "kill".into(), args: vec!["ab12".into()] }
        );
    }

    #[test]
    fn quoted_arguments_keep_spaces() {
        assert_eq!(
            parse(r#"/mark "before refactor""#),
            ParsedLine::Command {
                name: "mark".into(),
                args: vec!["before refactor".into()]
            }
        );
    }

    #[test]
    fn tokenise_collapses_runs_of_spaces() {
        assert_eq!(tokenise("a   b    c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn tokenise_empty_quotes_yield_empty_token() {
        assert_eq!(tokenise(r#"mark """#), vec!["mark", ""]);
    }

    #[test]
    fn fork_args_model_and_prompt() {
        let args: Vec<String> = vec!["--model".into(), "openai/gpt-5/low".into(), "do".into(), "it".into()];
        let parsed = parse_fork_args(&args).unwrap();
        assert_eq!(parsed.model_spec.as_deref(), Some("openai/gpt-5/low"));
        assert_eq!(parsed.prompt.as_deref(), Some("do it"));
    }

    #[test]
    fn fork_args_prompt_only() {
        let args: Vec<String> = vec!["summarize".into(), "this".into()];
        let parsed = parse_fork_args(&args).unwrap();
        assert_eq!(parsed.model_spec, None);
        assert_eq!(parsed.prompt.as_deref(), Some("summarize this"));
    }

    #[test]
    fn fork_args_missing_model_value_is_an_error() {
        let args: Vec<String> = vec!["--model".into()];
        assert!(parse_fork_args(&args).is_err());
    }

    #[test]
    fn fork_args_empty_is_default() {
        let parsed = parse_fork_args(&[]).unwrap();
        assert_eq!(parsed, ForkArgs::default());
    }
}
