//! Line-oriented spec file parser.
//!
//! A spec is a sequence of directives, one per logical line:
//!
//! ```text
//! # install the web app on top of the base image
//! FROM base:latest
//! PARAMS console=ttyS0 quiet
//! RUN mkdir -p /root/srv
//! RUN cp /.specdir/app /root/srv/app
//! ```
//!
//! Blank lines and `#` comments are skipped; a trailing backslash continues
//! the line.

use std::path::Path;

use crate::error::{KeelError, Result};
use crate::spec::Command;
use crate::types::BuildKey;

/// Parse a spec file into its ordered command list.
pub fn parse_file(path: &Path) -> Result<Vec<Command>> {
    let content = std::fs::read_to_string(path).map_err(|e| KeelError::io(path, e))?;
    parse(path, &content)
}

fn parse(path: &Path, content: &str) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    let mut logical = String::new();
    let mut start_line = 0;

    for (index, raw) in content.lines().enumerate() {
        if logical.is_empty() {
            start_line = index + 1;
        }
        if let Some(prefix) = raw.strip_suffix('\\') {
            logical.push_str(prefix);
            logical.push(' ');
            continue;
        }
        logical.push_str(raw);

        let line = logical.trim().to_string();
        logical.clear();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        commands.push(parse_directive(path, start_line, &line)?);
    }

    if !logical.trim().is_empty() {
        return Err(parse_error(path, start_line, "unterminated line continuation"));
    }
    Ok(commands)
}

fn parse_directive(path: &Path, line: usize, text: &str) -> Result<Command> {
    let (directive, rest) = match text.split_once(|c: char| c.is_whitespace()) {
        Some((directive, rest)) => (directive, rest.trim()),
        None => (text, ""),
    };

    match directive {
        "FROM" => {
            let key = BuildKey::parse(rest)
                .map_err(|e| parse_error(path, line, &format!("FROM: {e}")))?;
            Ok(Command::From(key))
        }
        "PARAMS" => {
            let params: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
            if params.is_empty() {
                return Err(parse_error(path, line, "PARAMS requires at least one parameter"));
            }
            Ok(Command::Params(params))
        }
        "RUN" => {
            if rest.is_empty() {
                return Err(parse_error(path, line, "RUN requires a command"));
            }
            Ok(Command::Run(rest.to_string()))
        }
        other => Err(parse_error(path, line, &format!("unknown directive {other:?}"))),
    }
}

fn parse_error(path: &Path, line: usize, message: &str) -> KeelError {
    KeelError::Parse { path: path.to_path_buf(), line, message: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse_str(content: &str) -> Result<Vec<Command>> {
        parse(&PathBuf::from("test-spec"), content)
    }

    #[test]
    fn test_parse_full_spec() {
        let commands = parse_str(
            "# build the app image\n\
             FROM base:latest\n\
             \n\
             PARAMS console=ttyS0 quiet\n\
             RUN echo hello > /root/etc/motd\n",
        )
        .unwrap();

        assert_eq!(
            commands,
            vec![
                Command::From(BuildKey::parse("base:latest").unwrap()),
                Command::Params(vec!["console=ttyS0".to_string(), "quiet".to_string()]),
                Command::Run("echo hello > /root/etc/motd".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_empty_spec() {
        assert!(parse_str("").unwrap().is_empty());
        assert!(parse_str("# only a comment\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_line_continuation() {
        let commands = parse_str("RUN mkdir -p /root/a \\\n  /root/b\n").unwrap();
        assert_eq!(commands, vec![Command::Run("mkdir -p /root/a    /root/b".to_string())]);
    }

    #[test]
    fn test_parse_from_default_tag() {
        let commands = parse_str("FROM base\n").unwrap();
        let Command::From(key) = &commands[0] else { panic!("expected FROM") };
        assert_eq!(key.to_string(), "base:latest");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_str("COPY a b\n"), Err(KeelError::Parse { line: 1, .. })));
        assert!(matches!(parse_str("RUN\n"), Err(KeelError::Parse { .. })));
        assert!(matches!(parse_str("PARAMS\n"), Err(KeelError::Parse { .. })));
        assert!(matches!(parse_str("FROM bad name\n"), Err(KeelError::Parse { .. })));
        assert!(matches!(
            parse_str("FROM base\nRUN echo\nFROM base\nRUN trailing \\"),
            Err(KeelError::Parse { line: 4, .. })
        ));
    }
}
