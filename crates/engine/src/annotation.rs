// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Extraction of breakpoint directives from annotated test sources.
//!
//! A directive is a comment starting with [`DIRECTIVE_MARKER`] followed by a
//! comma-separated list of `command[.variable]` items:
//!
//! ```text
//! c = b ^ a; //$chc.c
//! c = 0;     //$br, chc.c, ch.a, ch.b
//! return 0;  //$bre
//! ```
//!
//! The vocabulary is closed: only the keywords of [`BreakpointCommand`] are
//! accepted and anything else is a configuration error.

use std::{fs, path::Path};

use c2t_common::{BreakpointCommand, BreakpointSpec};
use tracing::debug;

use crate::{C2tError, C2tResult};

/// Marker introducing a directive comment.
pub const DIRECTIVE_MARKER: &str = "//$";

/// Parse every directive in `source`, in line order.
pub fn parse_directives(source: &str) -> C2tResult<Vec<BreakpointSpec>> {
    let mut specs = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let line = u32::try_from(index + 1)
            .map_err(|_| C2tError::Config("source has too many lines".into()))?;
        let Some((_, directive)) = text.split_once(DIRECTIVE_MARKER) else {
            continue;
        };
        for item in directive.split(',') {
            specs.push(parse_item(line, item.trim())?);
        }
    }
    Ok(specs)
}

/// Parse the directives of the source file at `path`.
pub fn parse_file(path: &Path) -> C2tResult<Vec<BreakpointSpec>> {
    let source = fs::read_to_string(path)?;
    let specs = parse_directives(&source)
        .map_err(|e| C2tError::Config(format!("{}: {}", path.display(), strip_kind(&e))))?;
    debug!(path = %path.display(), directives = specs.len(), "Parsed test directives");
    Ok(specs)
}

fn parse_item(line: u32, item: &str) -> C2tResult<BreakpointSpec> {
    if item.is_empty() {
        return Err(C2tError::Config(format!("line {line}: empty directive")));
    }
    let (keyword, variable) = match item.split_once('.') {
        Some((keyword, variable)) => (keyword.trim(), Some(variable.trim())),
        None => (item, None),
    };
    let command: BreakpointCommand =
        keyword.parse().map_err(|e| C2tError::Config(format!("line {line}: {e}")))?;

    let mut spec = BreakpointSpec::new(line, command);
    if let Some(variable) = variable {
        if !is_identifier(variable) {
            return Err(C2tError::Config(format!(
                "line {line}: `{variable}` is not a variable name"
            )));
        }
        if !command.captures_variables() {
            return Err(C2tError::Config(format!(
                "line {line}: `{command}` does not take a variable"
            )));
        }
        spec = spec.with_variable(variable);
    }
    Ok(spec)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn strip_kind(err: &C2tError) -> String {
    match err {
        C2tError::Config(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BreakpointCommand::*;

    #[test]
    fn test_single_directives() {
        let source = "int a;\nc = b - a; //$br\nreturn 0; //$bre\n";
        let specs = parse_directives(source).unwrap();
        assert_eq!(specs, vec![BreakpointSpec::new(2, Break), BreakpointSpec::new(3, BreakEnd)]);
    }

    #[test]
    fn test_combined_directives_keep_order() {
        let specs = parse_directives("c = 0; //$br, chc.c, ch.a, ch.b").unwrap();
        assert_eq!(
            specs,
            vec![
                BreakpointSpec::new(1, Break),
                BreakpointSpec::new(1, CycleDump).with_variable("c"),
                BreakpointSpec::new(1, Dump).with_variable("a"),
                BreakpointSpec::new(1, Dump).with_variable("b"),
            ]
        );
    }

    #[test]
    fn test_dump_without_variable() {
        let specs = parse_directives("x; //$ch\ny; //$ brc ").unwrap();
        assert_eq!(specs, vec![BreakpointSpec::new(1, Dump), BreakpointSpec::new(2, Cycle)]);
    }

    #[test]
    fn test_unknown_directive_is_config_error() {
        let err = parse_directives("a;\nb; //$print(a)\n").unwrap_err();
        assert!(matches!(&err, C2tError::Config(msg) if msg.starts_with("line 2:")), "{err}");
    }

    #[test]
    fn test_rejects_bad_variables() {
        assert!(parse_directives("//$ch.1a").is_err());
        assert!(parse_directives("//$ch.a+b").is_err());
        assert!(parse_directives("//$br.c").is_err());
        assert!(parse_directives("//$br,").is_err());
    }

    #[test]
    fn test_plain_comments_are_ignored() {
        let source = "// breakpoint lives on the first iteration\n/* $br */\nc = 1;";
        assert!(parse_directives(source).unwrap().is_empty());
    }

    #[test]
    fn test_parse_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.c");
        fs::write(&path, "x; //$nope").unwrap();
        let err = parse_file(&path).unwrap_err().to_string();
        assert!(err.contains("bad.c"));
        assert!(err.contains("line 1"));
    }
}
