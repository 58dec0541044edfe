//! Rule file parsing.
//!
//! A rule file is a sequence of variable definitions, rule lines and
//! tab-indented command lines:
//!
//! ```text
//! SUBJ = 01 02 03
//!
//! out/${SUBJ}.dat : in/${SUBJ}.raw    # one task per subject
//! 	convert ${<0} ${>0}
//! ```
//!
//! Backslash-newline joins physical lines and `#` starts a comment. The
//! first `:` of a rule line must not be followed by `//`, so URL-like paths
//! never read as rule separators.

use crate::error::ParseError;
use crate::expand::{VarTable, is_var_name};
use crate::graph::Rule;

/// Parses cleaned rule file text into rule templates and the global variable
/// table.
pub(crate) fn parse(text: &str) -> Result<(Vec<Rule>, VarTable), ParseError> {
    let mut vars = VarTable::new();
    let mut rules = Vec::new();
    let mut current: Option<Rule> = None;

    for (line_no, line) in clean_lines(text) {
        // command lines attach to the rule that is still open
        if let Some(cmd) = line.strip_prefix('\t') {
            let Some(rule) = current.as_mut() else {
                return Err(ParseError::OrphanCommand {
                    line: line_no,
                    text: line,
                });
            };

            let cmd = cmd.trim();
            if !cmd.is_empty() {
                rule.commands.push(cmd.to_string());
            }
            continue;
        }

        // anything else closes it
        if let Some(rule) = current.take() {
            rules.push(rule);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some((outputs, inputs)) = split_rule(trimmed) {
            current = Some(Rule {
                outputs,
                inputs,
                commands: Vec::new(),
                line: line_no,
            });
        } else if let Some((name, values)) = split_variable(trimmed) {
            if name.is_empty() {
                return Err(ParseError::EmptyName { line: line_no });
            }
            if !vars.define(name, values) {
                return Err(ParseError::Redefined {
                    line: line_no,
                    name: name.to_string(),
                });
            }
        } else {
            return Err(ParseError::Malformed {
                line: line_no,
                text: trimmed.to_string(),
            });
        }
    }

    if let Some(rule) = current.take() {
        rules.push(rule);
    }

    Ok((rules, vars))
}

/// Joins backslash-continued lines, strips comments and trailing whitespace.
/// Yields 1-based line numbers pointing at the first physical line of each
/// logical line.
fn clean_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut joined = String::new();
    let mut joined_at = 0;

    for (i, line) in text.lines().enumerate() {
        if let Some(head) = line.strip_suffix('\\') {
            if joined.is_empty() {
                joined_at = i + 1;
            }
            joined.push_str(head);
            continue;
        }

        let start = if joined.is_empty() { i + 1 } else { joined_at };
        joined.push_str(line);

        let mut logical = std::mem::take(&mut joined);
        if let Some(hash) = logical.find('#') {
            logical.truncate(hash);
        }
        logical.truncate(logical.trim_end().len());

        lines.push((start, logical));
    }

    // a file ending in a continuation still yields its partial line
    if !joined.is_empty() {
        if let Some(hash) = joined.find('#') {
            joined.truncate(hash);
        }
        joined.truncate(joined.trim_end().len());
        lines.push((joined_at, joined));
    }

    lines
}

/// `OUTPUT... : INPUT...` split at the first colon, unless that colon opens
/// a `://` sequence.
fn split_rule(line: &str) -> Option<(Vec<String>, Vec<String>)> {
    let colon = line.find(':')?;
    if line[colon + 1..].starts_with("//") {
        return None;
    }

    let outputs = line[..colon].split_whitespace().map(str::to_string).collect();
    let inputs = line[colon + 1..]
        .split_whitespace()
        .map(str::to_string)
        .collect();

    Some((outputs, inputs))
}

/// `NAME = VALUE...`; a definition with no values binds a single empty
/// string.
fn split_variable(line: &str) -> Option<(&str, Vec<String>)> {
    let eq = line.find('=')?;
    let name = line[..eq].trim();

    if !name.is_empty() && !is_var_name(name) {
        return None;
    }

    let mut values: Vec<String> = line[eq + 1..]
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        values.push(String::new());
    }

    Some((name, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_collect_their_command_lines() {
        let (rules, _) = parse("a b : c d\n\tcmd one\n\tcmd two\n").unwrap();

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].outputs, ["a", "b"]);
        assert_eq!(rules[0].inputs, ["c", "d"]);
        assert_eq!(rules[0].commands, ["cmd one", "cmd two"]);
    }

    #[test]
    fn rule_open_at_eof_is_kept() {
        let (rules, _) = parse("out : in\n\tcp in out").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].commands, ["cp in out"]);
    }

    #[test]
    fn continuations_and_comments_are_cleaned() {
        let text = "FILES = a \\\nb c   # trailing comment\nout : in # another\n\tcp in out\n";
        let (rules, vars) = parse(text).unwrap();

        assert_eq!(vars.get("FILES").unwrap(), ["a", "b", "c"]);
        assert_eq!(rules[0].inputs, ["in"]);
        assert_eq!(rules[0].commands, ["cp in out"]);
    }

    #[test]
    fn url_colons_do_not_start_rules() {
        let err = parse("http://example.org/file\n").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 1, .. }));

        // but URLs are fine on the input side
        let (rules, _) = parse("out : http://example.org/file\n").unwrap();
        assert_eq!(rules[0].inputs, ["http://example.org/file"]);
    }

    #[test]
    fn variable_redefinition_is_an_error() {
        let err = parse("A = 1\nA = 2\n").unwrap_err();
        assert!(matches!(err, ParseError::Redefined { line: 2, name } if name == "A"));
    }

    #[test]
    fn pwd_cannot_be_redefined() {
        let err = parse(".PWD = elsewhere\n").unwrap_err();
        assert!(matches!(err, ParseError::Redefined { .. }));
    }

    #[test]
    fn command_without_a_rule_is_an_error() {
        let err = parse("\tcp a b\n").unwrap_err();
        assert!(matches!(err, ParseError::OrphanCommand { line: 1, .. }));
    }

    #[test]
    fn unrecognized_lines_are_errors_with_line_numbers() {
        let err = parse("A = 1\n\njust some words\n").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 3, .. }));
    }

    #[test]
    fn empty_definition_binds_one_empty_value() {
        let (_, vars) = parse("EMPTY =\n").unwrap();
        assert_eq!(vars.get("EMPTY").unwrap(), [""]);
    }

    #[test]
    fn blank_lines_separate_rules() {
        let (rules, _) = parse("a : b\n\tone\n\nc : d\n\ttwo\n").unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].commands, ["one"]);
        assert_eq!(rules[1].commands, ["two"]);
        assert_eq!(rules[1].line, 4);
    }
}
