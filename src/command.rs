//! Command-token grammar, applied per command after input/output resolution.
//!
//! Tokens resolve against the task's concrete file lists and the variable
//! tables:
//!
//! * `$<` / `${<}`: all input paths, space-joined
//! * `${<N}`: the Nth input path, 0-indexed
//! * `$>` / `${>}` / `${>N}`: analogous for outputs
//! * `${*SEP*NAME}`: NAME's values joined with the literal separator SEP
//! * `${NAME}`: local scalar, else global values space-joined
//!
//! Substitution is replace-and-rescan so variables may expand to further
//! tokens; a hard pass cap guards against circular references. Tokens that
//! fit none of the forms are left in the command verbatim.

use crate::error::ExpandError;
use crate::expand::{MAX_SUBST_PASSES, Scope, VarTable, is_var_name};

/// Resolves one command template into an argument vector. Returns an empty
/// vector for an all-whitespace command; callers drop those.
pub(crate) fn resolve_argv(
    template: &str,
    inputs: &[&str],
    outputs: &[&str],
    scope: &Scope,
    vars: &VarTable,
) -> Result<Vec<String>, ExpandError> {
    let mut cmd = template.to_string();
    let mut passes = 0;

    while let Some((start, end, value)) = next_token(&cmd, template, inputs, outputs, scope, vars)?
    {
        passes += 1;
        if passes > MAX_SUBST_PASSES {
            return Err(ExpandError::CircularReference {
                expr: template.to_string(),
            });
        }

        let mut next = String::with_capacity(cmd.len() + value.len());
        next.push_str(&cmd[..start]);
        next.push_str(&value);
        next.push_str(&cmd[end..]);
        cmd = next;
    }

    Ok(cmd.split_whitespace().map(str::to_string).collect())
}

fn next_token(
    cmd: &str,
    template: &str,
    inputs: &[&str],
    outputs: &[&str],
    scope: &Scope,
    vars: &VarTable,
) -> Result<Option<(usize, usize, String)>, ExpandError> {
    let bytes = cmd.as_bytes();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }

        match bytes[i + 1] {
            b'<' => return Ok(Some((i, i + 2, inputs.join(" ")))),
            b'>' => return Ok(Some((i, i + 2, outputs.join(" ")))),
            b'{' => {
                let Some(close) = cmd[i + 2..].find('}') else {
                    // unterminated token, leave verbatim
                    i += 2;
                    continue;
                };
                let end = i + 2 + close + 1;
                let content = &cmd[i + 2..end - 1];

                match resolve_braced(content, template, inputs, outputs, scope, vars)? {
                    Some(value) => return Ok(Some((i, end, value))),
                    None => i = end,
                }
            }
            _ => i += 1,
        }
    }

    Ok(None)
}

fn resolve_braced(
    content: &str,
    template: &str,
    inputs: &[&str],
    outputs: &[&str],
    scope: &Scope,
    vars: &VarTable,
) -> Result<Option<String>, ExpandError> {
    let content = content.trim();

    if let Some(rest) = content.strip_prefix('<') {
        return resolve_file_ref(rest, "input", inputs, template);
    }

    if let Some(rest) = content.strip_prefix('>') {
        return resolve_file_ref(rest, "output", outputs, template);
    }

    if let Some(inner) = content.strip_prefix('*') {
        let Some(sep_end) = inner.find('*') else {
            return Ok(None);
        };
        let sep = &inner[..sep_end];
        let name = inner[sep_end + 1..].trim();

        if !is_var_name(name) {
            return Ok(None);
        }

        return match (scope.get(name), vars.get(name)) {
            (Some(value), _) => Ok(Some(value.clone())),
            (None, Some(values)) => Ok(Some(values.join(sep))),
            (None, None) => Err(ExpandError::UnknownVariable {
                name: name.to_string(),
                expr: template.to_string(),
            }),
        };
    }

    if is_var_name(content) {
        return match (scope.get(content), vars.get(content)) {
            (Some(value), _) => Ok(Some(value.clone())),
            (None, Some(values)) => Ok(Some(values.join(" "))),
            (None, None) => Err(ExpandError::UnknownVariable {
                name: content.to_string(),
                expr: template.to_string(),
            }),
        };
    }

    Ok(None)
}

fn resolve_file_ref(
    rest: &str,
    kind: &'static str,
    paths: &[&str],
    template: &str,
) -> Result<Option<String>, ExpandError> {
    let rest = rest.trim();

    if rest.is_empty() {
        return Ok(Some(paths.join(" ")));
    }

    let Ok(index) = rest.parse::<usize>() else {
        return Ok(None);
    };

    match paths.get(index) {
        Some(path) => Ok(Some(path.to_string())),
        None => Err(ExpandError::IndexOutOfRange {
            kind,
            index,
            len: paths.len(),
            expr: template.to_string(),
        }),
    }
}
