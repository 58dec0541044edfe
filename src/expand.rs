//! Variable substitution for rule templates.
//!
//! Two substitution contexts exist with different fan-out semantics:
//!
//! * [`expand_outputs`] resolves the output expressions of a rule. A variable
//!   bound to N values clones the whole realization N times, which is the
//!   mechanism that turns one rule into many tasks.
//! * [`expand_list`] resolves input and command expressions against a task's
//!   already-fixed local scope. A multi-valued variable expands in place into
//!   sibling strings belonging to the same task, never into new tasks.
//!
//! The asymmetry is deliberate; rule files depend on both behaviors.

use std::collections::{BTreeMap, HashMap};

use crate::error::ExpandError;

/// Hard cap on substitution passes over a single expression. Exceeding it
/// means the variable table is self-referential.
pub(crate) const MAX_SUBST_PASSES: usize = 100;

/// Global variable table: name to an ordered sequence of values.
///
/// Seeded with the builtin `.PWD` (the current working directory) and
/// immutable once the rule file is parsed.
#[derive(Debug, Clone, Default)]
pub struct VarTable {
    map: HashMap<String, Vec<String>>,
}

impl VarTable {
    pub fn new() -> Self {
        let mut map = HashMap::new();

        if let Ok(pwd) = std::env::current_dir()
            && let Some(pwd) = pwd.to_str()
        {
            map.insert(".PWD".to_string(), vec![pwd.to_string()]);
        }

        Self { map }
    }

    /// Returns `false` when the name is already taken; the table is
    /// define-once.
    pub(crate) fn define(&mut self, name: &str, values: Vec<String>) -> bool {
        if self.map.contains_key(name) {
            return false;
        }

        self.map.insert(name.to_string(), values);
        true
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.map.get(name).map(Vec::as_slice)
    }
}

/// Per-task local scope created during output expansion; shadows the global
/// table.
pub(crate) type Scope = BTreeMap<String, String>;

/// One surviving (outputs, scope) pair of output expansion. Becomes exactly
/// one task.
#[derive(Debug, Clone)]
pub(crate) struct Realization {
    pub outputs: Vec<String>,
    pub scope: Scope,
    depth: usize,
}

/// A `${NAME}` token located in an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VarRef<'a> {
    pub start: usize,
    pub end: usize,
    pub name: &'a str,
}

pub(crate) fn is_var_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

/// Finds the first `${...}` token whose content is a variable name. Tokens
/// with other content (`<`, `>`, `*...`) belong to the command grammar and
/// are skipped here.
pub(crate) fn find_var_ref(s: &str) -> Option<VarRef<'_>> {
    let bytes = s.as_bytes();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            let close = s[i + 2..].find('}')?;
            let end = i + 2 + close + 1;
            let name = s[i + 2..end - 1].trim();

            if is_var_name(name) {
                return Some(VarRef { start: i, end, name });
            }

            i = end;
        } else {
            i += 1;
        }
    }

    None
}

fn splice(s: &str, start: usize, end: usize, value: &str) -> String {
    let mut out = String::with_capacity(s.len() + value.len());
    out.push_str(&s[..start]);
    out.push_str(value);
    out.push_str(&s[end..]);
    out
}

/// Replaces every token referencing `name`, leaving other tokens intact.
/// Substituted values are not rescanned; callers loop until quiescent.
fn substitute_all(s: &str, name: &str, value: &str) -> String {
    let mut out = String::new();
    let mut cur = s;

    loop {
        match find_var_ref(cur) {
            Some(vr) if vr.name == name => {
                out.push_str(&cur[..vr.start]);
                out.push_str(value);
                cur = &cur[vr.end..];
            }
            Some(vr) => {
                out.push_str(&cur[..vr.end]);
                cur = &cur[vr.end..];
            }
            None => {
                out.push_str(cur);
                break;
            }
        }
    }

    out
}

/// Output-expression substitution with Cartesian fan-out.
///
/// Repeatedly scans the not-yet-finalized realizations for a variable token.
/// A token already bound in the realization's scope is substituted textually
/// in every output. An unbound global variable fans the realization out into
/// one clone per value, binding the variable in each clone. Realization order
/// is deterministic: clones are appended in value declaration order.
pub(crate) fn expand_outputs(
    outputs: &[String],
    vars: &VarTable,
) -> Result<Vec<Realization>, ExpandError> {
    let mut open = vec![Realization {
        outputs: outputs.to_vec(),
        scope: Scope::new(),
        depth: 0,
    }];

    loop {
        let found = open.iter().enumerate().find_map(|(i, r)| {
            r.outputs
                .iter()
                .find_map(|out| find_var_ref(out).map(|vr| (i, vr.name.to_string(), out.clone())))
        });

        let Some((i, name, expr)) = found else {
            break;
        };

        if open[i].depth >= MAX_SUBST_PASSES {
            return Err(ExpandError::CircularReference { expr });
        }

        if let Some(value) = open[i].scope.get(&name).cloned() {
            let r = &mut open[i];
            r.depth += 1;

            for out in &mut r.outputs {
                *out = substitute_all(out, &name, &value);
            }
        } else if let Some(values) = vars.get(&name) {
            let values = values.to_vec();
            let parent = open.remove(i);

            for value in &values {
                let mut child = parent.clone();
                child.depth += 1;
                child.scope.insert(name.clone(), value.clone());

                for out in &mut child.outputs {
                    *out = substitute_all(out, &name, value);
                }

                open.push(child);
            }
        } else {
            return Err(ExpandError::UnknownVariable { name, expr });
        }
    }

    Ok(open)
}

/// Input/command-expression substitution against a fixed local scope.
///
/// A multi-valued global variable expands the expression in place into one
/// sibling string per value; all siblings land in the result list of the same
/// task. Result order follows value declaration order.
pub(crate) fn expand_list(
    exprs: &[String],
    scope: &Scope,
    vars: &VarTable,
) -> Result<Vec<String>, ExpandError> {
    let mut done = Vec::new();

    for expr in exprs {
        let mut stack = vec![(expr.clone(), 0usize)];

        while let Some((cur, depth)) = stack.pop() {
            let Some(vr) = find_var_ref(&cur) else {
                done.push(cur);
                continue;
            };

            if depth >= MAX_SUBST_PASSES {
                return Err(ExpandError::CircularReference { expr: expr.clone() });
            }

            let name = vr.name.to_string();
            let (start, end) = (vr.start, vr.end);

            if let Some(value) = scope.get(&name) {
                stack.push((splice(&cur, start, end, value), depth + 1));
            } else if let Some(values) = vars.get(&name) {
                if values.len() == 1 {
                    stack.push((splice(&cur, start, end, &values[0]), depth + 1));
                } else {
                    // reversed, so the first value is resolved first and the
                    // finished list keeps declaration order
                    for value in values.iter().rev() {
                        stack.push((splice(&cur, start, end, value), depth + 1));
                    }
                }
            } else {
                return Err(ExpandError::UnknownVariable {
                    name,
                    expr: expr.clone(),
                });
            }
        }
    }

    Ok(done)
}
