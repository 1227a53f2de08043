//! C3: the dependency text parser. Takes the single command-line argument
//! `"<components>:<deps>"` and splits it into two independently-tokenized
//! grammars; neither pass shares tokenizer state with the other.
//!
//! Component list grammar: `obj,init;obj,init;...` where `obj` may be
//! prefixed by any number of `*` (scheduler) and `!` (boot-packaged)
//! markers, and may itself carry a `(new=old)` copy directive that is
//! executed immediately (the file at `old` is copied to `new` before
//! parsing continues).
//!
//! Dependency list grammar: `a-b|c|...;d-e|...;...`, read as "component
//! before the `-` depends on every `|`-separated component after it".
//! Each dependency name may be preceded by `[modifier]`.

use std::fs;

use crate::error::{LoaderError, Result};

#[derive(Debug, Clone)]
pub struct ParsedComponent {
    pub name: String,
    pub init_str: String,
    pub is_scheduler: bool,
    pub is_boot_packaged: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedEdge {
    pub from: String,
    pub to: String,
    pub modifier: Option<String>,
}

fn syntax(fragment: &str, reason: &'static str) -> LoaderError {
    LoaderError::Syntax {
        fragment: fragment.to_string(),
        reason,
    }
}

/// Strips leading `*`/`!` markers, returning (scheduler, boot_packaged, rest).
fn strip_markers(mut s: &str) -> (bool, bool, &str) {
    let mut sched = false;
    let mut boot = false;
    loop {
        match s.as_bytes().first() {
            Some(b'*') => {
                sched = true;
                s = &s[1..];
            }
            Some(b'!') => {
                boot = true;
                s = &s[1..];
            }
            _ => break,
        }
    }
    (sched, boot, s)
}

/// Executes a `(new=old)` copy directive if present, returning the name the
/// rest of the pipeline should use (`new` after copying, or the untouched
/// name if there was no directive).
fn apply_copy_directive(field: &str) -> Result<String> {
    let (sched1, boot1, rest) = strip_markers(field);
    let Some(inner) = rest.strip_prefix('(') else {
        return Ok(field.to_string());
    };
    let inner = inner
        .strip_suffix(')')
        .ok_or_else(|| syntax(field, "unterminated '(' copy directive"))?;
    let (new, old) = inner
        .split_once('=')
        .ok_or_else(|| syntax(field, "copy directive must be '(new=old)'"))?;
    let (sched2, boot2, new) = strip_markers(new);
    let _ = (sched1, boot1, sched2, boot2); // markers are stripped at the call site too
    if new.is_empty() || old.is_empty() {
        return Err(syntax(field, "copy directive names must be non-empty"));
    }
    fs::copy(old, new).map_err(|source| LoaderError::Io {
        path: old.into(),
        source,
    })?;
    Ok(new.to_string())
}

/// Parses the `<components>` half: alternating `obj` and `init` fields,
/// `obj` separated from the next pair by `,` and from its own `init` by
/// `;` is wrong — the true delimiters are `,` between `obj` and `init`,
/// and `;` between one pair and the next.
pub fn parse_component_list(text: &str) -> Result<Vec<ParsedComponent>> {
    if text.is_empty() {
        return Err(syntax(text, "empty component list"));
    }

    let mut out = Vec::new();
    for pair in text.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (obj_field, init_str) = pair
            .split_once(',')
            .ok_or_else(|| syntax(pair, "component entry must be 'obj,init'"))?;

        let (is_scheduler, is_boot_packaged, rest) = strip_markers(obj_field);
        let name = if rest.starts_with('(') {
            apply_copy_directive(obj_field)?
        } else {
            rest.to_string()
        };
        if name.is_empty() {
            return Err(syntax(obj_field, "component name must be non-empty"));
        }

        out.push(ParsedComponent {
            name,
            init_str: init_str.to_string(),
            is_scheduler,
            is_boot_packaged,
        });
    }

    if out.is_empty() {
        return Err(syntax(text, "component list has no entries"));
    }
    Ok(out)
}

/// Parses the `<deps>` half into a flat edge list.
pub fn parse_dependencies(text: &str) -> Result<Vec<ParsedEdge>> {
    let mut out = Vec::new();
    for group in text.split(';') {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let (from, rest) = group
            .split_once('-')
            .ok_or_else(|| syntax(group, "dependency group must be 'from-to|to|...'"))?;
        let from = from.trim();
        if from.is_empty() {
            return Err(syntax(group, "dependency group has no dependent component"));
        }

        for dep in rest.split('|') {
            let dep = dep.trim();
            if dep.is_empty() {
                return Err(syntax(group, "empty dependency name"));
            }
            let (modifier, to) = if let Some(body) = dep.strip_prefix('[') {
                let (modifier, to) = body
                    .split_once(']')
                    .ok_or_else(|| syntax(dep, "unterminated '[' modifier"))?;
                (Some(modifier.to_string()), to)
            } else {
                (None, dep)
            };
            if to.is_empty() {
                return Err(syntax(dep, "dependency name must be non-empty"));
            }
            if to == from {
                return Err(syntax(dep, "reflexive dependency is not allowed"));
            }
            out.push(ParsedEdge {
                from: from.to_string(),
                to: to.to_string(),
                modifier,
            });
        }
    }
    Ok(out)
}

/// Splits the single CLI argument on its first `:` and parses both halves.
pub fn parse_spec(text: &str) -> Result<(Vec<ParsedComponent>, Vec<ParsedEdge>)> {
    let (components, deps) = text
        .split_once(':')
        .ok_or_else(|| syntax(text, "expected '<components>:<deps>'"))?;
    let components = parse_component_list(components)?;
    let deps = parse_dependencies(deps)?;
    Ok((components, deps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_component_list() {
        let parsed = parse_component_list("a.o,init_a;b.o,init_b").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "a.o");
        assert_eq!(parsed[0].init_str, "init_a");
        assert!(!parsed[0].is_scheduler);
        assert_eq!(parsed[1].name, "b.o");
    }

    #[test]
    fn recognizes_scheduler_and_boot_markers() {
        let parsed = parse_component_list("*!sched.o,x").unwrap();
        assert!(parsed[0].is_scheduler);
        assert!(parsed[0].is_boot_packaged);
        assert_eq!(parsed[0].name, "sched.o");
    }

    #[test]
    fn copy_directive_copies_the_file_and_names_the_new_path() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("orig.o");
        fs::write(&old, b"original bytes").unwrap();
        let new = dir.path().join("copy.o");

        let field = format!("({}={})", new.display(), old.display());
        let parsed = parse_component_list(&format!("{field},x")).unwrap();

        assert_eq!(parsed[0].name, new.display().to_string());
        assert_eq!(fs::read(&new).unwrap(), b"original bytes");
    }

    #[test]
    fn two_copies_of_the_same_object_get_distinct_registry_names() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("orig.o");
        fs::write(&old, b"x").unwrap();
        let new1 = dir.path().join("copy1.o");
        let new2 = dir.path().join("copy2.o");

        let text = format!(
            "({}={}),init1;({}={}),init2",
            new1.display(),
            old.display(),
            new2.display(),
            old.display()
        );
        let parsed = parse_component_list(&text).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_ne!(parsed[0].name, parsed[1].name);
    }

    #[test]
    fn parses_dependency_groups_with_modifiers() {
        let edges = parse_dependencies("a-b|[mod]c;d-e").unwrap();
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].from, "a");
        assert_eq!(edges[0].to, "b");
        assert!(edges[0].modifier.is_none());
        assert_eq!(edges[1].to, "c");
        assert_eq!(edges[1].modifier.as_deref(), Some("mod"));
        assert_eq!(edges[2].from, "d");
        assert_eq!(edges[2].to, "e");
    }

    #[test]
    fn rejects_reflexive_dependency() {
        let err = parse_dependencies("a-a").unwrap_err();
        assert!(matches!(err, LoaderError::Syntax { .. }));
    }

    #[test]
    fn rejects_unterminated_modifier() {
        let err = parse_dependencies("a-[mod c").unwrap_err();
        assert!(matches!(err, LoaderError::Syntax { .. }));
    }

    #[test]
    fn rejects_missing_colon_in_full_spec() {
        let err = parse_spec("a.o,x;b.o,y").unwrap_err();
        assert!(matches!(err, LoaderError::Syntax { .. }));
    }
}
