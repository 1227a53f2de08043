//! C4: the dependency resolver. Matches each component's undefined symbols
//! against the exports of its declared dependencies, appends transparent
//! capabilities for anything declared-but-unresolved, and validates the
//! resulting graph is a DAG.

use crate::consts::{fault_handler_num, SCHED_CREATE_FN};
use crate::error::{LoaderError, Result};
use crate::object::ExportedSymbol;
use crate::registry::{ComponentId, Registry};

/// A symbol transparently resolved without an explicit dependency edge:
/// either a fault handler or the scheduler's thread-creation entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparentKind {
    Fault,
    Other,
}

fn transparent_kind(name: &str) -> Option<TransparentKind> {
    if name == SCHED_CREATE_FN {
        return Some(TransparentKind::Other);
    }
    if fault_handler_num(name).is_some() {
        return Some(TransparentKind::Fault);
    }
    None
}

/// Looks for `name` (honoring a dependency's modifier prefix) among an
/// exporter's exported symbols.
fn exported_match<'a>(
    name: &str,
    modifier: Option<&str>,
    exported: &'a [ExportedSymbol],
) -> Option<usize> {
    for (idx, sym) in exported.iter().enumerate() {
        if sym.name == name {
            return Some(idx);
        }
        if let Some(m) = modifier {
            if let Some(stripped) = name.strip_prefix(m) {
                if stripped == sym.name {
                    return Some(idx);
                }
            }
        }
    }
    None
}

/// Resolves every undefined symbol in every component against its declared
/// dependencies, in declaration order. A dependency is "resolved" once any
/// one of the symbols it exports has matched.
pub fn resolve_symbols(registry: &mut Registry) -> Result<()> {
    let ids: Vec<ComponentId> = registry.ids().collect();

    for id in ids.clone() {
        let num_undef = registry.get(id).undefined.len();
        let num_deps = registry.get(id).dependencies.len();
        let mut dep_resolved = vec![false; num_deps];

        for u in 0..num_undef {
            let symbol_name = registry.get(id).undefined[u].name.clone();
            let mut found: Option<(usize, usize)> = None;

            for (dep_idx, dep) in registry.get(id).dependencies.iter().enumerate() {
                let target = dep.target;
                let modifier = dep.modifier.clone();
                let exported = &registry.get(target).exported;
                if let Some(exp_idx) =
                    exported_match(&symbol_name, modifier.as_deref(), exported)
                {
                    found = Some((dep_idx, exp_idx));
                    break;
                }
            }

            match found {
                Some((dep_idx, exp_idx)) => {
                    dep_resolved[dep_idx] = true;
                    let component = registry.get_mut(id);
                    component.undefined[u].exporter_dep = Some(dep_idx);
                    component.undefined[u].exported_index = Some(exp_idx);
                    component.dependencies[dep_idx].resolved = true;
                }
                None => {
                    return Err(LoaderError::Resolution {
                        component: registry.get(id).name.clone(),
                        symbol: symbol_name,
                    });
                }
            }
        }

        // Dependencies with no symbol matched yet may still be satisfied
        // transparently: any export of theirs that names a fault handler or
        // the scheduler's create-thread entry is wired in automatically.
        for (dep_idx, dep) in registry.get(id).dependencies.iter().enumerate() {
            if dep_resolved[dep_idx] {
                continue;
            }
            let target = dep.target;
            let candidates: Vec<(usize, String)> = registry
                .get(target)
                .exported
                .iter()
                .enumerate()
                .filter_map(|(i, s)| transparent_kind(&s.name).map(|_| (i, s.name.clone())))
                .collect();

            for (exp_idx, name) in candidates {
                let component = registry.get_mut(id);
                if component.undefined.iter().any(|u| u.name == name) {
                    continue;
                }
                component.undefined.push(crate::object::UndefinedSymbol {
                    name,
                    addr: 0,
                    exporter_dep: Some(dep_idx),
                    exported_index: Some(exp_idx),
                });
                component.dependencies[dep_idx].resolved = true;
                dep_resolved[dep_idx] = true;
            }
        }

        for (dep_idx, resolved) in dep_resolved.iter().enumerate() {
            if !resolved {
                let dep_target = registry.get(id).dependencies[dep_idx].target;
                log::warn!(
                    "dependency {}-{} is not creating a capability",
                    registry.get(id).name,
                    registry.get(dep_target).name
                );
            }
        }
    }

    Ok(())
}

fn rec_verify_dag(
    registry: &Registry,
    id: ComponentId,
    depth: i32,
    max_depth: i32,
    depths: &mut [i32],
) -> Result<()> {
    if depth > max_depth {
        return Err(LoaderError::Cycle {
            component: registry.get(id).name.clone(),
        });
    }
    if depth > depths[id] {
        depths[id] = depth;
    }
    for dep in &registry.get(id).dependencies {
        rec_verify_dag(registry, dep.target, depth + 1, max_depth, depths)?;
    }
    Ok(())
}

/// Verifies the dependency graph has no cycles, and records each
/// component's maximum depth from any root. `O(n^2 * e)`, matching the
/// textbook approach of bounding recursion depth by component count rather
/// than tracking a visited set, since component counts here are small.
pub fn verify_dag(registry: &mut Registry) -> Result<()> {
    let count = registry.len() as i32;
    let ids: Vec<ComponentId> = registry.ids().collect();
    let mut depths = vec![-1; ids.len()];

    for id in &ids {
        rec_verify_dag(registry, *id, 0, count, &mut depths)?;
    }

    for id in ids {
        registry.get_mut(id).depth = depths[id];
    }
    Ok(())
}
