//! C7: the capability builder. Turns each resolved undefined symbol into
//! an invocation capability record naming the client stub, server stub,
//! and server entry point it connects, plus a fault-handler tag when the
//! symbol is a transparent fault capability.
//!
//! Boot-packaged components get their capabilities written straight into
//! their cobj's capability table (C8); host-installed components get
//! theirs installed through the kernel control surface (C9). Building the
//! records themselves is the same either way, which is why this module
//! does not touch either target.

use crate::consts::{fault_handler_num, CAP_CLIENT_STUB_DEFAULT, CAP_CLIENT_STUB_POSTPEND, CAP_SERVER_STUB_POSTPEND, FAULT_NUM_NONE};
use crate::error::{LoaderError, Result};
use crate::registry::{ComponentId, Registry};

#[derive(Debug, Clone)]
pub struct CapabilityInfo {
    /// Position of the satisfied symbol within the caller's undefined-symbol
    /// list; this is also the slot number the kernel assigns the capability.
    pub rel_offset: u32,
    pub client_stub: String,
    pub server_stub: String,
    pub server_fn: String,
    pub owner: ComponentId,
    pub target: ComponentId,
    /// `FAULT_NUM_NONE` unless `server_fn` names a fault handler.
    pub fault_handler: u32,
}

fn find_export(registry: &Registry, id: ComponentId, name: &str) -> Option<String> {
    registry
        .get(id)
        .exported
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.name.clone())
}

/// Builds every capability record for one component's already-resolved
/// undefined symbols.
pub fn build_capabilities(registry: &Registry, id: ComponentId) -> Result<Vec<CapabilityInfo>> {
    let component = registry.get(id);
    let mut caps = Vec::with_capacity(component.undefined.len());

    for (rel_offset, undef) in component.undefined.iter().enumerate() {
        let dep_idx = undef.exporter_dep.ok_or_else(|| LoaderError::Resolution {
            component: component.name.clone(),
            symbol: undef.name.clone(),
        })?;
        let exp_idx = undef.exported_index.ok_or_else(|| LoaderError::Resolution {
            component: component.name.clone(),
            symbol: undef.name.clone(),
        })?;
        let target = component.dependencies[dep_idx].target;
        let server_fn = registry.get(target).exported[exp_idx].name.clone();

        let client_stub_name = format!("{}{}", undef.name, CAP_CLIENT_STUB_POSTPEND);
        let client_stub = find_export(registry, id, &client_stub_name)
            .or_else(|| find_export(registry, id, CAP_CLIENT_STUB_DEFAULT))
            .ok_or_else(|| LoaderError::Resolution {
                component: component.name.clone(),
                symbol: format!("client stub for {}", undef.name),
            })?;

        let server_stub_name = format!("{server_fn}{CAP_SERVER_STUB_POSTPEND}");
        let server_stub = find_export(registry, target, &server_stub_name).ok_or_else(|| {
            LoaderError::Resolution {
                component: component.name.clone(),
                symbol: server_stub_name.clone(),
            }
        })?;

        let fault_handler = fault_handler_num(&server_fn).unwrap_or(FAULT_NUM_NONE);

        caps.push(CapabilityInfo {
            rel_offset: rel_offset as u32,
            client_stub,
            server_stub,
            server_fn,
            owner: id,
            target,
            fault_handler,
        });
    }

    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ExportedSymbol, UndefinedSymbol};
    use crate::registry::{Component, Dependency};
    use std::path::PathBuf;

    fn blank(name: &str) -> Component {
        Component::new(name.to_string(), PathBuf::from(name), String::new())
    }

    #[test]
    fn builds_capability_with_dedicated_client_stub() {
        let mut reg = Registry::new();
        let mut server = blank("b.o");
        server.exported.push(ExportedSymbol {
            name: "widget_get".into(),
            addr: 0,
        });
        server.exported.push(ExportedSymbol {
            name: "widget_get_inv".into(),
            addr: 0,
        });
        let b = reg.insert(server);

        let mut client = blank("a.o");
        client.exported.push(ExportedSymbol {
            name: "widget_get_call".into(),
            addr: 0,
        });
        client.undefined.push(UndefinedSymbol {
            name: "widget_get".into(),
            addr: 0,
            exporter_dep: Some(0),
            exported_index: Some(0),
        });
        client.dependencies.push(Dependency {
            target: b,
            modifier: None,
            resolved: true,
        });
        let a = reg.insert(client);

        let caps = build_capabilities(&reg, a).unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].client_stub, "widget_get_call");
        assert_eq!(caps[0].server_stub, "widget_get_inv");
        assert_eq!(caps[0].fault_handler, FAULT_NUM_NONE);
    }

    #[test]
    fn falls_back_to_default_client_stub() {
        let mut reg = Registry::new();
        let mut server = blank("b.o");
        server.exported.push(ExportedSymbol {
            name: "widget_get".into(),
            addr: 0,
        });
        server.exported.push(ExportedSymbol {
            name: "widget_get_inv".into(),
            addr: 0,
        });
        let b = reg.insert(server);

        let mut client = blank("a.o");
        client.exported.push(ExportedSymbol {
            name: CAP_CLIENT_STUB_DEFAULT.into(),
            addr: 0,
        });
        client.undefined.push(UndefinedSymbol {
            name: "widget_get".into(),
            addr: 0,
            exporter_dep: Some(0),
            exported_index: Some(0),
        });
        client.dependencies.push(Dependency {
            target: b,
            modifier: None,
            resolved: true,
        });
        let a = reg.insert(client);

        let caps = build_capabilities(&reg, a).unwrap();
        assert_eq!(caps[0].client_stub, CAP_CLIENT_STUB_DEFAULT);
    }

    #[test]
    fn tags_fault_handler_capabilities() {
        let mut reg = Registry::new();
        let mut server = blank("b.o");
        server.exported.push(ExportedSymbol {
            name: "fault_page_fault_handler".into(),
            addr: 0,
        });
        server.exported.push(ExportedSymbol {
            name: "fault_page_fault_handler_inv".into(),
            addr: 0,
        });
        let b = reg.insert(server);

        let mut client = blank("a.o");
        client.exported.push(ExportedSymbol {
            name: CAP_CLIENT_STUB_DEFAULT.into(),
            addr: 0,
        });
        client.undefined.push(UndefinedSymbol {
            name: "fault_page_fault_handler".into(),
            addr: 0,
            exporter_dep: Some(0),
            exported_index: Some(0),
        });
        client.dependencies.push(Dependency {
            target: b,
            modifier: None,
            resolved: true,
        });
        let a = reg.insert(client);

        let caps = build_capabilities(&reg, a).unwrap();
        assert_eq!(caps[0].fault_handler, 0);
    }
}
