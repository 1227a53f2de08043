//! Ties C1 through C9 together into the single pass the CLI front-end
//! drives: parse the spec text, build the registry, resolve and verify
//! the dependency graph, synthesize stubs, link and place every
//! component, then hand off to the kernel install adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::consts::{COMP_INFO, INIT_FILE_NAME};
use crate::depparse;
use crate::error::{LoaderError, Result};
use crate::hostmem::HostMemory;
use crate::kernel::{self, KernelControl};
use crate::layout;
use crate::object;
use crate::registry::{Component, ComponentId, Dependency, Registry, SpecialComponent};
use crate::stub;

pub use crate::layout::ComponentPayload;

/// External tools the pipeline shells out to, and the scratch directory it
/// writes intermediate objects and linker scripts into.
pub struct Tools {
    pub stub_gen_prog: PathBuf,
    pub assembler: PathBuf,
    pub linker: PathBuf,
    pub tmp_dir: PathBuf,
}

/// Final state of one packaged component: where it landed, and (for
/// boot-packaged components) the raw bytes the boot image will embed.
pub struct BuildOutput {
    pub registry: Registry,
    pub boot_image: Vec<u8>,
    pub comp_graph: Vec<u8>,
    pub config_records: Vec<u8>,
}

fn populate_registry(text: &str) -> Result<Registry> {
    let (components, edges) = depparse::parse_spec(text)?;

    let mut registry = Registry::new();
    let mut root_sched_name: Option<String> = None;

    for parsed in &components {
        if registry.contains(&parsed.name) {
            return Err(LoaderError::Syntax {
                fragment: parsed.name.clone(),
                reason: "component declared more than once",
            });
        }

        let (mut exported, undefined) = object::read_symbols(Path::new(&parsed.name))?;
        exported.push(crate::object::ExportedSymbol {
            name: COMP_INFO.to_string(),
            addr: 0,
        });

        let mut component = Component::new(
            parsed.name.clone(),
            PathBuf::from(&parsed.name),
            parsed.init_str.clone(),
        );
        component.is_scheduler = parsed.is_scheduler;
        component.is_boot_packaged = parsed.is_boot_packaged;
        component.exported = exported;
        component.undefined = undefined;

        if parsed.is_scheduler && root_sched_name.is_none() {
            root_sched_name = Some(parsed.name.clone());
        }

        registry.insert(component);
    }

    if let Some(name) = &root_sched_name {
        if let Some(id) = registry.get_id(name) {
            registry.get_mut(id).is_root_scheduler = true;
        }
    }

    for edge in &edges {
        let from = registry.get_id(&edge.from).ok_or_else(|| LoaderError::Syntax {
            fragment: edge.from.clone(),
            reason: "dependency names a component that was not declared",
        })?;
        let to = registry.get_id(&edge.to).ok_or_else(|| LoaderError::Syntax {
            fragment: edge.to.clone(),
            reason: "dependency names a component that was not declared",
        })?;

        if !registry.get(from).is_boot_packaged && registry.get(to).is_boot_packaged {
            return Err(LoaderError::Syntax {
                fragment: format!("{}-{}", edge.from, edge.to),
                reason: "non-boot-packaged component cannot depend on a boot-packaged one",
            });
        }

        if registry.get(from).dependencies.iter().any(|d| d.target == to) {
            return Err(LoaderError::Syntax {
                fragment: format!("{}-{}", edge.from, edge.to),
                reason: "component names the same dependency twice",
            });
        }

        if registry.get(from).dependencies.len() >= crate::consts::MAX_DEPENDENCIES {
            return Err(LoaderError::Overflow {
                component: edge.from.clone(),
                bound: "dependency count",
            });
        }

        registry.get_mut(from).dependencies.push(Dependency {
            target: to,
            modifier: edge.modifier.clone(),
            resolved: false,
        });

        if registry.get(to).is_scheduler {
            let caller = registry.get(from);
            match caller.scheduler {
                None => registry.get_mut(from).scheduler = Some(to),
                Some(existing) if existing == to => {}
                Some(_) => {
                    return Err(LoaderError::Syntax {
                        fragment: edge.from.clone(),
                        reason: "component depends on more than one scheduler",
                    });
                }
            }
        }
    }

    Ok(registry)
}

/// Runs stub synthesis and the two-pass link for every component, in
/// declaration order, assigning each a window address.
fn link_and_place(registry: &mut Registry, tools: &Tools) -> Result<HashMap<ComponentId, ComponentPayload>> {
    let boot_component = registry.find_special(SpecialComponent::Boot);
    let mut payloads = HashMap::new();
    let mut window_index = 0u64;
    let mut boot_windows_reserved = 0u64;

    for id in registry.ids() {
        let undefined_names: Vec<String> =
            registry.get(id).undefined.iter().map(|u| u.name.clone()).collect();
        let current_path = registry.get(id).obj_path.clone();
        let combined = stub::synthesize(
            &tools.stub_gen_prog,
            &tools.assembler,
            &tools.linker,
            &tools.tmp_dir,
            &current_path,
            &undefined_names,
        )?;
        registry.get_mut(id).obj_path = combined.clone();

        let window = layout::window_address(window_index, boot_windows_reserved);
        window_index += 1;
        if Some(id) == boot_component {
            boot_windows_reserved += 1;
        }

        let linked = layout::two_pass_link(&tools.linker, &tools.tmp_dir, &combined, window)?;

        for exported in registry.get_mut(id).exported.iter_mut() {
            if let Some(addr) = object::lookup(&linked.relinked_path, &exported.name)? {
                exported.addr = addr;
            }
        }

        let mut atomic_region_addrs = [0u64; crate::consts::NUM_ATOMIC_SYMBS];
        for (i, name) in crate::consts::ATOMIC_USER_DEF.iter().enumerate() {
            if let Some(addr) = object::lookup(&linked.relinked_path, name)? {
                atomic_region_addrs[i] = addr;
            }
        }
        registry.get_mut(id).atomic_region_addrs = atomic_region_addrs;

        let component = registry.get_mut(id);
        component.lower_addr = linked.ro_start;
        component.size = (linked.data_start - linked.ro_start)
            + linked.layout.data.map(|d| d.size).unwrap_or(0)
            + linked.layout.bss.map(|b| b.size).unwrap_or(0);
        component.heap_top = linked.data_start
            + linked.layout.data.map(|d| d.size).unwrap_or(0)
            + linked.layout.bss.map(|b| b.size).unwrap_or(0);

        let payload = layout::read_payload(&linked)?;
        payloads.insert(id, payload);
    }

    Ok(payloads)
}

/// Writes every host-installed component's linked sections into the
/// process at the addresses C6 bound them to (§4.6's "host-memory
/// deployment"), then writes the handful of special-component payloads
/// (§4.9 step 5) just past the heap of whichever special component is
/// itself host-installed rather than boot-packaged, and finally patches
/// every host-installed component's own `cos_comp_info` (§4.9 steps 1-2 and
/// 5) with its assigned id, heap top, atomic-region addresses, and (for the
/// init-file and boot components) the `cos_poly` base/count pair.
fn deploy_host_memory(
    registry: &Registry,
    payloads: &HashMap<ComponentId, ComponentPayload>,
    comp_graph: &[u8],
    config_records: &[u8],
    boot_image: &[u8],
    host_mem: &mut dyn HostMemory,
) -> Result<()> {
    for (id, component) in registry.iter() {
        if component.is_boot_packaged {
            continue;
        }
        let Some(payload) = payloads.get(&id) else {
            continue;
        };
        if !payload.ro.is_empty() {
            host_mem.write(payload.ro_start, &payload.ro)?;
        }
        if !payload.data.is_empty() {
            host_mem.write(payload.data_start, &payload.data)?;
        }
        if payload.bss_len > 0 {
            let bss_start = payload.data_start + payload.data.len() as u64;
            host_mem.zero(bss_start, payload.bss_len)?;
        }
    }

    for kind in [
        SpecialComponent::MpdManager,
        SpecialComponent::Config,
        SpecialComponent::Boot,
    ] {
        let Some(id) = registry.find_special(kind) else {
            continue;
        };
        let component = registry.get(id);
        if component.is_boot_packaged {
            continue;
        }
        let bytes: &[u8] = match kind {
            SpecialComponent::MpdManager => comp_graph,
            SpecialComponent::Config => config_records,
            SpecialComponent::Boot => boot_image,
            _ => continue,
        };
        if !bytes.is_empty() {
            host_mem.write(component.heap_top, bytes)?;
        }
    }

    let init_file_bytes = std::fs::read(INIT_FILE_NAME).ok();
    let init_file_len = init_file_bytes.as_ref().map(|b| b.len() as u32).unwrap_or(0);
    if let Some(id) = registry.find_special(SpecialComponent::InitFile) {
        let component = registry.get(id);
        if !component.is_boot_packaged {
            if let Some(bytes) = &init_file_bytes {
                if !bytes.is_empty() {
                    host_mem.write(component.heap_top, bytes)?;
                }
            }
        }
    }

    let boot_count = registry
        .iter()
        .filter(|(_, c)| c.is_boot_packaged)
        .count() as u32;
    let init_file_id = registry.find_special(SpecialComponent::InitFile);
    let boot_id = registry.find_special(SpecialComponent::Boot);

    for (id, component) in registry.iter() {
        if component.is_boot_packaged {
            continue;
        }
        let Some(addr) = kernel::comp_info_addr(registry, id) else {
            continue;
        };
        let cos_poly = if Some(id) == init_file_id {
            [component.heap_top as u32, init_file_len]
        } else if Some(id) == boot_id {
            [component.heap_top as u32, boot_count]
        } else {
            [0, 0]
        };
        let spd_id = component.spd_id.unwrap_or(0);
        let patch = kernel::comp_info_patch(spd_id, component.heap_top as u32, cos_poly, &component.atomic_region_addrs);
        host_mem.write(addr, &patch)?;
    }

    Ok(())
}

/// Runs the full pipeline: parse, populate, resolve, link, install.
pub fn run(
    text: &str,
    tools: &Tools,
    kernel_ctl: &mut dyn KernelControl,
    host_mem: &mut dyn HostMemory,
) -> Result<BuildOutput> {
    let mut registry = populate_registry(text)?;

    crate::resolver::resolve_symbols(&mut registry)?;
    crate::resolver::verify_dag(&mut registry)?;

    let payloads = link_and_place(&mut registry, tools)?;

    kernel::assign_spd_ids(&mut registry);

    let comp_graph = kernel::build_comp_graph(&registry);
    let config_records = kernel::build_config_records(&registry)?;
    let boot_image = kernel::package_boot_image(&registry, &payloads)?;

    deploy_host_memory(
        &registry,
        &payloads,
        &comp_graph,
        &config_records,
        &boot_image,
        host_mem,
    )?;

    kernel::install(&mut registry, kernel_ctl)?;

    Ok(BuildOutput {
        registry,
        boot_image,
        comp_graph,
        config_records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_elf32;

    #[test]
    fn populates_registry_from_spec_text() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.o");
        let b = dir.path().join("b.o");
        write_elf32(&b, &[("widget_get", true, true)], &[]);
        write_elf32(&a, &[], &["widget_get"]);

        let text = format!(
            "{},init_a;{},init_b:{}-{}",
            a.display(),
            b.display(),
            a.display(),
            b.display()
        );
        let registry = populate_registry(&text).unwrap();
        assert_eq!(registry.len(), 2);
        let a_id = registry.get_id(&a.display().to_string()).unwrap();
        assert_eq!(registry.get(a_id).dependencies.len(), 1);
    }

    #[test]
    fn rejects_duplicate_component_declaration() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.o");
        write_elf32(&a, &[], &[]);

        let text = format!("{},x;{},y:", a.display(), a.display());
        let err = populate_registry(&text).unwrap_err();
        assert!(matches!(err, LoaderError::Syntax { .. }));
    }

    #[test]
    fn rejects_non_boot_packaged_depending_on_boot_packaged() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.o");
        let boot = dir.path().join("boot.o");
        write_elf32(&a, &[], &[]);
        write_elf32(&boot, &[], &[]);

        let text = format!("{},x;!{},y:{}-{}", a.display(), boot.display(), a.display(), boot.display());
        let err = populate_registry(&text).unwrap_err();
        assert!(matches!(err, LoaderError::Syntax { .. }));
    }

    #[test]
    fn rejects_duplicate_dependency_on_the_same_target() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.o");
        let b = dir.path().join("b.o");
        write_elf32(&a, &[], &[]);
        write_elf32(&b, &[], &[]);

        let text = format!("{},x;{},y:{}-{}|{}", a.display(), b.display(), a.display(), b.display(), b.display());
        let err = populate_registry(&text).unwrap_err();
        assert!(matches!(err, LoaderError::Syntax { .. }));
    }

    #[test]
    fn rejects_dependency_count_past_the_bound() {
        use crate::consts::MAX_DEPENDENCIES;

        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.o");
        write_elf32(&a, &[], &[]);

        let mut targets = Vec::new();
        let mut components = format!("{},x", a.display());
        for i in 0..=MAX_DEPENDENCIES {
            let t = dir.path().join(format!("t{i}.o"));
            write_elf32(&t, &[], &[]);
            components.push_str(&format!(";{},y", t.display()));
            targets.push(t);
        }
        let deps = targets
            .iter()
            .map(|t| t.display().to_string())
            .collect::<Vec<_>>()
            .join("|");
        let text = format!("{components}:{}-{deps}", a.display());

        let err = populate_registry(&text).unwrap_err();
        assert!(matches!(err, LoaderError::Overflow { .. }));
    }

    #[test]
    fn deploy_writes_sections_for_host_installed_components_only() {
        use crate::hostmem::{HostMemoryEvent, RecordingHostMemory};
        use crate::registry::Component;
        use std::path::PathBuf;

        let mut registry = Registry::new();
        let mut host = Component::new("a.o".into(), PathBuf::from("a.o"), String::new());
        host.lower_addr = 0x1000;
        let host_id = registry.insert(host);

        let mut boot = Component::new("!b.o".into(), PathBuf::from("b.o"), String::new());
        boot.is_boot_packaged = true;
        boot.lower_addr = 0x2000;
        let boot_id = registry.insert(boot);

        let mut payloads = HashMap::new();
        payloads.insert(
            host_id,
            ComponentPayload {
                ro: vec![1, 2, 3],
                data: vec![4, 5],
                bss_len: 64,
                ro_start: 0x1000,
                data_start: 0x1100,
            },
        );
        payloads.insert(
            boot_id,
            ComponentPayload {
                ro: vec![9, 9],
                data: vec![],
                bss_len: 0,
                ro_start: 0x2000,
                data_start: 0x2100,
            },
        );

        let mut mem = RecordingHostMemory::default();
        deploy_host_memory(&registry, &payloads, &[], &[], &[], &mut mem).unwrap();

        assert_eq!(mem.events.len(), 3);
        assert!(matches!(
            &mem.events[0],
            HostMemoryEvent::Write { addr, bytes } if *addr == 0x1000 && bytes == &[1, 2, 3]
        ));
        assert!(matches!(
            &mem.events[1],
            HostMemoryEvent::Write { addr, bytes } if *addr == 0x1100 && bytes == &[4, 5]
        ));
        assert!(matches!(
            &mem.events[2],
            HostMemoryEvent::Zero { addr, len } if *addr == 0x1102 && *len == 64
        ));
    }

    #[test]
    fn deploy_delivers_special_payloads_to_host_installed_heap() {
        use crate::hostmem::{HostMemoryEvent, RecordingHostMemory};
        use crate::registry::Component;
        use std::path::PathBuf;

        let mut registry = Registry::new();
        let mut mgr = Component::new("cg.o".into(), PathBuf::from("cg.o"), String::new());
        mgr.heap_top = 0x5000;
        registry.insert(mgr);

        let graph = vec![1, 0, 0, 0, 2, 0, 0, 0];
        let mut mem = RecordingHostMemory::default();
        deploy_host_memory(&registry, &HashMap::new(), &graph, &[], &[], &mut mem).unwrap();

        assert_eq!(mem.events.len(), 1);
        assert!(matches!(
            &mem.events[0],
            HostMemoryEvent::Write { addr, bytes } if *addr == 0x5000 && bytes == &graph
        ));
    }

    #[test]
    fn deploy_writes_comp_info_patch_when_resolved() {
        use crate::hostmem::{HostMemoryEvent, RecordingHostMemory};
        use crate::object::ExportedSymbol;
        use crate::registry::Component;
        use std::path::PathBuf;

        let mut registry = Registry::new();
        let mut host = Component::new("a.o".into(), PathBuf::from("a.o"), String::new());
        host.heap_top = 0x1200;
        host.spd_id = Some(7);
        host.exported.push(ExportedSymbol {
            name: crate::consts::COMP_INFO.to_string(),
            addr: 0x1500,
        });
        registry.insert(host);

        let mut mem = RecordingHostMemory::default();
        deploy_host_memory(&registry, &HashMap::new(), &[], &[], &[], &mut mem).unwrap();

        let patch = mem
            .events
            .iter()
            .find_map(|e| match e {
                HostMemoryEvent::Write { addr, bytes } if *addr == 0x1500 => Some(bytes.clone()),
                _ => None,
            })
            .expect("comp-info patch was written");
        assert_eq!(u32::from_le_bytes(patch[0..4].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(patch[4..8].try_into().unwrap()), 0x1200);
    }

    #[test]
    fn deploy_skips_comp_info_patch_when_export_never_bound() {
        use crate::hostmem::{HostMemoryEvent, RecordingHostMemory};
        use crate::object::ExportedSymbol;
        use crate::registry::Component;
        use std::path::PathBuf;

        let mut registry = Registry::new();
        let mut host = Component::new("a.o".into(), PathBuf::from("a.o"), String::new());
        host.exported.push(ExportedSymbol {
            name: crate::consts::COMP_INFO.to_string(),
            addr: 0,
        });
        registry.insert(host);

        let mut mem = RecordingHostMemory::default();
        deploy_host_memory(&registry, &HashMap::new(), &[], &[], &[], &mut mem).unwrap();

        assert!(!mem
            .events
            .iter()
            .any(|e| matches!(e, HostMemoryEvent::Write { .. })));
    }

    #[test]
    fn deploy_writes_boot_count_into_cos_poly_for_boot_component() {
        use crate::hostmem::{HostMemoryEvent, RecordingHostMemory};
        use crate::object::ExportedSymbol;
        use crate::registry::Component;
        use std::path::PathBuf;

        let mut registry = Registry::new();
        let mut boot = Component::new("boot.o".into(), PathBuf::from("boot.o"), String::new());
        boot.heap_top = 0x9000;
        boot.spd_id = Some(3);
        boot.exported.push(ExportedSymbol {
            name: crate::consts::COMP_INFO.to_string(),
            addr: 0x9400,
        });
        registry.insert(boot);

        let mut packaged = Component::new("!x.o".into(), PathBuf::from("x.o"), String::new());
        packaged.is_boot_packaged = true;
        registry.insert(packaged);

        let mut mem = RecordingHostMemory::default();
        deploy_host_memory(&registry, &HashMap::new(), &[], &[], &[], &mut mem).unwrap();

        let patch = mem
            .events
            .iter()
            .find_map(|e| match e {
                HostMemoryEvent::Write { addr, bytes } if *addr == 0x9400 => Some(bytes.clone()),
                _ => None,
            })
            .expect("comp-info patch was written");
        let poly0 = u32::from_le_bytes(patch[8..12].try_into().unwrap());
        let poly1 = u32::from_le_bytes(patch[12..16].try_into().unwrap());
        assert_eq!(poly0, 0x9000);
        assert_eq!(poly1, 1);
    }
}
