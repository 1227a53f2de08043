//! C9: the kernel install adapter. Assigns `spd_id`s, drives component
//! creation and capability installation through the [`KernelControl`]
//! trait, promotes the root scheduler, and starts the initial thread.
//! Also builds the handful of well-known payload blobs (component graph,
//! config record array, boot image) that the special components from
//! [`crate::registry::SpecialComponent`] expect to find in their heap.
//!
//! `KernelControl` exists so tests can exercise the whole install sequence
//! against a recording fake instead of a real kernel control-surface file
//! descriptor (the original `aed_open_cntl_fd`/`ioctl` pair).

use crate::capability::{self, CapabilityInfo};
use crate::cobj::{CapDesc, Cobj, SectionBody, SectionFlags, SymbolDesc, SymbolKind};
use crate::consts::{CompInfoLayout, COMP_INFO, INIT_STR_FIELD, MAX_INIT_STR_LEN, NUM_ATOMIC_SYMBS};
use crate::error::{LoaderError, Result};
use crate::registry::{ComponentId, Registry};

/// One capability to be installed at the kernel, already resolved to
/// addresses and destination ids.
#[derive(Debug, Clone)]
pub struct CapabilityInstall {
    pub rel_offset: u32,
    pub dest_spd: u32,
    pub server_fn_addr: u64,
    pub client_stub_addr: u64,
    pub server_stub_addr: u64,
    pub fault_num: u32,
}

/// The control surface a real kernel module exposes for installing
/// components. All operations are by `spd_id`, which the loader assigns
/// itself (see [`assign_spd_ids`]) rather than accepting one back from the
/// kernel.
pub trait KernelControl {
    fn create_component(&mut self, spd_id: u32, lower_addr: u64, size: u64) -> Result<()>;
    fn add_capability(&mut self, owner_spd: u32, install: &CapabilityInstall) -> Result<()>;
    fn promote_scheduler(&mut self, spd_id: u32, parent: Option<u32>) -> Result<()>;
    fn create_thread(&mut self, spd_id: u32, sched_id: u32) -> Result<()>;
    fn disable_syscalls(&mut self) -> Result<()>;
    fn enable_syscalls(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum KernelEvent {
    CreateComponent { spd_id: u32, lower_addr: u64, size: u64 },
    AddCapability { owner_spd: u32, install: CapabilityInstall },
    PromoteScheduler { spd_id: u32, parent: Option<u32> },
    CreateThread { spd_id: u32, sched_id: u32 },
    DisableSyscalls,
    EnableSyscalls,
}

/// Records every call instead of talking to a real kernel; used by tests
/// and by the `--dry-run`-style inspection the CLI offers.
#[derive(Debug, Default)]
pub struct RecordingKernel {
    pub events: Vec<KernelEvent>,
}

impl KernelControl for RecordingKernel {
    fn create_component(&mut self, spd_id: u32, lower_addr: u64, size: u64) -> Result<()> {
        self.events.push(KernelEvent::CreateComponent {
            spd_id,
            lower_addr,
            size,
        });
        Ok(())
    }

    fn add_capability(&mut self, owner_spd: u32, install: &CapabilityInstall) -> Result<()> {
        self.events.push(KernelEvent::AddCapability {
            owner_spd,
            install: install.clone(),
        });
        Ok(())
    }

    fn promote_scheduler(&mut self, spd_id: u32, parent: Option<u32>) -> Result<()> {
        self.events.push(KernelEvent::PromoteScheduler { spd_id, parent });
        Ok(())
    }

    fn create_thread(&mut self, spd_id: u32, sched_id: u32) -> Result<()> {
        self.events.push(KernelEvent::CreateThread { spd_id, sched_id });
        Ok(())
    }

    fn disable_syscalls(&mut self) -> Result<()> {
        self.events.push(KernelEvent::DisableSyscalls);
        Ok(())
    }

    fn enable_syscalls(&mut self) -> Result<()> {
        self.events.push(KernelEvent::EnableSyscalls);
        Ok(())
    }
}

/// Assigns `spd_id`s to every component in declaration order. Ids start at
/// 1; 0 is reserved to mean "no component" (used as the config record's
/// terminator and as a missing-scheduler marker).
pub fn assign_spd_ids(registry: &mut Registry) {
    let mut next = 1u32;
    for id in registry.ids() {
        registry.get_mut(id).spd_id = Some(next);
        next += 1;
    }
}

fn spd_id_of(registry: &Registry, id: ComponentId) -> u32 {
    registry.get(id).spd_id.expect("spd_id assigned before install")
}

/// Address of a component's `cos_comp_info` export, if it resolved to a
/// real symbol during linking. A synthetic export that never bound (no
/// source defines the struct, or the relinked object dropped it) is left
/// at address zero by C6 and is skipped wherever write-back is attempted.
pub fn comp_info_addr(registry: &Registry, id: ComponentId) -> Option<u64> {
    registry
        .get(id)
        .exported
        .iter()
        .find(|s| s.name == COMP_INFO)
        .map(|s| s.addr)
        .filter(|&addr| addr != 0)
}

/// Serializes the `cos_comp_info` write-back against [`CompInfoLayout`]:
/// the assigned id, the heap top, the two-word `cos_poly` scratch pair, and
/// the component's own atomic-region addresses (`consts::ATOMIC_USER_DEF`).
pub fn comp_info_patch(
    spd_id: u32,
    heap_top: u32,
    cos_poly: [u32; 2],
    atomic_region_addrs: &[u64; NUM_ATOMIC_SYMBS],
) -> Vec<u8> {
    let mut out = vec![0u8; CompInfoLayout::SIZE as usize];
    out[..4].copy_from_slice(&spd_id.to_le_bytes());
    out[4..8].copy_from_slice(&heap_top.to_le_bytes());
    out[8..12].copy_from_slice(&cos_poly[0].to_le_bytes());
    out[12..16].copy_from_slice(&cos_poly[1].to_le_bytes());
    for (i, addr) in atomic_region_addrs.iter().enumerate() {
        let off = CompInfoLayout::ATOMIC_OFFSET as usize + i * 4;
        out[off..off + 4].copy_from_slice(&(*addr as u32).to_le_bytes());
    }
    out
}

fn capability_install(registry: &Registry, cap: &CapabilityInfo) -> CapabilityInstall {
    let owner = registry.get(cap.owner);
    let target = registry.get(cap.target);
    let addr_of = |name: &str, comp: &crate::registry::Component| {
        comp.exported
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.addr)
            .unwrap_or(0)
    };
    CapabilityInstall {
        rel_offset: cap.rel_offset,
        dest_spd: spd_id_of(registry, cap.target),
        server_fn_addr: addr_of(&cap.server_fn, target),
        client_stub_addr: addr_of(&cap.client_stub, owner),
        server_stub_addr: addr_of(&cap.server_stub, target),
        fault_num: cap.fault_handler,
    }
}

/// Runs the full install sequence for every host-installed (non
/// boot-packaged) component: component creation, capability wiring, root
/// scheduler promotion, and the initial thread.
pub fn install(registry: &mut Registry, kernel: &mut dyn KernelControl) -> Result<()> {
    assign_spd_ids(registry);

    let host_ids: Vec<ComponentId> = registry
        .ids()
        .filter(|&id| !registry.get(id).is_boot_packaged)
        .collect();

    for &id in &host_ids {
        let component = registry.get(id);
        kernel.create_component(spd_id_of(registry, id), component.lower_addr, component.size)?;
    }

    for &id in &host_ids {
        let caps = capability::build_capabilities(registry, id)?;
        let owner_spd = spd_id_of(registry, id);
        for cap in &caps {
            let install_rec = capability_install(registry, cap);
            kernel.add_capability(owner_spd, &install_rec)?;
        }
    }

    let root_sched = registry
        .ids()
        .find(|&id| registry.get(id).is_root_scheduler)
        .ok_or_else(|| LoaderError::Resolution {
            component: "<root scheduler>".into(),
            symbol: "root scheduler not found among components".into(),
        })?;
    kernel.promote_scheduler(spd_id_of(registry, root_sched), None)?;

    let initial = registry
        .find_special(crate::registry::SpecialComponent::Initial)
        .ok_or_else(|| LoaderError::Resolution {
            component: "<initial component>".into(),
            symbol: "initial component not found".into(),
        })?;
    kernel.create_thread(spd_id_of(registry, initial), spd_id_of(registry, root_sched))?;

    Ok(())
}

/// Serializes the component dependency graph as a flat array of
/// `(truster_spd, trustee_spd)` id pairs, terminated by `(0, 0)`, for the
/// component-graph manager to read out of its heap. Only resolved edges
/// between two host-installed components are included: boot-packaged
/// components are wired by the in-kernel bootstrapper from their own cobj
/// capability tables, not by this graph, and a dependency that never bound
/// a symbol (a dead import) never became a capability in the first place.
pub fn build_comp_graph(registry: &Registry) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, component) in registry.iter() {
        if component.is_boot_packaged {
            continue;
        }
        let from = spd_id_of(registry, id);
        for dep in &component.dependencies {
            if !dep.resolved || registry.get(dep.target).is_boot_packaged {
                continue;
            }
            out.extend_from_slice(&from.to_le_bytes());
            out.extend_from_slice(&spd_id_of(registry, dep.target).to_le_bytes());
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Serializes the `component_init_str` record array the scheduler
/// configuration component reads: one 56-byte (4 + 4 + 4 + 52(- wait, see
/// below) ...) record per component, terminated by a record whose `spdid`
/// is zero.
pub fn build_config_records(registry: &Registry) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (id, component) in registry.iter() {
        let init_str = if component.init_str == " " { "" } else { &component.init_str };
        if init_str.len() > MAX_INIT_STR_LEN {
            return Err(LoaderError::Overflow {
                component: component.name.clone(),
                bound: "init string length",
            });
        }

        let spdid = spd_id_of(registry, id);
        let schedid = component.scheduler.map(|s| spd_id_of(registry, s)).unwrap_or(0);
        let startup: i32 = if component.is_boot_packaged { 0 } else { 1 };

        out.extend_from_slice(&spdid.to_le_bytes());
        out.extend_from_slice(&schedid.to_le_bytes());
        out.extend_from_slice(&startup.to_le_bytes());
        let mut field = [0u8; INIT_STR_FIELD];
        field[..init_str.len()].copy_from_slice(init_str.as_bytes());
        out.extend_from_slice(&field);
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}

/// Builds every boot-packaged component's cobj (symbols, capabilities, and
/// RO/DATA/BSS bodies) and concatenates them, each rounded up to a cache
/// line, into a single boot image buffer.
pub fn package_boot_image(
    registry: &Registry,
    payloads: &std::collections::HashMap<ComponentId, crate::layout::ComponentPayload>,
) -> Result<Vec<u8>> {
    use crate::consts::CACHE_LINE;
    use crate::layout::ComponentPayload;

    let boot_ids: Vec<ComponentId> = registry
        .ids()
        .filter(|&id| registry.get(id).is_boot_packaged)
        .collect();

    let empty = ComponentPayload {
        ro: Vec::new(),
        data: Vec::new(),
        bss_len: 0,
        ro_start: 0,
        data_start: 0,
    };

    let mut image = Vec::new();
    for id in boot_ids {
        let component = registry.get(id);
        let payload = payloads.get(&id).unwrap_or(&empty);
        let (mut ro_bytes, mut data_bytes, bss_size) =
            (payload.ro.clone(), payload.data.clone(), payload.bss_len);

        let caps = capability::build_capabilities(registry, id)?;
        let cap_descs: Vec<CapDesc> = caps
            .iter()
            .map(|c| {
                let install = capability_install(registry, c);
                CapDesc {
                    cap_off: c.rel_offset,
                    dest_id: install.dest_spd,
                    fault_num: install.fault_num,
                    sfn: install.server_fn_addr as u32,
                    cstub: install.client_stub_addr as u32,
                    sstub: install.server_stub_addr as u32,
                }
            })
            .collect();

        let comp_info_addr = component
            .exported
            .iter()
            .find(|s| s.name == COMP_INFO)
            .map(|s| s.addr as u32)
            .unwrap_or(0);
        let symbols = if comp_info_addr != 0 {
            vec![SymbolDesc {
                kind: SymbolKind::CompInfo,
                vaddr: comp_info_addr,
            }]
        } else {
            Vec::new()
        };

        // §4.9 steps 1-2: patch the id/heap-top/cos_poly/atomic-region
        // fields directly into the section bytes that will become this
        // cobj's RO or DATA body, at the same offset the kernel will see
        // once the boot image is unpacked. `cos_poly` delivery of a
        // heap payload (step 5) only applies to host-installed special
        // components; a boot-packaged one gets zeros there.
        if comp_info_addr != 0 {
            let patch = comp_info_patch(
                spd_id_of(registry, id),
                component.heap_top as u32,
                [0, 0],
                &component.atomic_region_addrs,
            );
            let addr = comp_info_addr as u64;
            let patch_len = patch.len() as u64;
            if addr >= payload.ro_start && addr + patch_len <= payload.ro_start + ro_bytes.len() as u64 {
                let off = (addr - payload.ro_start) as usize;
                ro_bytes[off..off + patch.len()].copy_from_slice(&patch);
            } else if addr >= payload.data_start
                && addr + patch_len <= payload.data_start + data_bytes.len() as u64
            {
                let off = (addr - payload.data_start) as usize;
                data_bytes[off..off + patch.len()].copy_from_slice(&patch);
            } else {
                log::warn!(
                    "cos_comp_info for {} falls outside its measured RO/DATA sections; leaving it unpatched",
                    component.name
                );
            }
        }

        let cobj = Cobj::build(
            spd_id_of(registry, id),
            vec![
                (SectionFlags::READ, component.lower_addr as u32, SectionBody::Bytes(ro_bytes)),
                (
                    SectionFlags::READ | SectionFlags::WRITE,
                    component.lower_addr as u32,
                    SectionBody::Bytes(data_bytes),
                ),
                (
                    SectionFlags::READ | SectionFlags::WRITE | SectionFlags::ZEROS,
                    component.lower_addr as u32,
                    SectionBody::Zeros(bss_size as u32),
                ),
            ],
            symbols,
            cap_descs,
        );

        let bytes = cobj.serialize();
        image.extend_from_slice(&bytes);
        let padded = (bytes.len() as u64).next_multiple_of(CACHE_LINE);
        image.resize(image.len() + (padded - bytes.len() as u64) as usize, 0);
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Component;
    use std::path::PathBuf;

    fn blank(name: &str) -> Component {
        Component::new(name.to_string(), PathBuf::from(name), " ".to_string())
    }

    #[test]
    fn assigns_monotonic_ids_starting_at_one() {
        let mut reg = Registry::new();
        reg.insert(blank("a.o"));
        reg.insert(blank("b.o"));
        assign_spd_ids(&mut reg);

        let a = reg.get_id("a.o").unwrap();
        let b = reg.get_id("b.o").unwrap();
        assert_eq!(reg.get(a).spd_id, Some(1));
        assert_eq!(reg.get(b).spd_id, Some(2));
    }

    #[test]
    fn install_sequence_creates_then_wires_then_promotes_then_threads() {
        let mut reg = Registry::new();
        let mut sched = blank("sched.o");
        sched.is_root_scheduler = true;
        sched.is_scheduler = true;
        let s = reg.insert(sched);

        let mut init = blank("c0.o");
        init.scheduler = Some(s);
        reg.insert(init);

        let mut kernel = RecordingKernel::default();
        install(&mut reg, &mut kernel).unwrap();

        assert!(matches!(kernel.events[0], KernelEvent::CreateComponent { .. }));
        assert!(kernel
            .events
            .iter()
            .any(|e| matches!(e, KernelEvent::PromoteScheduler { parent: None, .. })));
        assert!(matches!(kernel.events.last().unwrap(), KernelEvent::CreateThread { .. }));
    }

    #[test]
    fn config_records_terminate_with_zero_spdid() {
        let mut reg = Registry::new();
        reg.insert(blank("a.o"));
        assign_spd_ids(&mut reg);

        let bytes = build_config_records(&reg).unwrap();
        assert_eq!(bytes.len(), INIT_STR_FIELD + 12 + 4);
        let last4 = &bytes[bytes.len() - 4..];
        assert_eq!(u32::from_le_bytes(last4.try_into().unwrap()), 0);
    }

    #[test]
    fn comp_graph_omits_boot_packaged_and_unresolved_edges() {
        let mut reg = Registry::new();
        let mut a = blank("a.o");
        a.dependencies.push(crate::registry::Dependency {
            target: 0, // placeholder, fixed up below
            modifier: None,
            resolved: true,
        });
        let a_id = reg.insert(a);

        let mut boot = blank("boot.o");
        boot.is_boot_packaged = true;
        let boot_id = reg.insert(boot);

        let b_id = reg.insert(blank("b.o"));

        // a.o depends on b.o (resolved) and boot.o (unresolved, dead import).
        reg.get_mut(a_id).dependencies[0].target = b_id;
        reg.get_mut(a_id).dependencies.push(crate::registry::Dependency {
            target: boot_id,
            modifier: None,
            resolved: false,
        });

        assign_spd_ids(&mut reg);
        let graph = build_comp_graph(&reg);

        let a_spd = reg.get(a_id).spd_id.unwrap();
        let b_spd = reg.get(b_id).spd_id.unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&a_spd.to_le_bytes());
        expected.extend_from_slice(&b_spd.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(graph, expected);
    }

    #[test]
    fn comp_info_patch_serializes_id_heap_poly_and_atomic_addrs() {
        let mut atomic = [0u64; NUM_ATOMIC_SYMBS];
        atomic[0] = 0x100;
        atomic[9] = 0x900;

        let bytes = comp_info_patch(5, 0x2000, [0x3000, 2], &atomic);

        assert_eq!(bytes.len(), CompInfoLayout::SIZE as usize);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 0x2000);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0x3000);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 2);

        let first_off = CompInfoLayout::ATOMIC_OFFSET as usize;
        assert_eq!(u32::from_le_bytes(bytes[first_off..first_off + 4].try_into().unwrap()), 0x100);
        let last_off = CompInfoLayout::ATOMIC_OFFSET as usize + 9 * 4;
        assert_eq!(u32::from_le_bytes(bytes[last_off..last_off + 4].try_into().unwrap()), 0x900);
    }

    #[test]
    fn comp_info_addr_is_none_when_export_never_bound() {
        let mut reg = Registry::new();
        let mut c = blank("a.o");
        c.exported.push(crate::object::ExportedSymbol {
            name: COMP_INFO.to_string(),
            addr: 0,
        });
        let id = reg.insert(c);

        assert!(comp_info_addr(&reg, id).is_none());
    }

    #[test]
    fn package_boot_image_patches_comp_info_into_data_section() {
        use crate::layout::ComponentPayload;
        use std::collections::HashMap;

        let mut reg = Registry::new();
        let mut boot = blank("!unit.o");
        boot.is_boot_packaged = true;
        boot.heap_top = 0x4200;
        boot.lower_addr = 0x4000;
        // comp_info lands inside the data section, at data_start + 4.
        boot.exported.push(crate::object::ExportedSymbol {
            name: COMP_INFO.to_string(),
            addr: 0x4104,
        });
        let id = reg.insert(boot);
        assign_spd_ids(&mut reg);

        let mut payloads = HashMap::new();
        payloads.insert(
            id,
            ComponentPayload {
                ro: vec![0u8; 16],
                data: vec![0u8; CompInfoLayout::SIZE as usize + 8],
                bss_len: 0,
                ro_start: 0x4000,
                data_start: 0x4100,
            },
        );

        let image = package_boot_image(&reg, &payloads).unwrap();
        let cobj = Cobj::parse(&image).unwrap();

        // comp_info_addr (0x4104) sits 4 bytes into the data section
        // (data_start=0x4100), so the patched spd_id lands at data[4..8].
        let data = match &cobj.bodies[1] {
            SectionBody::Bytes(b) => b,
            _ => panic!("expected a byte-backed data section"),
        };
        let spd_id = reg.get(id).spd_id.unwrap();
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), spd_id);
        assert_eq!(u32::from_le_bytes(data[8..12].try_into().unwrap()), 0x4200);
    }

    #[test]
    fn rejects_oversized_init_string() {
        let mut reg = Registry::new();
        let mut c = blank("a.o");
        c.init_str = "x".repeat(MAX_INIT_STR_LEN + 1);
        reg.insert(c);
        assign_spd_ids(&mut reg);

        let err = build_config_records(&reg).unwrap_err();
        assert!(matches!(err, LoaderError::Overflow { .. }));
    }
}
