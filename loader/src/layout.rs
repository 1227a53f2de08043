//! C6: the two-pass layout and link stage. Measures each component's
//! section sizes with a zero-based relink, assigns it an address window,
//! relinks a second time at the bound address, and pulls the resulting
//! bytes and symbol addresses back out.
//!
//! The loader process never shares an address space with the target
//! kernel, so "loading" a host-installed component means copying its
//! linked RO/DATA/BSS bytes into an in-memory buffer for the kernel
//! control surface (C9) to hand off, rather than `mmap`-ing them into this
//! process the way an in-kernel loader would.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::consts::{BASE_ADDRESS, PAGE_SIZE, WINDOW_SIZE};
use crate::error::{LoaderError, Result};
use crate::object::{self, SectionLayout};

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn round_up_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn align_up(offset: u64, align: u64) -> u64 {
    if align <= 1 {
        return offset;
    }
    (offset + align - 1) & !(align - 1)
}

/// Address of the `index`-th (0-based, in declaration order) component's
/// window, skipping the reserved window immediately after a boot-packaged
/// component so that host addresses and boot-packaged virtual addresses
/// never collide.
pub fn window_address(index: u64, boot_packaged_count_before: u64) -> u64 {
    BASE_ADDRESS + (index + 1 + boot_packaged_count_before) * WINDOW_SIZE
}

fn linker_script(ro_start: Option<u64>, data_start: Option<u64>) -> String {
    let mut s = String::from("SECTIONS\n{\n");
    if let Some(addr) = ro_start {
        s.push_str(&format!(". = 0x{addr:x};\n"));
    }
    s.push_str(".text : { *(.text*) }\n");
    s.push_str(".rodata : { *(.rodata*) }\n");
    if let Some(addr) = data_start {
        s.push_str(&format!(". = 0x{addr:x};\n"));
    }
    s.push_str(".data : { *(.data*) }\n");
    s.push_str(".bss : { *(.bss*) }\n");
    if ro_start.is_some() {
        s.push_str(". = 0x0;\n");
    }
    s.push_str(".eh_frame : { *(.eh_frame*) }\n");
    s.push_str("}\n");
    s
}

fn run_linker(linker: &Path, script: &Path, input: &Path, output: &Path) -> Result<()> {
    let status = Command::new(linker)
        .arg("-T")
        .arg(script)
        .arg("-o")
        .arg(output)
        .arg(input)
        .status()
        .map_err(|source| LoaderError::Io {
            path: linker.to_path_buf(),
            source,
        })?;
    if !status.success() {
        return Err(LoaderError::ExternalTool {
            command: format!("{} -T {} -o {} {}", linker.display(), script.display(), output.display(), input.display()),
            status: status.code(),
        });
    }
    Ok(())
}

/// Size in bytes of the combined text+rodata region and the combined
/// data+bss region, each rounded up to a page, matching `calculate_mem_size`
/// followed by `round_up_to_page` in the reference implementation.
pub struct MeasuredSizes {
    pub ro_size: u64,
    pub data_size: u64,
}

fn measure(layout: &SectionLayout) -> MeasuredSizes {
    let mut ro = 0u64;
    if let Some(text) = layout.text {
        ro = align_up(ro, text.align) + text.size;
    }
    if let Some(rodata) = layout.rodata {
        ro = align_up(ro, rodata.align) + rodata.size;
    }
    let mut data = 0u64;
    if let Some(d) = layout.data {
        data = align_up(data, d.align) + d.size;
    }
    if let Some(bss) = layout.bss {
        data = align_up(data, bss.align) + bss.size;
    }
    MeasuredSizes {
        ro_size: round_up_page(ro),
        data_size: round_up_page(data),
    }
}

/// The outcome of relinking a component at its bound window: final section
/// layout of the relinked object, and the window addresses it was bound at.
pub struct LinkedComponent {
    pub relinked_path: PathBuf,
    pub layout: SectionLayout,
    pub ro_start: u64,
    pub data_start: u64,
}

/// Runs both linker passes for one component and returns its final layout.
/// Pass 1 relinks at address zero purely to measure section sizes; pass 2
/// relinks at the real window, informed by those sizes.
pub fn two_pass_link(
    linker: &Path,
    tmp_dir: &Path,
    obj_path: &Path,
    window_base: u64,
) -> Result<LinkedComponent> {
    let n = SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();

    let script_pass1 = tmp_dir.join(format!("loader_script.{pid}.{n}.pass1"));
    let exec_pass1 = tmp_dir.join(format!("loader_exec.{pid}.{n}.pass1"));
    fs::write(&script_pass1, linker_script(None, None)).map_err(|source| LoaderError::Io {
        path: script_pass1.clone(),
        source,
    })?;
    run_linker(linker, &script_pass1, obj_path, &exec_pass1)?;
    let measured = measure(&object::read_section_layout(&exec_pass1)?);
    let _ = fs::remove_file(&script_pass1);
    let _ = fs::remove_file(&exec_pass1);

    let ro_start = window_base;
    let data_start = ro_start + measured.ro_size;

    let script_pass2 = tmp_dir.join(format!("loader_script.{pid}.{n}.pass2"));
    let exec_pass2 = tmp_dir.join(format!("loader_exec.{pid}.{n}.pass2"));
    fs::write(
        &script_pass2,
        linker_script(Some(ro_start), Some(data_start)),
    )
    .map_err(|source| LoaderError::Io {
        path: script_pass2.clone(),
        source,
    })?;
    run_linker(linker, &script_pass2, obj_path, &exec_pass2)?;
    let layout = object::read_section_layout(&exec_pass2)?;
    let _ = fs::remove_file(&script_pass2);

    Ok(LinkedComponent {
        relinked_path: exec_pass2,
        layout,
        ro_start,
        data_start,
    })
}

/// A relinked component's bytes plus the addresses C6 bound them at: the
/// cobj serializer (C8) writes `ro`/`data`/`bss_len` into a packaged
/// container, while the host-memory deployer (C9) writes the same bytes
/// directly into the process at `ro_start`/`data_start`. BSS carries no
/// file bytes, only a zero-fill length, mirroring the cobj `ZEROS` flag.
#[derive(Debug, Clone)]
pub struct ComponentPayload {
    pub ro: Vec<u8>,
    pub data: Vec<u8>,
    pub bss_len: u64,
    pub ro_start: u64,
    pub data_start: u64,
}

/// Copies a relinked component's bytes into an in-memory payload buffer.
pub fn read_payload(linked: &LinkedComponent) -> Result<ComponentPayload> {
    let bytes = fs::read(&linked.relinked_path).map_err(|source| LoaderError::Io {
        path: linked.relinked_path.clone(),
        source,
    })?;

    let mut ro = Vec::new();
    if let Some(text) = linked.layout.text {
        let start = text.file_offset as usize;
        let end = start + text.size as usize;
        ro.extend_from_slice(&bytes[start..end]);
    }
    if let Some(rodata) = linked.layout.rodata {
        let start = rodata.file_offset as usize;
        let end = start + rodata.size as usize;
        ro.extend_from_slice(&bytes[start..end]);
    }

    let mut data = Vec::new();
    if let Some(d) = linked.layout.data {
        let start = d.file_offset as usize;
        let end = start + d.size as usize;
        data.extend_from_slice(&bytes[start..end]);
    }

    let bss_len = linked.layout.bss.map(|b| b.size).unwrap_or(0);

    Ok(ComponentPayload {
        ro,
        data,
        bss_len,
        ro_start: linked.ro_start,
        data_start: linked.data_start,
    })
}
