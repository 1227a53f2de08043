//! Links two toy components, `ping` and `pong`, where `ping` calls into
//! `pong`'s `pong_serve` function and `pong` calls back into `ping`'s
//! `ping_wake` through a renamed (`[cb_]`-modified) dependency edge.
//!
//! This builds its own minimal ELF32 objects on the fly rather than
//! shelling out to a real assembler, so the example can run without a
//! cross toolchain installed; `cos-loader` itself still shells out to a
//! real linker to do the actual section placement.

use std::fs;
use std::path::Path;

use cos_loader::hostmem::RecordingHostMemory;
use cos_loader::kernel::RecordingKernel;
use cos_loader::pipeline::{self, Tools};

const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;
const SHN_UNDEF: u16 = 0;

fn shdr(name: u32, ty: u32, flags: u32, offset: u32, size: u32, link: u32, info: u32, align: u32, entsize: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(40);
    for field in [name, ty, flags, 0, offset, size, link, info, align, entsize] {
        v.extend_from_slice(&field.to_le_bytes());
    }
    v
}

fn sym(name: u32, info: u8, shndx: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(16);
    v.extend_from_slice(&name.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes());
    v.push(info);
    v.push(0);
    v.extend_from_slice(&shndx.to_le_bytes());
    v
}

/// Writes a minimal ET_REL ELF32/LE/EM_386 object exporting `exported` and
/// leaving `undefined` unresolved.
fn write_component(path: &Path, exported: &[&str], undefined: &[&str]) {
    let mut shstrtab = vec![0u8];
    let mut strtab = vec![0u8];
    let mut add = |tab: &mut Vec<u8>, s: &str| -> u32 {
        let off = tab.len() as u32;
        tab.extend_from_slice(s.as_bytes());
        tab.push(0);
        off
    };

    let name_text = add(&mut shstrtab, ".text");
    let name_symtab = add(&mut shstrtab, ".symtab");
    let name_strtab = add(&mut shstrtab, ".strtab");
    let name_shstrtab = add(&mut shstrtab, ".shstrtab");

    let text = vec![0x90u8; 4];
    let mut symtab = sym(0, 0, 0);
    for name in exported {
        let n = add(&mut strtab, name);
        symtab.extend_from_slice(&sym(n, (STB_GLOBAL << 4) | STT_FUNC, 1));
    }
    for name in undefined {
        let n = add(&mut strtab, name);
        symtab.extend_from_slice(&sym(n, (STB_GLOBAL << 4) | STT_FUNC, SHN_UNDEF));
    }

    let ehdr_size = 52u32;
    let text_off = ehdr_size;
    let symtab_off = text_off + text.len() as u32;
    let strtab_off = symtab_off + symtab.len() as u32;
    let shstrtab_off = strtab_off + strtab.len() as u32;
    let shdr_off = shstrtab_off + shstrtab.len() as u32;

    let mut shdrs = Vec::new();
    shdrs.extend_from_slice(&shdr(0, 0, 0, 0, 0, 0, 0, 0, 0));
    shdrs.extend_from_slice(&shdr(name_text, 1, 0x6, text_off, text.len() as u32, 0, 0, 4, 0));
    shdrs.extend_from_slice(&shdr(name_symtab, 2, 0, symtab_off, symtab.len() as u32, 3, 1, 4, 16));
    shdrs.extend_from_slice(&shdr(name_strtab, 3, 0, strtab_off, strtab.len() as u32, 0, 0, 1, 0));
    shdrs.extend_from_slice(&shdr(name_shstrtab, 3, 0, shstrtab_off, shstrtab.len() as u32, 0, 0, 1, 0));

    let mut ehdr = Vec::with_capacity(52);
    ehdr.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    ehdr.extend_from_slice(&[0u8; 8]);
    ehdr.extend_from_slice(&1u16.to_le_bytes());
    ehdr.extend_from_slice(&3u16.to_le_bytes());
    ehdr.extend_from_slice(&1u32.to_le_bytes());
    ehdr.extend_from_slice(&0u32.to_le_bytes());
    ehdr.extend_from_slice(&0u32.to_le_bytes());
    ehdr.extend_from_slice(&shdr_off.to_le_bytes());
    ehdr.extend_from_slice(&0u32.to_le_bytes());
    ehdr.extend_from_slice(&52u16.to_le_bytes());
    ehdr.extend_from_slice(&0u16.to_le_bytes());
    ehdr.extend_from_slice(&0u16.to_le_bytes());
    ehdr.extend_from_slice(&40u16.to_le_bytes());
    ehdr.extend_from_slice(&5u16.to_le_bytes());
    ehdr.extend_from_slice(&4u16.to_le_bytes());

    let mut out = Vec::new();
    out.extend_from_slice(&ehdr);
    out.extend_from_slice(&text);
    out.extend_from_slice(&symtab);
    out.extend_from_slice(&strtab);
    out.extend_from_slice(&shstrtab);
    out.extend_from_slice(&shdrs);
    fs::write(path, out).expect("write synthetic component");
}

fn main() {
    env_logger::init();

    let dir = std::env::temp_dir().join("cos_loader_ping_pong_example");
    fs::create_dir_all(&dir).expect("create scratch dir");
    // Named c0.o so it is recognized as the initial component the root
    // scheduler hands off to.
    let ping = dir.join("c0.o");
    let pong = dir.join("pong.o");
    let sched = dir.join("sched.o");

    write_component(&ping, &["ping_wake", "ping_wake_inv", "SS_ipc_client_marshal_args"], &["pong_serve"]);
    write_component(&pong, &["pong_serve", "pong_serve_inv", "SS_ipc_client_marshal_args"], &["cb_ping_wake"]);
    write_component(&sched, &["sched_create_thread"], &[]);

    let text = format!(
        "*{},root scheduler;{},ping component;{},pong component:{}-{};{}-[cb_]{};{}-{};{}-{}",
        sched.display(),
        ping.display(),
        pong.display(),
        ping.display(),
        pong.display(),
        pong.display(),
        ping.display(),
        ping.display(),
        sched.display(),
        pong.display(),
        sched.display(),
    );

    let tools = Tools {
        stub_gen_prog: "/bin/true".into(),
        assembler: "as".into(),
        linker: "ld".into(),
        tmp_dir: dir.clone(),
    };
    let mut kernel = RecordingKernel::default();
    let mut host_mem = RecordingHostMemory::default();

    match pipeline::run(&text, &tools, &mut kernel, &mut host_mem) {
        Ok(output) => {
            println!(
                "linked {} components, {} kernel events recorded, {} host-memory writes",
                output.registry.len(),
                kernel.events.len(),
                host_mem.events.len()
            );
        }
        Err(err) => eprintln!("link failed: {err}"),
    }
}
