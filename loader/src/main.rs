//! Command-line entry point. Takes exactly two positional arguments: the
//! `"<components>:<deps>"` spec, and the path to the client-stub generator
//! program. A flag-parsing crate would be overkill for two fixed
//! positionals; this mirrors the reference tool's own plain `argv` reading.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use cos_loader::hostmem::AnonMmap;
use cos_loader::kernel::RecordingKernel;
use cos_loader::pipeline::{self, Tools};

fn print_usage(prog: &str) {
    eprintln!(
        "Usage: {prog} <comma separated string of all objs:truster1-trustee1|trustee2|...;truster2-...> <path to gen_client_stub>"
    );
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        print_usage(&args[0]);
        return ExitCode::FAILURE;
    }

    let spec_text = &args[1];
    let stub_gen_prog = PathBuf::from(&args[2]);

    let tools = Tools {
        stub_gen_prog,
        assembler: PathBuf::from("as"),
        linker: PathBuf::from("ld"),
        tmp_dir: env::temp_dir(),
    };

    let mut kernel = RecordingKernel::default();
    let mut host_mem = AnonMmap;
    match pipeline::run(spec_text, &tools, &mut kernel, &mut host_mem) {
        Ok(output) => {
            log::info!(
                "linked {} components, boot image {} bytes",
                output.registry.len(),
                output.boot_image.len()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
