//! C5: the stub synthesizer. Invokes an external stub-generator program to
//! produce client-side trampolines for a component's undefined symbols,
//! assembles and partially links them into the component's own object, and
//! rewrites the component's `obj_path` to point at the combined result.
//!
//! Components with no undefined symbols are left untouched: there is
//! nothing for a stub to trampoline to, so the external tools are never
//! invoked for them.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LoaderError, Result};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_stem(dir: &Path, obj_name: &str) -> PathBuf {
    let pid = std::process::id();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{obj_name}.{pid}.{n}"))
}

fn run(command: &mut Command, label: &'static str) -> Result<Output> {
    let output = command
        .output()
        .map_err(|source| LoaderError::Io {
            path: PathBuf::from(label),
            source,
        })?;
    if !output.status.success() {
        return Err(LoaderError::ExternalTool {
            command: label.to_string(),
            status: output.status.code(),
        });
    }
    Ok(output)
}

/// Generates and links a component's client stubs, if it has any undefined
/// symbols. `stub_gen_prog` is invoked once per component, taking a
/// comma-separated symbol list on argv and emitting assembly on stdout.
/// Returns the path of the object the rest of the pipeline should use.
pub fn synthesize(
    stub_gen_prog: &Path,
    assembler: &Path,
    linker: &Path,
    tmp_dir: &Path,
    obj_path: &Path,
    undefined_symbols: &[String],
) -> Result<PathBuf> {
    if undefined_symbols.is_empty() {
        return Ok(obj_path.to_path_buf());
    }

    let obj_name = obj_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("component");
    let stem = temp_stem(tmp_dir, obj_name);
    let stub_asm = stem.with_extension("stub.S");
    let stub_obj = stem.with_extension("stub.o");
    let combined = stem.with_extension("o");

    let symbol_list = undefined_symbols.join(",");
    let stub_gen_output = run(
        Command::new(stub_gen_prog).arg(&symbol_list),
        "stub generator",
    )?;
    std::fs::write(&stub_asm, &stub_gen_output.stdout).map_err(|source| LoaderError::Io {
        path: stub_asm.clone(),
        source,
    })?;

    run(
        Command::new(assembler)
            .arg("-c")
            .arg("-o")
            .arg(&stub_obj)
            .arg(&stub_asm),
        "assembler",
    )?;

    run(
        Command::new(linker)
            .arg("-r")
            .arg("-o")
            .arg(&combined)
            .arg(obj_path)
            .arg(&stub_obj),
        "linker (partial link)",
    )?;

    let _ = std::fs::remove_file(&stub_asm);
    let _ = std::fs::remove_file(&stub_obj);

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_when_no_undefined_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("a.o");
        std::fs::write(&obj, b"not really an object").unwrap();

        let out = synthesize(
            Path::new("/bin/true"),
            Path::new("/bin/true"),
            Path::new("/bin/true"),
            dir.path(),
            &obj,
            &[],
        )
        .unwrap();
        assert_eq!(out, obj);
    }

    #[test]
    fn reports_external_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("a.o");
        std::fs::write(&obj, b"not really an object").unwrap();

        let err = synthesize(
            Path::new("/bin/false"),
            Path::new("/bin/true"),
            Path::new("/bin/true"),
            dir.path(),
            &obj,
            &["needed_fn".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, LoaderError::ExternalTool { .. }));
    }
}
