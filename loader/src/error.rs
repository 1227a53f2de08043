use std::fmt;
use std::path::PathBuf;

/// Every fatal condition the pipeline can raise, from parsing the dependency
/// text through kernel installation. There is no partial success: any
/// `LoaderError` aborts the run.
#[derive(Debug)]
pub enum LoaderError {
    /// Malformed component or dependency string.
    Syntax { fragment: String, reason: &'static str },
    /// Missing object file, unreadable temporary.
    Io { path: PathBuf, source: std::io::Error },
    /// Not an object file / unsupported container.
    Format { path: PathBuf, reason: String },
    /// Undefined symbol with no suitable exporter, or a missing stub.
    Resolution { component: String, symbol: String },
    /// Dependency graph contains a cycle.
    Cycle { component: String },
    /// Per-component symbol, dependency, or name-length bound exceeded.
    Overflow { component: String, bound: &'static str },
    /// Kernel control-surface call failed.
    Kernel { call: &'static str, component: String },
    /// Linker, assembler, strip, or stub generator exited non-zero.
    ExternalTool { command: String, status: Option<i32> },
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::Syntax { fragment, reason } => {
                write!(f, "syntax error near '{}': {}", fragment, reason)
            }
            LoaderError::Io { path, source } => {
                write!(f, "i/o error on {}: {}", path.display(), source)
            }
            LoaderError::Format { path, reason } => {
                write!(f, "{}: {}", path.display(), reason)
            }
            LoaderError::Resolution { component, symbol } => {
                write!(
                    f,
                    "could not find exporter of symbol '{}' in component '{}'",
                    symbol, component
                )
            }
            LoaderError::Cycle { component } => {
                write!(f, "component '{}' found in dependency cycle", component)
            }
            LoaderError::Overflow { component, bound } => {
                write!(f, "component '{}' exceeds bound: {}", component, bound)
            }
            LoaderError::Kernel { call, component } => {
                write!(f, "kernel call '{}' failed for component '{}'", call, component)
            }
            LoaderError::ExternalTool { command, status } => match status {
                Some(code) => write!(f, "command '{}' exited with status {}", command, code),
                None => write!(f, "command '{}' was terminated by a signal", command),
            },
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoaderError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;
