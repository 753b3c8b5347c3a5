//! Writer modules
//!
//! A writer module owns one subtree of the file and knows how to turn
//! payloads of one schema into dataset appends. A module is instantiated
//! for each `stream` node in a template; the module id in the template is,
//! by convention, the 4-byte payload schema tag.
//!
//! Contract: no thread other than the file sink's writer thread ever enters
//! `init_for`, `reopen`, `write`, `flush` or `close`. Modules may keep
//! internal buffers without further synchronisation under that constraint.

mod ev42;
mod f142;

pub use ev42::Ev42Writer;
pub use f142::F142Writer;

use crate::nexus_writer::hdf::{HdfError, HdfFile};
use crate::nexus_writer::msg::Msg;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug)]
pub enum ModuleError {
    Config(String),
    Init(String),
    Hdf(HdfError),
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::Config(msg) => write!(f, "module configuration error: {}", msg),
            ModuleError::Init(msg) => write!(f, "module init error: {}", msg),
            ModuleError::Hdf(err) => write!(f, "module file error: {}", err),
        }
    }
}

impl Error for ModuleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ModuleError::Hdf(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HdfError> for ModuleError {
    fn from(err: HdfError) -> Self {
        ModuleError::Hdf(err)
    }
}

/// Outcome of writing one message. `bytes_written` feeds throughput
/// statistics, `row_index` feeds cue-index generation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    Written { bytes_written: usize, row_index: usize },
    Error { message: String },
}

impl WriteResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, WriteResult::Written { .. })
    }
}

/// Capability set of a writer module. All file-touching operations receive
/// the file by mutable reference because they only ever run on the sink's
/// writer thread.
pub trait WriterModule: Send {
    /// Parses the stream configuration sub-object from the template.
    fn parse_config(&mut self, config: &serde_json::Value) -> Result<(), ModuleError>;

    /// Creates the module's datasets under its group and writes the
    /// stream's attributes. Called once, before any data arrives.
    fn init_for(
        &mut self,
        file: &mut HdfFile,
        group_path: &str,
        attributes: Option<&serde_json::Value>,
    ) -> Result<(), ModuleError>;

    /// Re-binds the module to its datasets after the file was reopened.
    fn reopen(&mut self, file: &mut HdfFile, group_path: &str) -> Result<(), ModuleError>;

    /// Appends one message to the module's datasets.
    fn write(&mut self, file: &mut HdfFile, msg: &Msg) -> WriteResult;

    /// Flushes internal buffers, if any.
    fn flush(&mut self, file: &mut HdfFile) -> Result<(), ModuleError> {
        let _ = file;
        Ok(())
    }

    /// Final call before the module is dropped.
    fn close(&mut self, file: &mut HdfFile) -> Result<(), ModuleError> {
        self.flush(file)
    }

    /// Event-stream modules return true and receive messages whose
    /// timestamp equals the previously written one; everything else has
    /// such repeats suppressed by the demultiplexer.
    fn accepts_repeated_timestamps(&self) -> bool {
        false
    }
}

type ModuleFactory = fn() -> Box<dyn WriterModule>;

/// Process-wide registry of writer-module factories keyed by module id.
/// Built before any master is constructed, read-only afterwards.
pub struct WriterModuleRegistry {
    factories: HashMap<&'static str, ModuleFactory>,
}

impl WriterModuleRegistry {
    fn with_defaults() -> Self {
        let mut factories: HashMap<&'static str, ModuleFactory> = HashMap::new();
        factories.insert("f142", || Box::new(F142Writer::default()));
        factories.insert("ev42", || Box::new(Ev42Writer::default()));
        WriterModuleRegistry { factories }
    }

    pub fn instantiate(&self, module_id: &str) -> Option<Box<dyn WriterModule>> {
        self.factories.get(module_id).map(|factory| factory())
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.factories.contains_key(module_id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

pub fn writer_modules() -> &'static WriterModuleRegistry {
    static REGISTRY: OnceLock<WriterModuleRegistry> = OnceLock::new();
    REGISTRY.get_or_init(WriterModuleRegistry::with_defaults)
}
