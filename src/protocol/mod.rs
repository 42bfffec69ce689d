//! The text protocol: block registry, incremental parser, unit translator.

pub mod parser;
pub mod registry;
pub mod translate;

pub use parser::{CommandStreamParser, DecodedCommand};
pub use registry::{BlockRegistry, BlockSpec, WriteMode};
pub use translate::{translate, ExecutableUnit, UnitKind};
