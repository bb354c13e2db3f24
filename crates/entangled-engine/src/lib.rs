pub mod context;
pub mod discover;
pub mod error;
pub mod filedb;
pub mod locate;
pub mod model;
pub mod parsing;
pub mod resolve;
pub mod stitch;
pub mod transaction;

pub use context::Context;
pub use error::{EngineError, Result};
pub use filedb::{FileDb, FileEntry, FileStatus};
pub use locate::{locate, Location};
pub use model::{BlockIndex, CodeBlock, Document, Origin, Prose, Reference, Segment};
pub use parsing::parse_document;
pub use resolve::{tangle, LineMapEntry, TangleOutput};
pub use stitch::{stitch, BlockDiff};
pub use transaction::{apply, plan_stitch, plan_tangle, Action, ApplyReport, DocEdit, Transaction};
