pub mod archiver;
pub mod backend;
pub mod chunker;
pub mod crypto;
pub mod error;
pub mod index;
pub mod master_index;
pub mod pack;
pub mod packer_manager;
pub mod repository;
pub mod restorer;
pub mod snapshot;
pub mod tree;
pub mod types;

pub use archiver::{Archiver, ArchiverOptions, ErrorHandler, Shutdown, SnapshotOptions};
pub use backend::Backend;
pub use error::{Error, Result};
pub use repository::{InitOptions, Repository, RepositoryOptions};
pub use snapshot::Snapshot;
pub use types::*;
