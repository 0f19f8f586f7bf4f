pub mod local;

pub use local::LocalBackend;
