pub mod config;
pub use config::*;

pub mod flag;
pub use flag::*;

pub mod filename;
pub use filename::*;

pub mod timeseq;
pub use timeseq::*;

pub mod store;
pub use store::*;
