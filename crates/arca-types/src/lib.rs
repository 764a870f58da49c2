pub mod cancel;
pub mod error;
pub mod handle;
pub mod id;

pub use cancel::CancelToken;
pub use error::{ArcaError, LockConflict, Result};
pub use handle::{FileType, Handle};
pub use id::Id;
