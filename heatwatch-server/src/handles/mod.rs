mod reading_handle;
mod sse_handle;
mod status_handle;

pub use reading_handle::*;
pub use sse_handle::*;
pub use status_handle::*;
