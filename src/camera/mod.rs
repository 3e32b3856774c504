mod backend;
mod frame;
mod process;
mod source;

pub use backend::{candidates, BackendId, CaptureSettings};
pub use frame::{Frame, PixelLayout, CANONICAL_LAYOUT};
pub use process::SystemOpener;
pub use source::{probe_candidates, BackendState, CameraError, CameraSource};

#[cfg(test)]
pub(crate) use source::test as fakes;
