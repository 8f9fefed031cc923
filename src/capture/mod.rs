pub mod frame;
pub mod session;
pub mod source;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use session::{CaptureRequest, CaptureSession, SessionState};
pub use source::{alternatives, select, ParamValue, Platform, SourceDescriptor};
