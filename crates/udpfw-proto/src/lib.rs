pub mod assembler;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod frame;

pub use assembler::Assembler;
pub use envelope::Envelope;
pub use error::ProtoError;
pub use frame::{encode, Frame, FrameKind};
