use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("envelope too short: {0} bytes")]
    EnvelopeTooShort(usize),
    #[error("envelope length mismatch")]
    EnvelopeLengthMismatch,
    #[error("envelope field is not valid UTF-8")]
    EnvelopeEncoding,
}
