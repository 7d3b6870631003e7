//! The `dummy` protocol: a transparent passthrough.

use bytes::BytesMut;

use crate::{Protocol, ProtoError, RecvOutcome};

/// A protocol that moves bytes through unchanged.
///
/// Useful for testing the engine in isolation, and for running shroud as a
/// plain relay.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Dummy {}

impl Dummy {
    /// Construct a new passthrough instance.
    pub fn new() -> Self {
        Dummy {}
    }
}

impl Protocol for Dummy {
    fn handshake(&mut self, _out: &mut BytesMut) -> Result<(), ProtoError> {
        Ok(())
    }

    fn send(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<(), ProtoError> {
        out.extend_from_slice(input);
        input.clear();
        Ok(())
    }

    fn recv(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
    ) -> Result<RecvOutcome, ProtoError> {
        out.extend_from_slice(input);
        input.clear();
        Ok(RecvOutcome::Good)
    }
}
