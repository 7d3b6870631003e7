//! The `scramble` protocol: seeded keystream whitening.
//!
//! Each side draws a random 16-byte seed, announces it as its handshake
//! prelude, and whitens everything it transmits with a keystream derived
//! from that seed. The receiving side reads the peer's seed before
//! recovering any data. This hides plaintext patterns from naive
//! inspection; it is not encryption.

use bytes::{Buf, BytesMut};
use rand::Rng as _;

use crate::{Endpoint, Protocol, ProtoError, RecvOutcome};

/// Length of the seed each side sends as its prelude.
const SEED_LEN: usize = 16;

/// A xorshift64* generator producing one keystream byte at a time.
#[derive(Debug)]
struct Keystream {
    /// Current generator state. Never zero.
    state: u64,
    /// Bytes of the most recent generator output not yet consumed.
    pending: [u8; 8],
    /// How many bytes of `pending` have been consumed.
    used: usize,
}

impl Keystream {
    /// Derive a keystream from a 16-byte seed.
    fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        let lo = u64::from_le_bytes(seed[..8].try_into().expect("slice length mismatch"));
        let hi = u64::from_le_bytes(seed[8..].try_into().expect("slice length mismatch"));
        // xorshift needs a nonzero state.
        let state = (lo ^ hi.rotate_left(31)) | 1;
        Keystream {
            state,
            pending: [0; 8],
            used: 8,
        }
    }

    /// Return the next keystream byte.
    fn next_byte(&mut self) -> u8 {
        if self.used == 8 {
            self.state ^= self.state << 13;
            self.state ^= self.state >> 7;
            self.state ^= self.state << 17;
            let word = self.state.wrapping_mul(0x2545_F491_4F6C_DD1D);
            self.pending = word.to_le_bytes();
            self.used = 0;
        }
        let b = self.pending[self.used];
        self.used += 1;
        b
    }

    /// XOR the keystream over `data` in place.
    fn apply(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next_byte();
        }
    }
}

/// Per-connection state for the `scramble` protocol.
#[derive(Debug)]
pub struct Scramble {
    /// Which end of the link we are. The protocol is symmetric, but real
    /// transports aren't, and logging cares.
    endpoint: Endpoint,
    /// The seed we announce in our prelude.
    seed: [u8; SEED_LEN],
    /// Keystream for bytes we transmit.
    tx: Keystream,
    /// Keystream for bytes we receive; absent until the peer's seed
    /// arrives.
    rx: Option<Keystream>,
}

impl Scramble {
    /// Construct a fresh instance with a random seed.
    pub fn new(endpoint: Endpoint) -> Self {
        let mut seed = [0_u8; SEED_LEN];
        rand::rng().fill(&mut seed);
        Scramble {
            endpoint,
            seed,
            tx: Keystream::from_seed(&seed),
            rx: None,
        }
    }

    /// Which end of the link this instance serves.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Protocol for Scramble {
    fn handshake(&mut self, out: &mut BytesMut) -> Result<(), ProtoError> {
        out.extend_from_slice(&self.seed);
        Ok(())
    }

    fn send(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<(), ProtoError> {
        let mut chunk = input.split();
        self.tx.apply(&mut chunk);
        out.extend_from_slice(&chunk);
        Ok(())
    }

    fn recv(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
    ) -> Result<RecvOutcome, ProtoError> {
        if self.rx.is_none() {
            if input.len() < SEED_LEN {
                // Wait for the whole peer seed.
                return Ok(RecvOutcome::Good);
            }
            let mut seed = [0_u8; SEED_LEN];
            seed.copy_from_slice(&input[..SEED_LEN]);
            input.advance(SEED_LEN);
            self.rx = Some(Keystream::from_seed(&seed));
        }
        let rx = self.rx.as_mut().expect("receive keystream just installed");
        let mut chunk = input.split();
        rx.apply(&mut chunk);
        out.extend_from_slice(&chunk);
        Ok(RecvOutcome::Good)
    }
}
