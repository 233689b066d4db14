//! Host entropy backed random source.

use rand::RngCore;
use rand::rngs::OsRng;

use crate::{PalError, RandomSource};

/// Random source reading from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn read_random(&self, buf: &mut [u8]) -> Result<(), PalError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|_| PalError::RandomUnavailable)
    }
}
