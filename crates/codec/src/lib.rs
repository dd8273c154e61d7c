//! Wire formats for pairing two peerup nodes.
//!
//! This crate is sans-IO: it encodes and decodes the human-transmissible
//! invite code, the fixed-size hello frames of the pairing handshake, and
//! the authenticated session frames that follow. The daemon owns all
//! sockets and timing; everything here operates on byte slices.

pub mod crypto;
pub mod invite;
pub mod pairing;

use std::{array::TryFromSliceError, str::Utf8Error};

/// Version byte of the current invite code and pairing handshake.
pub const VERSION: u8 = 0x02;

/// Length of an invite token in bytes.
pub const TOKEN_LEN: usize = 8;

/// Upper bound on any encrypted pairing frame, generous for a name
/// exchange and small enough to reject garbage early.
pub const MAX_FRAME: usize = 4096;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnsupportedVersion(u8),
    FrameTooLarge(usize),
    DecryptFailed,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput => write!(f, "invalid input"),
            Self::UnsupportedVersion(it) => write!(f, "unsupported version {it:#04x}"),
            Self::FrameTooLarge(it) => write!(f, "frame of {it} bytes exceeds limit"),
            Self::DecryptFailed => write!(f, "decrypt failed"),
            Self::Utf8Error(it) => write!(f, "{it}"),
            Self::TryFromSliceError(it) => write!(f, "{it}"),
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}
