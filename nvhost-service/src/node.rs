// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device node trait and the ioctl argument codec.
//!
//! Every argument block is a sequence of little-endian `u32` words. Nodes
//! decode their input with [`Args`] and append their output words to the
//! caller's buffer.

use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use nvhost_common::error::errno;
use nvhost_common::Host1xError;

/// Ioctl failure, reported to the caller as a negative errno.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoctlError {
    #[error(transparent)]
    Host(#[from] Host1xError),

    #[error("unknown ioctl {0}")]
    UnknownIoctl(u32),

    #[error("argument block too short")]
    Truncated,

    #[error("{0}")]
    Invalid(&'static str),
}

impl IoctlError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Host(e) => e.errno(),
            Self::UnknownIoctl(_) => errno::ENOTTY,
            Self::Truncated | Self::Invalid(_) => errno::EINVAL,
        }
    }
}

impl From<io::Error> for IoctlError {
    fn from(_: io::Error) -> Self {
        Self::Truncated
    }
}

pub type IoctlResult = Result<(), IoctlError>;

/// One open file of a device node.
pub trait NvhostNode: Send {
    fn name(&self) -> &str;

    /// Handle ioctl number `nr`. Output words are appended to `output`.
    fn ioctl(&mut self, nr: u32, input: &[u8], output: &mut Vec<u8>) -> IoctlResult;

    /// Release everything the file still holds.
    fn close(&mut self) {}
}

/// Little-endian word reader over an ioctl input block.
pub struct Args<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> Args<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { cur: Cursor::new(input) }
    }

    pub fn u32(&mut self) -> Result<u32, IoctlError> {
        Ok(self.cur.read_u32::<LittleEndian>()?)
    }

    /// A count about to drive an allocation, checked against the bytes left.
    pub fn count(&mut self, words_per_item: usize) -> Result<usize, IoctlError> {
        let n = self.u32()? as usize;
        let left = self.remaining() / 4;
        if n.saturating_mul(words_per_item) > left {
            return Err(IoctlError::Truncated);
        }
        Ok(n)
    }

    pub fn words(&mut self, n: usize) -> Result<Vec<u32>, IoctlError> {
        (0..n).map(|_| self.u32()).collect()
    }

    pub fn remaining(&self) -> usize {
        let len = self.cur.get_ref().len() as u64;
        len.saturating_sub(self.cur.position()) as usize
    }
}

pub fn put_u32(output: &mut Vec<u8>, val: u32) {
    // Writing to a Vec cannot fail.
    let _ = output.write_u32::<LittleEndian>(val);
}

pub fn put_words(output: &mut Vec<u8>, words: &[u32]) {
    for w in words {
        put_u32(output, *w);
    }
}

/// Decode an output block back into words.
pub fn to_words(bytes: &[u8]) -> Vec<u32> {
    let mut cur = Cursor::new(bytes);
    let mut words = Vec::with_capacity(bytes.len() / 4);
    while let Ok(w) = cur.read_u32::<LittleEndian>() {
        words.push(w);
    }
    words
}

/// Encode words as an input block.
pub fn from_words(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    put_words(&mut out, words);
    out
}
