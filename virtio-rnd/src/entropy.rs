// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryError};

use crate::GuestMemoryMmap;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open the entropy source: {0}")]
    Open(#[source] io::Error),
    #[error("Probe read from the entropy source failed: {0}")]
    Probe(#[source] io::Error),
    #[error("Entropy source is not seeded: probe read returned no data")]
    NotReady,
    #[error("Entropy read returned no data after validation")]
    NoData,
    #[error("Failed to read entropy into guest memory: {0}")]
    GuestMemory(#[source] GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle on the host entropy source.
///
/// The source is opened non-blocking and probed once at device creation; a
/// probe that returns no data means the source is not seeded yet and the
/// device must not be attached. After a successful probe the handle is
/// assumed ready for the lifetime of the device.
pub struct EntropySource {
    file: File,
    disabled: bool,
}

impl EntropySource {
    /// Open and validate the entropy source at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(Error::Open)?;

        // Check that the source is seeded and non-blocking.
        let mut probe = [0u8; 1];
        let len = file.read(&mut probe).map_err(Error::Probe)?;
        if len == 0 {
            return Err(Error::NotReady);
        }

        Ok(EntropySource {
            file,
            disabled: false,
        })
    }

    pub fn is_ready(&self) -> bool {
        !self.disabled
    }

    /// Take the handle out of service. Later batches will complete without
    /// transferring any data.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    /// Read up to `len` bytes from the source directly into guest memory at
    /// `addr`, returning the number of bytes transferred.
    pub fn fill(&mut self, mem: &GuestMemoryMmap, addr: GuestAddress, len: usize) -> Result<usize> {
        let count = mem
            .read_from(addr, &mut self.file, len)
            .map_err(Error::GuestMemory)?;
        if count == 0 && len != 0 {
            return Err(Error::NoData);
        }

        Ok(count)
    }
}
