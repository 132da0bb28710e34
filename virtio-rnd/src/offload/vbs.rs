// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Client for the in-kernel virtio-rng backend service.
//!
//! The kernel side exposes one character device per backend type; the
//! device model describes itself and its rings through a pair of `set`
//! ioctls and then hands over virtqueue servicing entirely. All calls are
//! synchronous and unretried.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;

use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::{ioctl, ioctl_io_nr, ioctl_iow_nr};

use super::{DeviceInfo, OffloadChannel, QueueInfo};

const VBS_RND_PATH: &str = "/dev/vbs_rng";

const VBS_NAME_LEN: usize = 32;
const VBS_MAX_QUEUES: usize = 4;

const VBS_IOC: u32 = 0xaf;

ioctl_iow_nr!(VBS_SET_DEV, VBS_IOC, 0x30, VbsDevInfo);
ioctl_iow_nr!(VBS_SET_VQS, VBS_IOC, 0x31, VbsVqsInfo);
ioctl_io_nr!(VBS_STOP, VBS_IOC, 0x32);
ioctl_io_nr!(VBS_RESET_DEV, VBS_IOC, 0x33);

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VbsDevInfo {
    name: [u8; VBS_NAME_LEN],
    vmid: u32,
    nvq: u32,
    negotiated_features: u64,
    kick_start: u64,
    kick_len: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VbsVqInfo {
    qsize: u16,
    msix_idx: u16,
    pfn: u32,
    msix_addr: u64,
    msix_data: u32,
    _reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VbsVqsInfo {
    nvq: u32,
    _reserved: u32,
    vqs: [VbsVqInfo; VBS_MAX_QUEUES],
}

impl From<&DeviceInfo> for VbsDevInfo {
    fn from(dev: &DeviceInfo) -> Self {
        // The wire name is fixed width and NUL terminated.
        let mut name = [0u8; VBS_NAME_LEN];
        let bytes = dev.name.as_bytes();
        let len = bytes.len().min(VBS_NAME_LEN - 1);
        name[..len].copy_from_slice(&bytes[..len]);

        VbsDevInfo {
            name,
            vmid: dev.vm_id,
            nvq: u32::from(dev.num_queues),
            negotiated_features: dev.features,
            kick_start: dev.kick_addr,
            kick_len: dev.kick_len,
        }
    }
}

fn vqs_info(num_queues: u16, queues: &[QueueInfo]) -> VbsVqsInfo {
    let mut info = VbsVqsInfo {
        nvq: u32::from(num_queues),
        _reserved: 0,
        vqs: [VbsVqInfo::default(); VBS_MAX_QUEUES],
    };

    for queue in queues {
        let slot = &mut info.vqs[queue.index as usize];
        slot.qsize = queue.size;
        slot.msix_idx = queue.msix_vector;
        slot.pfn = queue.pfn;
        slot.msix_addr = queue.msix_addr;
        slot.msix_data = queue.msix_data;
    }

    info
}

#[inline]
fn ioctl_result(rc: i32) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Handle for running ioctls against the in-kernel virtio-rng backend.
pub struct VbsRng {
    fd: File,
}

impl VbsRng {
    /// Open the backend service character device.
    pub fn open() -> io::Result<Self> {
        Ok(VbsRng {
            fd: OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
                .open(VBS_RND_PATH)?,
        })
    }
}

impl OffloadChannel for VbsRng {
    fn start(&mut self, dev: &DeviceInfo, queues: &[QueueInfo]) -> io::Result<()> {
        let kdev = VbsDevInfo::from(dev);
        // SAFETY: the fd is a valid vbs_rng device and the return value is
        // checked.
        let ret = unsafe { ioctl_with_ref(&self.fd, VBS_SET_DEV(), &kdev) };
        ioctl_result(ret)?;

        let kvqs = vqs_info(dev.num_queues, queues);
        // SAFETY: as above.
        let ret = unsafe { ioctl_with_ref(&self.fd, VBS_SET_VQS(), &kvqs) };
        ioctl_result(ret)
    }

    fn stop(&mut self) -> io::Result<()> {
        // SAFETY: no data is transferred and the return value is checked.
        let ret = unsafe { ioctl::ioctl(&self.fd, VBS_STOP()) };
        ioctl_result(ret)
    }

    fn reset(&mut self) -> io::Result<()> {
        // SAFETY: no data is transferred and the return value is checked.
        let ret = unsafe { ioctl::ioctl(&self.fd, VBS_RESET_DEV()) };
        ioctl_result(ret)
    }
}
