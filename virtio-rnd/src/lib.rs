// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Emulation of a virtio entropy device for a VMM device-model process.
//!
//! The device presents the guest with a standard virtio-rng PCI function
//! backed by one of two interchangeable backends: a user-space backend that
//! reads the host entropy source directly, and an in-kernel backend that
//! takes over virtqueue servicing through a control channel, avoiding the
//! user-space round trip on every guest request.

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod entropy;
pub mod offload;
pub mod queue;
pub mod rnd;
pub mod transport;

pub use self::backend::{EntropyBackend, KernelOffload, UserspaceBackend};
pub use self::config::{ReadFailurePolicy, RndConfig};
pub use self::entropy::EntropySource;
pub use self::offload::{KernelSession, SessionStatus};
pub use self::queue::{DescChain, VirtQueue};
pub use self::rnd::{detach, ConcurrencyPolicy, Rnd};
pub use self::transport::{InterruptMode, VirtioTransport};

use vm_memory::bitmap::AtomicBitmap;

pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<AtomicBitmap>;

// Device status register bits, written by the guest as negotiation
// progresses.
pub const DEVICE_ACKNOWLEDGE: u32 = 0x01;
pub const DEVICE_DRIVER: u32 = 0x02;
pub const DEVICE_DRIVER_OK: u32 = 0x04;
pub const DEVICE_FEATURES_OK: u32 = 0x08;
pub const DEVICE_FAILED: u32 = 0x80;

pub const VIRTIO_F_VERSION_1: u32 = 32;

/// Sentinel for a queue with no assigned MSI-X vector.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

/// Name the device goes by, both in logs and on the offload control
/// channel.
pub const DEVICE_NAME: &str = "virtio_rnd";

/// The entropy device exposes a single request virtqueue of fixed depth.
pub const QUEUE_SIZE: u16 = 64;
pub const NUM_QUEUES: u16 = 1;

// PCI identity of a transitional virtio entropy device.
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1af4;
pub const VIRTIO_PCI_DEVICE_ID_RND: u16 = 0x1005;
pub const PCI_CLASS_CRYPTO: u8 = 0x10;
pub const VIRTIO_TYPE_ENTROPY: u16 = 4;
