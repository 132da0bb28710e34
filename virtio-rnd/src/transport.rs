// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Narrow slice of the device-model framework consumed by the entropy
//! device: interrupt plumbing, PCI identity registration, MSI-X table
//! lookup and the generic virtio state reset. Everything behind this trait
//! is owned by the framework; the device never touches PCI or interrupt
//! internals directly.

use std::io;

use crate::{
    NUM_QUEUES, PCI_CLASS_CRYPTO, VIRTIO_PCI_DEVICE_ID_RND, VIRTIO_PCI_VENDOR_ID,
    VIRTIO_TYPE_ENTROPY,
};

/// How the host delivers interrupts to the guest for this function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptMode {
    /// Single-line legacy interrupts. Delivery may re-enter device code.
    IntX,
    /// Message signaled interrupts through the MSI-X table.
    Msix,
}

/// Address/data pair resolved from the MSI-X table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsixEntry {
    pub addr: u64,
    pub data: u32,
}

/// Guest-programmed state of one virtqueue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueParams {
    /// Guest frame number of the ring.
    pub pfn: u32,
    /// MSI-X vector index, `VIRTIO_MSI_NO_VECTOR` when unassigned.
    pub msix_vector: u16,
}

/// PCI configuration-space identity fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

impl Default for PciIds {
    /// Identity of a transitional virtio entropy device.
    fn default() -> Self {
        PciIds {
            vendor_id: VIRTIO_PCI_VENDOR_ID,
            device_id: VIRTIO_PCI_DEVICE_ID_RND,
            class: PCI_CLASS_CRYPTO,
            subsystem_vendor_id: VIRTIO_PCI_VENDOR_ID,
            subsystem_id: VIRTIO_TYPE_ENTROPY,
        }
    }
}

pub trait VirtioTransport: Send {
    /// Active interrupt-delivery mode for this function.
    fn interrupt_mode(&self) -> InterruptMode;

    /// Per-instance interrupt-subsystem initialization. Failure aborts
    /// device attach.
    fn setup_interrupts(&mut self) -> io::Result<()>;

    /// Register the device-identifying configuration-space fields.
    fn set_pci_ids(&mut self, ids: PciIds);

    /// Identifier of the VM this function belongs to.
    fn vm_id(&self) -> u32;

    /// Current guest-programmed state of queue `index`, `None` when the
    /// index is not registered.
    fn queue_params(&self, index: u16) -> Option<QueueParams>;

    /// Look up an MSI-X table entry by vector index.
    fn msix_entry(&self, vector: u16) -> Option<MsixEntry>;

    /// Guest-visible range of the queue notify register, handed to the
    /// kernel backend so it can trap kicks without a user-space exit.
    fn kick_range(&self) -> (u64, u64);

    /// Generic virtio device-state reset.
    fn reset_device_state(&mut self);
}

pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Framework state observed and mutated through a `TestTransport`,
    /// shared with the test body so it stays inspectable after the device
    /// takes ownership of the transport.
    pub struct TransportState {
        pub mode: InterruptMode,
        pub msix_table: Vec<MsixEntry>,
        pub queues: Vec<QueueParams>,
        pub pci_ids: Option<PciIds>,
        pub interrupt_setups: u32,
        pub fail_interrupt_setup: bool,
        pub device_resets: u32,
        pub vm: u32,
        pub kick_base: u64,
    }

    /// Counting framework double for lifecycle tests.
    pub struct TestTransport {
        state: Arc<Mutex<TransportState>>,
    }

    impl TestTransport {
        pub fn new(mode: InterruptMode) -> (Self, Arc<Mutex<TransportState>>) {
            let state = Arc::new(Mutex::new(TransportState {
                mode,
                msix_table: vec![MsixEntry::default(); 4],
                queues: vec![QueueParams::default(); NUM_QUEUES as usize],
                pci_ids: None,
                interrupt_setups: 0,
                fail_interrupt_setup: false,
                device_resets: 0,
                vm: 3,
                kick_base: 0xc000,
            }));
            (
                TestTransport {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl VirtioTransport for TestTransport {
        fn interrupt_mode(&self) -> InterruptMode {
            self.state.lock().unwrap().mode
        }

        fn setup_interrupts(&mut self) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_interrupt_setup {
                return Err(io::Error::from(io::ErrorKind::Other));
            }
            state.interrupt_setups += 1;
            Ok(())
        }

        fn set_pci_ids(&mut self, ids: PciIds) {
            self.state.lock().unwrap().pci_ids = Some(ids);
        }

        fn vm_id(&self) -> u32 {
            self.state.lock().unwrap().vm
        }

        fn queue_params(&self, index: u16) -> Option<QueueParams> {
            self.state.lock().unwrap().queues.get(index as usize).copied()
        }

        fn msix_entry(&self, vector: u16) -> Option<MsixEntry> {
            self.state
                .lock()
                .unwrap()
                .msix_table
                .get(vector as usize)
                .copied()
        }

        fn kick_range(&self) -> (u64, u64) {
            (self.state.lock().unwrap().kick_base + 16, 2)
        }

        fn reset_device_state(&mut self) {
            self.state.lock().unwrap().device_resets += 1;
        }
    }
}
