// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Narrow view of the virtqueue servicing interface the generic virtio
//! transport exposes to device models. Ring layout, descriptor parsing and
//! interrupt suppression all live on the transport side; the device only
//! pops chains, releases them with a byte count, and closes the batch.

use vm_memory::GuestAddress;

/// One guest request popped from the ring.
///
/// Entropy requests carry exactly one device-writable buffer segment, so a
/// chain reduces to the head descriptor index and that buffer's location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescChain {
    pub head_index: u16,
    pub addr: GuestAddress,
    pub len: u32,
}

pub trait VirtQueue: Send {
    /// Whether the guest has submitted chains not yet popped.
    fn has_pending(&self) -> bool;

    /// Pop the next pending chain, expecting a single buffer segment.
    fn pop(&mut self) -> Option<DescChain>;

    /// Return a chain to the guest, reporting how many bytes were written.
    fn release(&mut self, head_index: u16, len: u32);

    /// Close the current batch. The transport injects a guest interrupt
    /// only when `processed` says at least one chain was released.
    fn complete(&mut self, processed: bool);
}

pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Queue double for unit tests: hands out scripted chains and records
    /// what the device does with them.
    pub struct TestQueue {
        pending: VecDeque<DescChain>,
        pub released: Vec<(u16, u32)>,
        pub completions: Vec<bool>,
    }

    impl TestQueue {
        pub fn new() -> Self {
            TestQueue {
                pending: VecDeque::new(),
                released: Vec::new(),
                completions: Vec::new(),
            }
        }

        /// Queue `count` chains of `len` bytes each, laid out back to back
        /// in guest memory starting at `base`.
        pub fn with_chains(base: u64, count: u16, len: u32) -> Self {
            let mut queue = Self::new();
            for i in 0..count {
                queue.pending.push_back(DescChain {
                    head_index: i,
                    addr: GuestAddress(base + u64::from(i) * u64::from(len)),
                    len,
                });
            }
            queue
        }

        pub fn push_chain(&mut self, chain: DescChain) {
            self.pending.push_back(chain);
        }
    }

    impl Default for TestQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VirtQueue for TestQueue {
        fn has_pending(&self) -> bool {
            !self.pending.is_empty()
        }

        fn pop(&mut self) -> Option<DescChain> {
            self.pending.pop_front()
        }

        fn release(&mut self, head_index: u16, len: u32) {
            self.released.push((head_index, len));
        }

        fn complete(&mut self, processed: bool) {
            self.completions.push(processed);
        }
    }
}
