// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The two interchangeable backends servicing the entropy virtqueue.
//!
//! The user-space backend drains the queue itself, reading the host entropy
//! source into each guest buffer. The kernel-offload backend services the
//! queue from user space only until the guest driver reports ready; at that
//! point it hands the rings to the kernel-resident backend and the direct
//! notify path goes quiet. One backend is selected when the device is
//! created and never swapped.

use std::sync::{Arc, Mutex};

use crate::config::ReadFailurePolicy;
use crate::entropy::EntropySource;
use crate::offload::{DeviceInfo, KernelSession, QueueInfo, SessionStatus};
use crate::queue::VirtQueue;
use crate::transport::VirtioTransport;
use crate::{
    GuestMemoryMmap, DEVICE_DRIVER_OK, DEVICE_NAME, NUM_QUEUES, QUEUE_SIZE, VIRTIO_MSI_NO_VECTOR,
};

/// Device state a backend may consult when the guest writes the status
/// register.
pub struct HandshakeContext<'a> {
    pub transport: &'a dyn VirtioTransport,
    pub negotiated_features: u64,
}

pub trait EntropyBackend: Send {
    /// Service one guest kick.
    ///
    /// Returns the number of chains released in this batch, or `None` when
    /// virtqueue servicing belongs to the kernel and no batch completion
    /// must be raised.
    fn queue_notify(&mut self, mem: &GuestMemoryMmap, queue: &mut dyn VirtQueue) -> Option<usize>;

    /// React to a guest write to the device status register.
    fn set_status(&mut self, status: u32, ctx: &HandshakeContext);
}

/// Backend reading the host entropy source directly.
pub struct UserspaceBackend {
    entropy: EntropySource,
    on_read_failure: ReadFailurePolicy,
}

impl UserspaceBackend {
    pub fn new(entropy: EntropySource, on_read_failure: ReadFailurePolicy) -> Self {
        UserspaceBackend {
            entropy,
            on_read_failure,
        }
    }

    fn drain(&mut self, mem: &GuestMemoryMmap, queue: &mut dyn VirtQueue) -> usize {
        if !self.entropy.is_ready() {
            return 0;
        }

        let mut processed = 0;
        while queue.has_pending() {
            let Some(chain) = queue.pop() else {
                break;
            };

            match self.entropy.fill(mem, chain.addr, chain.len as usize) {
                Ok(len) => {
                    queue.release(chain.head_index, len as u32);
                    processed += 1;
                }
                Err(e) => {
                    // The source was validated at attach time and is not
                    // supposed to fail any more.
                    error!("{}: entropy read failed: {}", DEVICE_NAME, e);
                    queue.release(chain.head_index, 0);
                    processed += 1;
                    if self.on_read_failure == ReadFailurePolicy::Disable {
                        self.entropy.disable();
                        break;
                    }
                }
            }
        }

        processed
    }
}

impl EntropyBackend for UserspaceBackend {
    fn queue_notify(&mut self, mem: &GuestMemoryMmap, queue: &mut dyn VirtQueue) -> Option<usize> {
        Some(self.drain(mem, queue))
    }

    fn set_status(&mut self, _status: u32, _ctx: &HandshakeContext) {}
}

/// Backend that hands virtqueue servicing to the kernel once the guest
/// driver is ready, servicing from user space before that and whenever the
/// handshake fails.
pub struct KernelOffload {
    fallback: UserspaceBackend,
    session: Arc<Mutex<KernelSession>>,
}

impl KernelOffload {
    pub fn new(fallback: UserspaceBackend, session: Arc<Mutex<KernelSession>>) -> Self {
        KernelOffload { fallback, session }
    }

    fn build_records(&self, ctx: &HandshakeContext) -> (DeviceInfo, Vec<QueueInfo>) {
        let transport = ctx.transport;
        let (kick_addr, kick_len) = transport.kick_range();

        let dev = DeviceInfo {
            name: DEVICE_NAME.to_owned(),
            vm_id: transport.vm_id(),
            num_queues: NUM_QUEUES,
            features: ctx.negotiated_features,
            kick_addr,
            kick_len,
        };

        let mut queues = Vec::with_capacity(NUM_QUEUES as usize);
        for index in 0..NUM_QUEUES {
            let (pfn, msix_vector) = match transport.queue_params(index) {
                Some(params) => (params.pfn, params.msix_vector),
                None => (0, VIRTIO_MSI_NO_VECTOR),
            };

            let (msix_addr, msix_data) = if msix_vector != VIRTIO_MSI_NO_VECTOR {
                transport
                    .msix_entry(msix_vector)
                    .map(|entry| (entry.addr, entry.data))
                    .unwrap_or((0, 0))
            } else {
                (0, 0)
            };

            queues.push(QueueInfo {
                index,
                size: QUEUE_SIZE,
                pfn,
                msix_vector,
                msix_addr,
                msix_data,
            });
        }

        (dev, queues)
    }
}

impl EntropyBackend for KernelOffload {
    fn queue_notify(&mut self, mem: &GuestMemoryMmap, queue: &mut dyn VirtQueue) -> Option<usize> {
        if self.session.lock().unwrap().status() == SessionStatus::Started {
            warn!(
                "{}: kick delivered while the kernel owns virtqueue servicing",
                DEVICE_NAME
            );
            return None;
        }

        self.fallback.queue_notify(mem, queue)
    }

    /// The guest reporting driver-ready is the moment to kick off the
    /// kernel side.
    fn set_status(&mut self, status: u32, ctx: &HandshakeContext) {
        if status & DEVICE_DRIVER_OK == 0 {
            return;
        }

        let mut session = self.session.lock().unwrap();
        if session.status() != SessionStatus::InitSuccess {
            return;
        }

        let (dev, queues) = self.build_records(ctx);
        if let Err(e) = session.start(dev, queues) {
            warn!(
                "{}: handshake failed, staying on the user-space backend: {}",
                DEVICE_NAME, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::testing::TestChannel;
    use crate::queue::testing::TestQueue;
    use crate::transport::testing::TestTransport;
    use crate::transport::{InterruptMode, MsixEntry, QueueParams};
    use crate::{DEVICE_ACKNOWLEDGE, VIRTIO_F_VERSION_1};
    use std::io::Write;
    use vm_memory::{Bytes, GuestAddress};
    use vmm_sys_util::tempfile::TempFile;

    fn test_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    // A source holding `len` usable bytes of 0x5a (the probe consumes one
    // extra).
    fn source_with(len: usize) -> EntropySource {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all(&vec![0x5a; len + 1]).unwrap();
        EntropySource::open(tmp.as_path()).unwrap()
    }

    #[test]
    fn test_userspace_drains_queue() {
        let mem = test_mem();
        let mut queue = TestQueue::with_chains(0x1000, 4, 32);
        let mut backend =
            UserspaceBackend::new(source_with(4 * 32), ReadFailurePolicy::ZeroLength);

        let processed = backend.queue_notify(&mem, &mut queue).unwrap();
        assert_eq!(processed, 4);
        assert_eq!(
            queue.released,
            vec![(0, 32), (1, 32), (2, 32), (3, 32)]
        );

        let mut buf = [0u8; 32];
        mem.read_slice(&mut buf, GuestAddress(0x1000)).unwrap();
        assert_eq!(buf, [0x5a; 32]);
    }

    #[test]
    fn test_userspace_invalid_handle() {
        let mem = test_mem();
        let mut queue = TestQueue::with_chains(0x1000, 3, 16);
        let mut source = source_with(64);
        source.disable();
        let mut backend = UserspaceBackend::new(source, ReadFailurePolicy::ZeroLength);

        let processed = backend.queue_notify(&mem, &mut queue).unwrap();
        assert_eq!(processed, 0);
        assert!(queue.released.is_empty());
        assert!(queue.has_pending());
    }

    #[test]
    fn test_read_failure_zero_length() {
        let mem = test_mem();
        let mut queue = TestQueue::with_chains(0x1000, 3, 16);
        // One full chain's worth of data, then the source runs dry.
        let mut backend = UserspaceBackend::new(source_with(16), ReadFailurePolicy::ZeroLength);

        let processed = backend.queue_notify(&mem, &mut queue).unwrap();
        assert_eq!(processed, 3);
        assert_eq!(queue.released, vec![(0, 16), (1, 0), (2, 0)]);
    }

    #[test]
    fn test_read_failure_disable() {
        let mem = test_mem();
        let mut queue = TestQueue::with_chains(0x1000, 3, 16);
        let mut backend = UserspaceBackend::new(source_with(16), ReadFailurePolicy::Disable);

        let processed = backend.queue_notify(&mem, &mut queue).unwrap();
        assert_eq!(processed, 2);
        assert_eq!(queue.released, vec![(0, 16), (1, 0)]);
        assert!(queue.has_pending());

        // The handle is now invalid: later batches process nothing.
        let processed = backend.queue_notify(&mem, &mut queue).unwrap();
        assert_eq!(processed, 0);
        assert_eq!(queue.released.len(), 2);
    }

    fn offload_backend(started: bool) -> (KernelOffload, Arc<Mutex<KernelSession>>) {
        let mut session = KernelSession::new(true);
        let (channel, _log) = TestChannel::new();
        session.open(Ok(Box::new(channel))).unwrap();
        if started {
            session
                .start(
                    crate::offload::testing::test_device_info(),
                    vec![crate::offload::testing::test_queue_info(0)],
                )
                .unwrap();
        }
        let session = Arc::new(Mutex::new(session));
        let backend = KernelOffload::new(
            UserspaceBackend::new(source_with(64), ReadFailurePolicy::ZeroLength),
            session.clone(),
        );
        (backend, session)
    }

    #[test]
    fn test_offload_notify_disarmed_once_started() {
        let mem = test_mem();
        let mut queue = TestQueue::with_chains(0x1000, 2, 16);

        let (mut backend, _session) = offload_backend(true);
        assert!(backend.queue_notify(&mem, &mut queue).is_none());
        assert!(queue.released.is_empty());
        assert!(queue.completions.is_empty());
    }

    #[test]
    fn test_offload_notify_services_before_start() {
        let mem = test_mem();
        let mut queue = TestQueue::with_chains(0x1000, 2, 16);

        let (mut backend, _session) = offload_backend(false);
        assert_eq!(backend.queue_notify(&mem, &mut queue), Some(2));
        assert_eq!(queue.released, vec![(0, 16), (1, 16)]);
    }

    #[test]
    fn test_driver_ok_triggers_handshake() {
        let (transport, state) = TestTransport::new(InterruptMode::Msix);
        {
            let mut state = state.lock().unwrap();
            state.queues[0] = QueueParams {
                pfn: 0x1234,
                msix_vector: 1,
            };
            state.msix_table[1] = MsixEntry {
                addr: 0xfee0_0000,
                data: 0x4021,
            };
        }

        let (mut backend, session) = offload_backend(false);
        let ctx = HandshakeContext {
            transport: &transport,
            negotiated_features: 1 << VIRTIO_F_VERSION_1,
        };

        // Earlier status writes do nothing.
        backend.set_status(DEVICE_ACKNOWLEDGE, &ctx);
        assert_eq!(session.lock().unwrap().status(), SessionStatus::InitSuccess);

        backend.set_status(DEVICE_ACKNOWLEDGE | DEVICE_DRIVER_OK, &ctx);
        let session = session.lock().unwrap();
        assert_eq!(session.status(), SessionStatus::Started);

        let (dev, queues) = session.records().unwrap();
        assert_eq!(dev.name, DEVICE_NAME);
        assert_eq!(dev.vm_id, 3);
        assert_eq!(dev.num_queues, 1);
        assert_eq!(dev.features, 1 << VIRTIO_F_VERSION_1);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].pfn, 0x1234);
        assert_eq!(queues[0].msix_vector, 1);
        assert_eq!(queues[0].msix_addr, 0xfee0_0000);
        assert_eq!(queues[0].msix_data, 0x4021);
    }

    #[test]
    fn test_handshake_without_msix_vector() {
        let (transport, state) = TestTransport::new(InterruptMode::Msix);
        state.lock().unwrap().queues[0] = QueueParams {
            pfn: 0x88,
            msix_vector: VIRTIO_MSI_NO_VECTOR,
        };

        let (mut backend, session) = offload_backend(false);
        let ctx = HandshakeContext {
            transport: &transport,
            negotiated_features: 0,
        };
        backend.set_status(DEVICE_DRIVER_OK, &ctx);

        let session = session.lock().unwrap();
        assert_eq!(session.status(), SessionStatus::Started);
        let (_, queues) = session.records().unwrap();
        assert_eq!(queues[0].msix_vector, VIRTIO_MSI_NO_VECTOR);
        assert_eq!(queues[0].msix_addr, 0);
        assert_eq!(queues[0].msix_data, 0);
    }
}
