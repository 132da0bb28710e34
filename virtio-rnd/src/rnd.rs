// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The virtio entropy device itself: attach, guest status transitions,
//! kick dispatch, reset and detach.

use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vm_memory::{GuestAddressSpace, GuestMemoryAtomic};

use crate::backend::{EntropyBackend, HandshakeContext, KernelOffload, UserspaceBackend};
use crate::config::RndConfig;
use crate::entropy::{self, EntropySource};
use crate::offload::vbs::VbsRng;
use crate::offload::{KernelSession, OffloadChannel, SessionStatus};
use crate::queue::VirtQueue;
use crate::transport::{InterruptMode, PciIds, VirtioTransport};
use crate::{GuestMemoryMmap, DEVICE_NAME, VIRTIO_F_VERSION_1};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Entropy source unavailable: {0}")]
    EntropySource(#[from] entropy::Error),
    #[error("Failed to initialize interrupt delivery: {0}")]
    SetupInterrupts(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How access to the instance state is serialized, picked once at attach
/// from the interrupt-delivery mode. With single-line interrupts the
/// delivery path may re-enter the device while a batch is being closed, so
/// the completion signal must be raised outside the instance lock; with
/// MSI-X no re-entry occurs and the whole batch stays serialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    Plain,
    Reentrant,
}

impl ConcurrencyPolicy {
    pub fn from_interrupt_mode(mode: InterruptMode) -> Self {
        match mode {
            InterruptMode::Msix => ConcurrencyPolicy::Plain,
            InterruptMode::IntX => ConcurrencyPolicy::Reentrant,
        }
    }
}

struct RndState {
    transport: Box<dyn VirtioTransport>,
    backend: Box<dyn EntropyBackend>,
    avail_features: u64,
    acked_features: u64,
}

/// Virtio device exposing host entropy to the guest.
pub struct Rnd {
    id: String,
    policy: ConcurrencyPolicy,
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
    // Lock order: instance state first, session second. The session lock is
    // the ordering point for the kernel control calls, which may block for
    // unbounded time and are therefore never issued under the state lock
    // from the teardown paths.
    state: Mutex<RndState>,
    session: Arc<Mutex<KernelSession>>,
}

impl Rnd {
    /// Create a new virtio entropy device backed by the source at `path`.
    pub fn new(
        id: String,
        path: &str,
        config: &RndConfig,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
        transport: Box<dyn VirtioTransport>,
    ) -> Result<Rnd> {
        Self::with_channel(id, path, config, mem, transport, || {
            VbsRng::open().map(|channel| Box::new(channel) as Box<dyn OffloadChannel>)
        })
    }

    /// Like [`Rnd::new`] with the offload control channel supplied by the
    /// caller. The channel is only opened when the configuration requested
    /// kernel offload, and only after the entropy source passed its probe.
    pub fn with_channel<F>(
        id: String,
        path: &str,
        config: &RndConfig,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
        mut transport: Box<dyn VirtioTransport>,
        open_channel: F,
    ) -> Result<Rnd>
    where
        F: FnOnce() -> io::Result<Box<dyn OffloadChannel>>,
    {
        // The offload request is recorded before the source is probed.
        let mut session = KernelSession::new(config.kernel);

        let entropy = EntropySource::open(path)?;

        let policy = ConcurrencyPolicy::from_interrupt_mode(transport.interrupt_mode());

        if session.status() == SessionStatus::PreInit {
            debug!("{}: kernel offload requested", DEVICE_NAME);
            if let Err(e) = session.open(open_channel()) {
                warn!("{}: {}", DEVICE_NAME, e);
            }
        }

        let userspace = UserspaceBackend::new(entropy, config.on_read_failure);
        let session = Arc::new(Mutex::new(session));
        let backend: Box<dyn EntropyBackend> =
            if session.lock().unwrap().status() == SessionStatus::InitSuccess {
                Box::new(KernelOffload::new(userspace, session.clone()))
            } else {
                if config.kernel {
                    debug!("{}: falling back to the user-space backend", DEVICE_NAME);
                }
                Box::new(userspace)
            };

        transport.set_pci_ids(PciIds::default());
        transport
            .setup_interrupts()
            .map_err(Error::SetupInterrupts)?;

        Ok(Rnd {
            id,
            policy,
            mem,
            state: Mutex::new(RndState {
                transport,
                backend,
                avail_features: 1 << VIRTIO_F_VERSION_1,
                acked_features: 0,
            }),
            session,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn concurrency_policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.lock().unwrap().status()
    }

    pub fn features(&self) -> u64 {
        self.state.lock().unwrap().avail_features
    }

    pub fn ack_features(&self, value: u64) {
        let mut state = self.state.lock().unwrap();

        let mut v = value;
        // Check if the guest is ACK'ing a feature that we didn't claim to
        // have.
        let unrequested_features = v & !state.avail_features;
        if unrequested_features != 0 {
            warn!("Received acknowledge request for unknown feature.");
            v &= !unrequested_features;
        }
        state.acked_features |= v;
    }

    pub fn acked_features(&self) -> u64 {
        self.state.lock().unwrap().acked_features
    }

    /// Guest write to the device status register.
    pub fn set_status(&self, status: u32) {
        let mut state = self.state.lock().unwrap();
        let RndState {
            transport,
            backend,
            acked_features,
            ..
        } = &mut *state;

        let ctx = HandshakeContext {
            transport: &**transport,
            negotiated_features: *acked_features,
        };
        backend.set_status(status, &ctx);
    }

    /// One guest kick on the request queue.
    pub fn queue_notify(&self, queue: &mut dyn VirtQueue) {
        let mem = self.mem.memory();

        match self.policy {
            ConcurrencyPolicy::Plain => {
                let mut state = self.state.lock().unwrap();
                if let Some(processed) = state.backend.queue_notify(&mem, queue) {
                    queue.complete(processed > 0);
                }
            }
            ConcurrencyPolicy::Reentrant => {
                let processed = self.state.lock().unwrap().backend.queue_notify(&mem, queue);
                if let Some(processed) = processed {
                    queue.complete(processed > 0);
                }
            }
        }
    }

    /// Device reset requested through the transport.
    pub fn reset(&self) {
        debug!("{}: device reset requested", DEVICE_NAME);

        self.state.lock().unwrap().transport.reset_device_state();

        let mut session = self.session.lock().unwrap();
        if session.status() == SessionStatus::Started {
            debug!("{}: kernel backend reset requested", DEVICE_NAME);
            session.teardown();
        }
    }

    /// Detach path: stop a running kernel session and close its control
    /// channel.
    pub fn shutdown(&self) {
        let mut session = self.session.lock().unwrap();
        if session.status() == SessionStatus::Started {
            debug!("{}: stopping the kernel backend", DEVICE_NAME);
            session.teardown();
        }
        session.close_channel();
    }
}

/// Release a device instance. Absent devices detach as a no-op.
pub fn detach(device: Option<Rnd>) {
    let Some(device) = device else {
        debug!("{}: detach without a device instance", DEVICE_NAME);
        return;
    };

    device.shutdown();
}
