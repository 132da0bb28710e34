// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Session management for the in-kernel virtqueue-servicing backend.
//!
//! The session tracks the handshake with the kernel-resident backend over a
//! dedicated control channel: opened once at device attach, started when
//! the guest driver reports ready, stopped and reset on device reset or
//! detach. A session that fails to open or start parks in a terminal
//! failure state and the device keeps running on the user-space backend.

pub mod vbs;

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open the offload control channel: {0}")]
    OpenChannel(#[source] io::Error),
    #[error("Per-queue records rejected, indexes {indexes:?} out of range ({count} registered)")]
    InvalidQueueIndex { indexes: Vec<u16>, count: u16 },
    #[error("Failed to start the kernel backend: {0}")]
    Start(#[source] io::Error),
    #[error("Failed to stop the kernel backend: {0}")]
    Stop(#[source] io::Error),
    #[error("Failed to reset the kernel backend: {0}")]
    Reset(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the session stands on the single path
/// Initial → PreInit → {InitSuccess | InitFailed} → {Started | StartFailed}
/// → Initial. The failure states are terminal; nothing retries them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Initial,
    PreInit,
    InitSuccess,
    InitFailed,
    Started,
    StartFailed,
}

/// Identity of the device as announced to the kernel backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vm_id: u32,
    pub num_queues: u16,
    pub features: u64,
    /// Guest-visible kick register range the kernel backend traps.
    pub kick_addr: u64,
    pub kick_len: u64,
}

/// Ring and interrupt state of one virtqueue as announced to the kernel
/// backend. Built fresh for every handshake, never patched in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub index: u16,
    pub size: u16,
    pub pfn: u32,
    pub msix_vector: u16,
    pub msix_addr: u64,
    pub msix_data: u32,
}

/// Synchronous control channel to the kernel-resident backend. Calls may
/// block for unbounded time; none of them retry.
pub trait OffloadChannel: Send {
    fn start(&mut self, dev: &DeviceInfo, queues: &[QueueInfo]) -> io::Result<()>;
    fn stop(&mut self) -> io::Result<()>;
    fn reset(&mut self) -> io::Result<()>;
}

pub struct KernelSession {
    status: SessionStatus,
    channel: Option<Box<dyn OffloadChannel>>,
    records: Option<(DeviceInfo, Vec<QueueInfo>)>,
}

impl KernelSession {
    /// A new session sits in `PreInit` when offload was requested through
    /// the device options and in `Initial` otherwise.
    pub fn new(requested: bool) -> Self {
        KernelSession {
            status: if requested {
                SessionStatus::PreInit
            } else {
                SessionStatus::Initial
            },
            channel: None,
            records: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The records announced to the kernel backend, present only while the
    /// session is started.
    pub fn records(&self) -> Option<&(DeviceInfo, Vec<QueueInfo>)> {
        self.records.as_ref()
    }

    /// Adopt the outcome of opening the control channel.
    ///
    /// The channel is opened exactly once per device instance; a second
    /// open is a programming error.
    pub fn open(&mut self, channel: io::Result<Box<dyn OffloadChannel>>) -> Result<()> {
        assert!(
            self.status == SessionStatus::PreInit && self.channel.is_none(),
            "offload control channel opened twice"
        );

        match channel {
            Ok(channel) => {
                self.channel = Some(channel);
                self.status = SessionStatus::InitSuccess;
                debug!("virtio-rnd: offload control channel open");
                Ok(())
            }
            Err(e) => {
                self.status = SessionStatus::InitFailed;
                Err(Error::OpenChannel(e))
            }
        }
    }

    /// Hand virtqueue servicing to the kernel backend.
    ///
    /// Every per-queue record is validated (and its outcome logged) before
    /// the channel is touched; any out-of-range index aborts the handshake
    /// and leaves the session in `InitSuccess`. A start failure parks the
    /// session in `StartFailed`.
    pub fn start(&mut self, dev: DeviceInfo, queues: Vec<QueueInfo>) -> Result<()> {
        if self.status != SessionStatus::InitSuccess {
            warn!(
                "virtio-rnd: ignoring backend start in state {:?}",
                self.status
            );
            return Ok(());
        }

        let mut invalid = Vec::new();
        for queue in &queues {
            if queue.index >= dev.num_queues {
                error!(
                    "virtio-rnd: queue {} out of range ({} registered)",
                    queue.index, dev.num_queues
                );
                invalid.push(queue.index);
            } else {
                debug!(
                    "virtio-rnd: queue {}: size {} pfn {:#x} vector {:#x}",
                    queue.index, queue.size, queue.pfn, queue.msix_vector
                );
            }
        }
        if !invalid.is_empty() {
            return Err(Error::InvalidQueueIndex {
                indexes: invalid,
                count: dev.num_queues,
            });
        }

        let Some(channel) = self.channel.as_mut() else {
            warn!("virtio-rnd: backend start without a control channel");
            return Ok(());
        };

        match channel.start(&dev, &queues) {
            Ok(()) => {
                self.records = Some((dev, queues));
                self.status = SessionStatus::Started;
                info!("virtio-rnd: virtqueue servicing moved to the kernel");
                Ok(())
            }
            Err(e) => {
                self.status = SessionStatus::StartFailed;
                Err(Error::Start(e))
            }
        }
    }

    /// Tell the kernel backend to relinquish virtqueue servicing.
    pub fn stop(&mut self) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        channel.stop().map_err(Error::Stop)
    }

    /// Drop the descriptor records, then tell the kernel backend to reset.
    pub fn reset(&mut self) -> Result<()> {
        self.records = None;
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        channel.reset().map_err(Error::Reset)
    }

    /// Return a started session to `Initial`. Stop or reset failures are
    /// logged; the session goes back to `Initial` regardless.
    pub fn teardown(&mut self) {
        if self.status != SessionStatus::Started {
            return;
        }

        if let Err(e) = self.stop() {
            warn!("virtio-rnd: {}", e);
        }
        if let Err(e) = self.reset() {
            warn!("virtio-rnd: {}", e);
        }
        self.status = SessionStatus::Initial;
    }

    /// Drop the control channel handle. The underlying descriptor is
    /// closed exactly once no matter how often this is called.
    pub fn close_channel(&mut self) {
        if self.channel.take().is_some() {
            debug!("virtio-rnd: offload control channel closed");
        }
    }
}

pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// What a `TestChannel` observed, shared with the test body.
    #[derive(Default)]
    pub struct ChannelLog {
        pub starts: Vec<(DeviceInfo, Vec<QueueInfo>)>,
        pub stops: u32,
        pub resets: u32,
        pub closes: u32,
    }

    /// Control-channel double recording every call into a shared log.
    pub struct TestChannel {
        log: Arc<Mutex<ChannelLog>>,
        pub fail_start: bool,
        pub fail_stop: bool,
        pub fail_reset: bool,
    }

    impl TestChannel {
        pub fn new() -> (Self, Arc<Mutex<ChannelLog>>) {
            let log = Arc::new(Mutex::new(ChannelLog::default()));
            (
                TestChannel {
                    log: log.clone(),
                    fail_start: false,
                    fail_stop: false,
                    fail_reset: false,
                },
                log,
            )
        }
    }

    impl OffloadChannel for TestChannel {
        fn start(&mut self, dev: &DeviceInfo, queues: &[QueueInfo]) -> io::Result<()> {
            if self.fail_start {
                return Err(io::Error::from(io::ErrorKind::Other));
            }
            self.log
                .lock()
                .unwrap()
                .starts
                .push((dev.clone(), queues.to_vec()));
            Ok(())
        }

        fn stop(&mut self) -> io::Result<()> {
            if self.fail_stop {
                return Err(io::Error::from(io::ErrorKind::Other));
            }
            self.log.lock().unwrap().stops += 1;
            Ok(())
        }

        fn reset(&mut self) -> io::Result<()> {
            if self.fail_reset {
                return Err(io::Error::from(io::ErrorKind::Other));
            }
            self.log.lock().unwrap().resets += 1;
            Ok(())
        }
    }

    impl Drop for TestChannel {
        fn drop(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }
    }

    pub fn test_device_info() -> DeviceInfo {
        DeviceInfo {
            name: "virtio_rnd".to_owned(),
            vm_id: 3,
            num_queues: 1,
            features: 1 << crate::VIRTIO_F_VERSION_1,
            kick_addr: 0xc010,
            kick_len: 2,
        }
    }

    pub fn test_queue_info(index: u16) -> QueueInfo {
        QueueInfo {
            index,
            size: crate::QUEUE_SIZE,
            pfn: 0x1234,
            msix_vector: 0,
            msix_addr: 0xfee0_0000,
            msix_data: 0x4021,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn open_session() -> (KernelSession, std::sync::Arc<std::sync::Mutex<ChannelLog>>) {
        let mut session = KernelSession::new(true);
        let (channel, log) = TestChannel::new();
        session.open(Ok(Box::new(channel))).unwrap();
        (session, log)
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(KernelSession::new(false).status(), SessionStatus::Initial);
        assert_eq!(KernelSession::new(true).status(), SessionStatus::PreInit);
    }

    #[test]
    fn test_open_transitions() {
        let (session, _log) = open_session();
        assert_eq!(session.status(), SessionStatus::InitSuccess);

        let mut session = KernelSession::new(true);
        assert!(matches!(
            session.open(Err(io::Error::from(io::ErrorKind::NotFound))),
            Err(Error::OpenChannel(_))
        ));
        assert_eq!(session.status(), SessionStatus::InitFailed);
    }

    #[test]
    #[should_panic(expected = "opened twice")]
    fn test_double_open_is_fatal() {
        let (mut session, _log) = open_session();
        let (channel, _log2) = TestChannel::new();
        let _ = session.open(Ok(Box::new(channel)));
    }

    #[test]
    fn test_start_success() {
        let (mut session, log) = open_session();
        session
            .start(test_device_info(), vec![test_queue_info(0)])
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Started);
        assert!(session.records().is_some());

        let log = log.lock().unwrap();
        assert_eq!(log.starts.len(), 1);
        assert_eq!(log.starts[0].0, test_device_info());
        assert_eq!(log.starts[0].1, vec![test_queue_info(0)]);
    }

    #[test]
    fn test_start_rejects_bad_queue_index() {
        let (mut session, log) = open_session();
        let err = session
            .start(
                test_device_info(),
                vec![test_queue_info(0), test_queue_info(7)],
            )
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidQueueIndex { ref indexes, count: 1 } if indexes == &[7]
        ));
        // The handshake aborted before the channel was touched and the
        // session can still be started later.
        assert_eq!(session.status(), SessionStatus::InitSuccess);
        assert!(session.records().is_none());
        assert!(log.lock().unwrap().starts.is_empty());
    }

    #[test]
    fn test_start_failure_is_terminal() {
        let mut session = KernelSession::new(true);
        let (mut channel, log) = TestChannel::new();
        channel.fail_start = true;
        session.open(Ok(Box::new(channel))).unwrap();

        assert!(matches!(
            session.start(test_device_info(), vec![test_queue_info(0)]),
            Err(Error::Start(_))
        ));
        assert_eq!(session.status(), SessionStatus::StartFailed);

        // A later start attempt does not leave the failure state.
        session
            .start(test_device_info(), vec![test_queue_info(0)])
            .unwrap();
        assert_eq!(session.status(), SessionStatus::StartFailed);
        assert!(log.lock().unwrap().starts.is_empty());
    }

    #[test]
    fn test_teardown() {
        let (mut session, log) = open_session();
        session
            .start(test_device_info(), vec![test_queue_info(0)])
            .unwrap();

        session.teardown();
        assert_eq!(session.status(), SessionStatus::Initial);
        assert!(session.records().is_none());

        let counts = {
            let log = log.lock().unwrap();
            (log.stops, log.resets)
        };
        assert_eq!(counts, (1, 1));

        // Not started any more: teardown is a no-op.
        session.teardown();
        let log = log.lock().unwrap();
        assert_eq!((log.stops, log.resets), (1, 1));
    }

    #[test]
    fn test_close_channel_exactly_once() {
        let (mut session, log) = open_session();
        session.close_channel();
        session.close_channel();
        assert_eq!(log.lock().unwrap().closes, 1);
    }
}
