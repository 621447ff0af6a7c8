//! Scripted [`UsbTransport`] mock for unit tests, grounded in the queued
//! request/response style of
//! `examples/other_examples/*dfu-core__tests-mock.rs.rs`, simplified to a
//! plain call-count/response-queue double instead of a full state machine —
//! each module's tests script only the bytes relevant to what it exercises.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Error;
use crate::request::DfuState;
use crate::transport::UsbTransport;

/// A single queued GETSTATUS reply.
struct QueuedStatus {
    status: u8,
    poll_timeout: u32,
    state: DfuState,
}

#[derive(Default)]
struct MockInner {
    statuses: VecDeque<QueuedStatus>,
    abort_count: u32,
    clrstatus_count: u32,
    detach_count: u32,
    reset_count: u32,
    dnload_writes: Vec<(u16, Vec<u8>)>,
    upload_reads: VecDeque<Vec<u8>>,
}

/// Call-counting, response-queueing stand-in for a real USB device.
pub struct MockTransport {
    inner: RefCell<MockInner>,
}

const DETACH: u8 = 0x00;
const DNLOAD: u8 = 0x01;
const UPLOAD: u8 = 0x02;
const GETSTATUS: u8 = 0x03;
const CLRSTATUS: u8 = 0x04;
const GETSTATE: u8 = 0x05;
const ABORT: u8 = 0x06;

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(MockInner::default()),
        }
    }

    /// Queues a GETSTATUS response to be returned by the next GETSTATUS call.
    pub fn push_status(&self, state: DfuState, poll_timeout: u32) {
        self.inner.borrow_mut().statuses.push_back(QueuedStatus {
            status: 0,
            poll_timeout,
            state,
        });
    }

    /// Queues bytes to be returned by the next UPLOAD call.
    pub fn push_upload(&self, data: &[u8]) {
        self.inner
            .borrow_mut()
            .upload_reads
            .push_back(data.to_vec());
    }

    pub fn abort_count(&self) -> u32 {
        self.inner.borrow().abort_count
    }

    pub fn clrstatus_count(&self) -> u32 {
        self.inner.borrow().clrstatus_count
    }

    pub fn detach_count(&self) -> u32 {
        self.inner.borrow().detach_count
    }

    pub fn reset_count(&self) -> u32 {
        self.inner.borrow().reset_count
    }

    pub fn dnload_writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.inner.borrow().dnload_writes.clone()
    }
}

impl UsbTransport for MockTransport {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, Error> {
        let mut inner = self.inner.borrow_mut();
        match request {
            DETACH => inner.detach_count += 1,
            CLRSTATUS => inner.clrstatus_count += 1,
            ABORT => inner.abort_count += 1,
            DNLOAD => inner.dnload_writes.push((value, data.to_vec())),
            other => panic!("unscripted control_write request {other:#04x}"),
        }
        Ok(data.len())
    }

    fn control_read(
        &self,
        request: u8,
        _value: u16,
        _index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, Error> {
        let mut inner = self.inner.borrow_mut();
        match request {
            GETSTATUS => {
                let q = inner
                    .statuses
                    .pop_front()
                    .unwrap_or_else(|| panic!("no scripted GETSTATUS response left"));
                data[0] = q.status;
                data[1] = (q.poll_timeout & 0xff) as u8;
                data[2] = ((q.poll_timeout >> 8) & 0xff) as u8;
                data[3] = ((q.poll_timeout >> 16) & 0xff) as u8;
                data[4] = q.state as u8;
                data[5] = 0;
                Ok(6)
            }
            GETSTATE => {
                let q = inner
                    .statuses
                    .pop_front()
                    .unwrap_or_else(|| panic!("no scripted GETSTATE response left"));
                data[0] = q.state as u8;
                Ok(1)
            }
            UPLOAD => {
                let chunk = inner
                    .upload_reads
                    .pop_front()
                    .unwrap_or_else(|| panic!("no scripted UPLOAD response left"));
                let n = chunk.len().min(data.len());
                data[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            other => panic!("unscripted control_read request {other:#04x}"),
        }
    }

    fn claim_interface(&self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn release_interface(&self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn set_alternate_setting(&self, _interface: u8, _alt_setting: u8) -> Result<(), Error> {
        Ok(())
    }

    fn reset(&self) -> Result<(), Error> {
        self.inner.borrow_mut().reset_count += 1;
        Ok(())
    }
}
