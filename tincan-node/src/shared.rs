//! Sharing a node between tasks
//!
//! [`SharedNode`] wraps a [`CanOpenNode`] in a critical section mutex, so one task can drive
//! `step` while others make SDO requests to remote nodes and wait for their results. Each method
//! holds the lock only for the duration of a single call; the waiting futures register a waker
//! which is woken when `step` completes the transfer.

use core::{cell::RefCell, task::Poll};

use critical_section::Mutex;
use futures::future::poll_fn;
use tincan_common::{traits::CanSender, CanMessage};

use crate::{node::CanOpenNode, sdo_client::SdoClientError};

/// A [`CanOpenNode`] which can be used from several tasks
pub struct SharedNode<'a> {
    node: Mutex<RefCell<CanOpenNode<'a>>>,
}

impl core::fmt::Debug for SharedNode<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedNode").finish_non_exhaustive()
    }
}

/// Releases the client slot if the waiting future is dropped
struct TransferGuard<'s, 'a> {
    shared: &'s SharedNode<'a>,
}

impl Drop for TransferGuard<'_, '_> {
    fn drop(&mut self) {
        self.shared.with(|node| {
            node.with_sdo_client(|client, mut send| client.release(&mut send))
        });
    }
}

impl<'a> SharedNode<'a> {
    /// Wrap a node
    pub fn new(node: CanOpenNode<'a>) -> Self {
        Self {
            node: Mutex::new(RefCell::new(node)),
        }
    }

    /// Run `f` with exclusive access to the node
    pub fn with<R>(&self, f: impl FnOnce(&mut CanOpenNode<'a>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.node.borrow_ref_mut(cs)))
    }

    /// Queue a received frame, see [`CanOpenNode::rx`]
    pub fn rx(&self, msg: CanMessage) -> Result<(), CanMessage> {
        self.with(|node| node.rx(msg))
    }

    /// Run one step of the node, see [`CanOpenNode::step`]
    pub fn step(&self, elapsed_ms: u32, sender: &mut dyn CanSender) {
        self.with(|node| node.step(elapsed_ms, sender))
    }

    /// Wait for the running transfer. On success, the data of a read is copied into `buf`.
    async fn wait(&self, mut buf: Option<&mut [u8]>) -> Result<usize, SdoClientError> {
        let _guard = TransferGuard { shared: self };
        poll_fn(|cx| {
            self.with(|node| {
                node.with_sdo_client(|client, _| match client.poll_result(cx) {
                    Poll::Ready(Ok(len)) => {
                        if let Some(buf) = buf.as_deref_mut() {
                            let data = client.data(len);
                            buf[..data.len()].copy_from_slice(data);
                        }
                        Poll::Ready(Ok(len))
                    }
                    other => other,
                })
            })
        })
        .await
    }

    /// Write `data` to an object on `node_id` and wait for the server's acknowledgement
    ///
    /// Data of up to 4 bytes is sent expedited, longer data segmented.
    pub async fn write_sync(
        &self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), SdoClientError> {
        self.with(|node| {
            node.with_sdo_client(|client, mut send| {
                client.start_download(node_id, index, sub, data, timeout_ms, false, &mut send)
            })
        })?;
        self.wait(None).await.map(|_| ())
    }

    /// Read an object from `node_id` into `buf`, returning the number of bytes read
    ///
    /// Fails with [`SdoClientError::BufferTooSmall`] if the value does not fit in `buf`.
    pub async fn read_sync(
        &self,
        node_id: u8,
        index: u16,
        sub: u8,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, SdoClientError> {
        let max_len = buf.len();
        self.with(|node| {
            node.with_sdo_client(|client, mut send| {
                client.start_upload(node_id, index, sub, max_len, timeout_ms, &mut send)
            })
        })?;
        self.wait(Some(buf)).await
    }

    /// Write `data` to an object on `node_id` with a block download
    pub async fn block_write_sync(
        &self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), SdoClientError> {
        self.with(|node| {
            node.with_sdo_client(|client, mut send| {
                client.start_block_download(node_id, index, sub, data, timeout_ms, &mut send)
            })
        })?;
        self.wait(None).await.map(|_| ())
    }

    /// Read an object from `node_id` into `buf` with a block upload
    pub async fn block_read_sync(
        &self,
        node_id: u8,
        index: u16,
        sub: u8,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, SdoClientError> {
        let max_len = buf.len();
        self.with(|node| {
            node.with_sdo_client(|client, mut send| {
                client.start_block_upload(node_id, index, sub, max_len, timeout_ms, &mut send)
            })
        })?;
        self.wait(Some(buf)).await
    }
}
