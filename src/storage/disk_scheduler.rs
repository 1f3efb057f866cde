use bytes::{Bytes, BytesMut};
use log::error;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use crate::buffer::PageId;
use crate::config::IoSchedulerConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_manager::DiskManager;

pub type DiskResultSender<T> = Sender<VellumResult<T>>;
pub type DiskResultReceiver<T> = Receiver<VellumResult<T>>;

/// Requests forwarded from the buffer pool to the background I/O workers.
#[derive(Debug)]
pub enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskResultSender<()>,
    },
    AllocatePage {
        result_sender: DiskResultSender<PageId>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskResultSender<()>,
    },
    Sync {
        result_sender: DiskResultSender<()>,
    },
    Shutdown,
}

/// Hands page I/O off to a small pool of worker threads. Each request
/// carries its own result channel; callers block on `recv` when they need
/// the response.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    dispatcher_thread: Option<thread::JoinHandle<()>>,
    worker_threads: Vec<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(disk_manager, IoSchedulerConfig::default())
    }

    pub fn new_with_config(disk_manager: Arc<DiskManager>, config: IoSchedulerConfig) -> Self {
        let worker_count = config.workers.max(1);
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();

        let mut worker_senders = Vec::with_capacity(worker_count);
        let mut worker_threads = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = mpsc::channel::<DiskRequest>();
            worker_senders.push(tx);
            let dm = disk_manager.clone();
            let handle = thread::Builder::new()
                .name(format!("disk-scheduler-worker-{}", i))
                .spawn(move || Self::worker_loop(rx, dm))
                .expect("failed to spawn disk scheduler worker");
            worker_threads.push(handle);
        }

        let dispatcher_thread = thread::Builder::new()
            .name("disk-scheduler-dispatcher".to_string())
            .spawn(move || Self::dispatcher_loop(request_receiver, worker_senders))
            .expect("failed to spawn disk scheduler dispatcher");

        Self {
            request_sender,
            dispatcher_thread: Some(dispatcher_thread),
            worker_threads,
        }
    }

    fn dispatcher_loop(receiver: Receiver<DiskRequest>, workers: Vec<Sender<DiskRequest>>) {
        let mut next = 0usize;
        while let Ok(request) = receiver.recv() {
            if matches!(request, DiskRequest::Shutdown) {
                for worker in &workers {
                    let _ = worker.send(DiskRequest::Shutdown);
                }
                break;
            }
            if workers[next].send(request).is_err() {
                error!("disk scheduler worker {} hung up", next);
                break;
            }
            next = (next + 1) % workers.len();
        }
    }

    fn worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager
                        .read_page(page_id)
                        .map(|data| BytesMut::from(&data[..]));
                    let _ = result_sender.send(result);
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.write_page(page_id, &data));
                }
                DiskRequest::AllocatePage { result_sender } => {
                    let _ = result_sender.send(disk_manager.allocate_page());
                }
                DiskRequest::DeallocatePage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.deallocate_page(page_id));
                }
                DiskRequest::Sync { result_sender } => {
                    let _ = result_sender.send(disk_manager.sync());
                }
                DiskRequest::Shutdown => break,
            }
        }
    }

    fn send(&self, request: DiskRequest) -> VellumResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| VellumError::Internal(format!("disk scheduler is down: {}", e)))
    }

    pub fn schedule_read(&self, page_id: PageId) -> VellumResult<DiskResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> VellumResult<DiskResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> VellumResult<DiskResultReceiver<PageId>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::AllocatePage { result_sender: tx })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(&self, page_id: PageId) -> VellumResult<DiskResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_sync(&self) -> VellumResult<DiskResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::Sync { result_sender: tx })?;
        Ok(rx)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.dispatcher_thread.take() {
            let _ = handle.join();
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
    }
}
