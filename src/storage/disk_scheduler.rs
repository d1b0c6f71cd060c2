use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use log::error;

use crate::buffer::PageId;
use crate::config::IoSchedulerConfig;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::disk_manager::DiskManager;

pub type DiskCommandResultSender<T> = Sender<VellumDBResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<VellumDBResult<T>>;

/// Commands sent from the buffer manager to the I/O workers.
#[derive(Debug)]
enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskCommandResultSender<()>,
    },
    AllocatePage {
        result_sender: DiskCommandResultSender<PageId>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<()>,
    },
    Shutdown,
}

/// Hands page I/O to a pool of worker threads.
///
/// Callers get a one-shot receiver per request and block on it; workers run
/// against the shared `DiskManager`. A dispatcher thread forwards requests to
/// workers round-robin so a slow read cannot starve the submission channel.
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

        DiskScheduler {
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
            // round-robin; fall through to the next worker if one died
            let mut pending = request;
            let mut sent = false;
            for _ in 0..workers.len() {
                let target = next % workers.len();
                next = next.wrapping_add(1);
                match workers[target].send(pending) {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(mpsc::SendError(returned)) => pending = returned,
                }
            }
            if !sent {
                break;
            }
        }
    }

    fn worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager.read_page(page_id);
                    let _ = result_sender.send(result);
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let result = disk_manager.write_page(page_id, &data);
                    if let Err(e) = &result {
                        error!("disk write for page {} failed: {}", page_id, e);
                    }
                    let _ = result_sender.send(result);
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
                DiskRequest::Shutdown => break,
            }
        }
    }

    fn submit(&self, request: DiskRequest) -> VellumDBResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| VellumDBError::Internal(format!("disk scheduler is down: {}", e)))
    }

    pub fn schedule_read(
        &self,
        page_id: PageId,
    ) -> VellumDBResult<DiskCommandResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.submit(DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> VellumDBResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.submit(DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> VellumDBResult<DiskCommandResultReceiver<PageId>> {
        let (tx, rx) = mpsc::channel();
        self.submit(DiskRequest::AllocatePage { result_sender: tx })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(
        &self,
        page_id: PageId,
    ) -> VellumDBResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.submit(DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(dispatcher) = self.dispatcher_thread.take() {
            let _ = dispatcher.join();
        }
        for worker in self.worker_threads.drain(..) {
            let _ = worker.join();
        }
    }
}
