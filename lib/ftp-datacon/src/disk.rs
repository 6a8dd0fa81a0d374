/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::mpsc;

/// One create-if-needed-and-append unit of work. The buffer and the file
/// handle travel inside the request and come back inside the completion, so
/// exactly one side owns them at any instant.
pub struct WriteRequest {
    pub path: PathBuf,
    /// handle from an earlier write to the same target; `None` on the first
    /// write, in which case the file is created (truncating any old content)
    pub file: Option<File>,
    pub buffer: Vec<u8>,
    pub reply: mpsc::UnboundedSender<WriteFinished>,
}

/// Completion of a [`WriteRequest`], posted back into the requester's event
/// loop. On success the handle is returned for reuse on the next write.
pub struct WriteFinished {
    pub result: io::Result<()>,
    pub file: Option<File>,
    pub bytes_written: u64,
    pub buffer: Vec<u8>,
}

struct CloseRequest {
    path: PathBuf,
    file: Option<File>,
    delete: bool,
    close_index: u64,
}

enum DiskWork {
    Write(WriteRequest),
    Close(CloseRequest),
}

#[derive(Default)]
struct CloseRegistry {
    done: Mutex<HashSet<u64>>,
    cond: Condvar,
}

impl CloseRegistry {
    fn mark_done(&self, index: u64) {
        self.done.lock().unwrap().insert(index);
        self.cond.notify_all();
    }

    fn wait(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();
        loop {
            if done.contains(&index) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
    }
}

/// Disk write-back service: a dedicated worker thread executing file
/// create/write/close requests for data connections, with completion
/// notifications posted back into the requester's async context.
pub struct DiskWriteChannel {
    req_tx: Option<std_mpsc::Sender<DiskWork>>,
    closes: Arc<CloseRegistry>,
    next_close_index: AtomicU64,
    thread_handle: Option<JoinHandle<()>>,
}

impl DiskWriteChannel {
    pub fn spawn(thread_name: &str) -> io::Result<Self> {
        let (req_tx, req_rx) = std_mpsc::channel();
        let closes = Arc::new(CloseRegistry::default());
        let closes_t = Arc::clone(&closes);
        let thread_handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run_disk_thread(req_rx, closes_t))?;
        Ok(DiskWriteChannel {
            req_tx: Some(req_tx),
            closes,
            next_close_index: AtomicU64::new(0),
            thread_handle: Some(thread_handle),
        })
    }

    /// Queue one write unit. If the worker is gone the request (with its
    /// buffer) is handed back to the caller.
    pub fn send_write(&self, request: WriteRequest) -> Result<(), WriteRequest> {
        let Some(tx) = &self.req_tx else {
            return Err(request);
        };
        tx.send(DiskWork::Write(request)).map_err(|e| match e.0 {
            DiskWork::Write(r) => r,
            DiskWork::Close(_) => unreachable!(),
        })
    }

    /// Reserve an index for a close that will be scheduled later, so a
    /// waiter can already be parked on it.
    pub fn allocate_close_index(&self) -> u64 {
        self.next_close_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Schedule closing (and optionally deleting) a finished target file
    /// under a previously allocated index; waiters on that index are woken
    /// once the worker is done with it.
    pub fn send_close(&self, index: u64, path: PathBuf, file: Option<File>, delete: bool) {
        let Some(tx) = &self.req_tx else {
            return;
        };
        let _ = tx.send(DiskWork::Close(CloseRequest {
            path,
            file,
            delete,
            close_index: index,
        }));
    }

    /// Block until the close scheduled under `index` has completed, or the
    /// timeout elapses. This is the only blocking wait the engine exposes;
    /// it bounds how long a teardown may wait for the disk thread.
    pub fn wait_for_file_close(&self, index: u64, timeout: Duration) -> bool {
        self.closes.wait(index, timeout)
    }
}

impl Drop for DiskWriteChannel {
    fn drop(&mut self) {
        // disconnect first so the worker drains the queue and exits
        self.req_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_disk_thread(req_rx: std_mpsc::Receiver<DiskWork>, closes: Arc<CloseRegistry>) {
    while let Ok(work) = req_rx.recv() {
        match work {
            DiskWork::Write(req) => {
                let mut bytes_written = 0u64;
                let mut file = req.file;
                let result = do_write(&req.path, &mut file, &req.buffer, &mut bytes_written);
                // a dropped receiver means the transfer was cancelled; the
                // buffer and handle are released here in that case
                let _ = req.reply.send(WriteFinished {
                    result,
                    file,
                    bytes_written,
                    buffer: req.buffer,
                });
            }
            DiskWork::Close(req) => {
                drop(req.file);
                if req.delete {
                    if let Err(e) = std::fs::remove_file(&req.path) {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!("failed to delete {}: {e}", req.path.display());
                        }
                    }
                }
                closes.mark_done(req.close_index);
            }
        }
    }
}

fn do_write(
    path: &PathBuf,
    file: &mut Option<File>,
    buffer: &[u8],
    bytes_written: &mut u64,
) -> io::Result<()> {
    if file.is_none() {
        let created = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        *file = Some(created);
    }
    let f = file.as_mut().unwrap();
    f.write_all(buffer)?;
    *bytes_written = buffer.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_append_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        let disk = DiskWriteChannel::spawn("disk-test").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        disk.send_write(WriteRequest {
            path: path.clone(),
            file: None,
            buffer: b"hello ".to_vec(),
            reply: tx.clone(),
        })
        .unwrap_or_else(|_| panic!("worker gone"));
        let done = rx.recv().await.unwrap();
        assert!(done.result.is_ok());
        assert_eq!(done.bytes_written, 6);
        assert!(done.file.is_some());

        disk.send_write(WriteRequest {
            path: path.clone(),
            file: done.file,
            buffer: b"world".to_vec(),
            reply: tx,
        })
        .unwrap_or_else(|_| panic!("worker gone"));
        let done = rx.recv().await.unwrap();
        assert!(done.result.is_ok());

        let index = disk.allocate_close_index();
        disk.send_close(index, path.clone(), done.file, false);
        assert!(disk.wait_for_file_close(index, Duration::from_secs(5)));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn write_failure_reported() {
        let disk = DiskWriteChannel::spawn("disk-test").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        disk.send_write(WriteRequest {
            path: PathBuf::from("/nonexistent-dir-xyz/file.bin"),
            file: None,
            buffer: vec![0u8; 16],
            reply: tx,
        })
        .unwrap_or_else(|_| panic!("worker gone"));
        let done = rx.recv().await.unwrap();
        assert!(done.result.is_err());
        assert!(done.file.is_none());
        // buffer ownership comes back even on failure
        assert_eq!(done.buffer.len(), 16);
    }

    #[tokio::test]
    async fn close_with_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop-me.bin");
        let disk = DiskWriteChannel::spawn("disk-test").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        disk.send_write(WriteRequest {
            path: path.clone(),
            file: None,
            buffer: vec![1u8; 128],
            reply: tx,
        })
        .unwrap_or_else(|_| panic!("worker gone"));
        let done = rx.recv().await.unwrap();
        let index = disk.allocate_close_index();
        disk.send_close(index, path.clone(), done.file, true);
        assert!(disk.wait_for_file_close(index, Duration::from_secs(5)));
        assert!(!path.exists());
    }

    #[test]
    fn wait_for_unknown_close_times_out() {
        let disk = DiskWriteChannel::spawn("disk-test").unwrap();
        assert!(!disk.wait_for_file_close(1234, Duration::from_millis(50)));
    }
}
