//! FIFO task queue backing host-async streams
//!
//! A single worker thread drains a channel in order, which supplies the
//! same contract as a device stream's host callback: a task enqueued now
//! runs only after everything enqueued before it has completed.

use crossbeam_channel::{bounded, unbounded, Sender};
use std::thread::JoinHandle;

use crate::driver::HostCallback;

enum Task {
    Run(HostCallback),
    /// Rendezvous: the worker acks once every earlier task has finished.
    Sync(Sender<()>),
    Shutdown,
}

/// Ordered host task queue.
pub struct TaskQueue {
    tx: Sender<Task>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn spawn() -> Self {
        let (tx, rx) = unbounded::<Task>();
        let worker = std::thread::Builder::new()
            .name("rocpool-hostq".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    match task {
                        Task::Run(callback) => callback(),
                        Task::Sync(ack) => {
                            let _ = ack.send(());
                        }
                        Task::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn host task queue worker");

        TaskQueue {
            tx,
            worker: Some(worker),
        }
    }

    /// Enqueue a task behind everything already submitted.
    pub fn enqueue(&self, callback: HostCallback) {
        // The worker only exits on Shutdown, so the send cannot fail while
        // the queue is alive.
        let _ = self.tx.send(Task::Run(callback));
    }

    /// Block until every task enqueued so far has run.
    pub fn synchronize(&self) {
        let (ack_tx, ack_rx) = bounded(0);
        if self.tx.send(Task::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(Task::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_run_in_fifo_order() {
        let queue = TaskQueue::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = Arc::clone(&order);
            queue.enqueue(Box::new(move || order.lock().unwrap().push(i)));
        }
        queue.synchronize();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_waits_for_prior_tasks() {
        let queue = TaskQueue::spawn();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        queue.enqueue(Box::new(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            done2.fetch_add(1, Ordering::SeqCst);
        }));
        queue.synchronize();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_joins_the_worker() {
        let queue = TaskQueue::spawn();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        queue.enqueue(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        drop(queue);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
