//! The sharded pool of single-threaded workers.
//!
//! Each worker is an OS thread running a current-thread tokio runtime
//! with a `LocalSet`. Everything a worker owns (its rooms, the sessions
//! reading on it, its timers) is single-threaded; the only way in from
//! outside is the MPMC command queue. Commands from one submitter arrive
//! in order; commands from different submitters interleave.
//!
//! Session reads and timers are `spawn_local` tasks on the worker's
//! local set; they interleave with command processing only at await
//! points, so no two callbacks ever run in parallel on one worker.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::room::Room;

/// A closure executed on the worker thread with access to its state.
pub type Task = Box<dyn FnOnce(&Rc<WorkerLocal>) + Send>;

enum Command {
    Run(Task),
    /// Must be the last command ever posted.
    Close,
}

/// State owned by exactly one worker thread.
pub struct WorkerLocal {
    pub index: usize,
    pub handle: WorkerHandle,
    rooms: RefCell<FxHashMap<u32, Rc<Room>>>,
}

impl WorkerLocal {
    pub fn room(&self, id: u32) -> Option<Rc<Room>> {
        self.rooms.borrow().get(&id).cloned()
    }

    pub fn insert_room(&self, room: Rc<Room>) {
        self.rooms.borrow_mut().insert(room.id(), room);
    }

    /// Tears a room down if nothing keeps it alive.
    pub fn retire_room(&self, id: u32) {
        let room = self.rooms.borrow().get(&id).cloned();
        if let Some(room) = room {
            if !room.keep_alive() {
                room.destroy();
                self.rooms.borrow_mut().remove(&id);
            }
        }
    }
}

/// Cheap, thread-safe address of one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    commands: flume::Sender<Command>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Posts a command; `false` if the worker has shut down.
    pub fn post(&self, task: impl FnOnce(&Rc<WorkerLocal>) + Send + 'static) -> bool {
        self.commands.send(Command::Run(Box::new(task))).is_ok()
    }
}

pub struct ThreadPool {
    workers: Vec<WorkerHandle>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `count` workers.
    pub fn new(count: usize) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = flume::unbounded();
            let handle = WorkerHandle {
                index,
                commands: tx,
            };
            let worker_handle = handle.clone();
            let thread = std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || run_worker(index, worker_handle, rx))?;
            workers.push(handle);
            threads.push(thread);
        }
        Ok(Self { workers, threads })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, index: usize) -> &WorkerHandle {
        &self.workers[index]
    }

    /// Stops every worker and joins the threads. The close marker must be
    /// the last command each queue ever sees.
    pub fn shutdown(self) {
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Close);
        }
        for thread in self.threads {
            if thread.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

fn run_worker(index: usize, handle: WorkerHandle, rx: flume::Receiver<Command>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("worker {index} failed to build its runtime: {e}");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    let ctx = Rc::new(WorkerLocal {
        index,
        handle,
        rooms: RefCell::new(FxHashMap::default()),
    });

    runtime.block_on(local.run_until(async move {
        while let Ok(command) = rx.recv_async().await {
            match command {
                Command::Run(task) => task(&ctx),
                Command::Close => {
                    debug_assert!(rx.is_empty(), "close must be the last command posted");
                    break;
                }
            }
        }
        debug!("worker {index} draining");
    }));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn commands_from_one_submitter_run_in_order() {
        let pool = ThreadPool::new(2).unwrap();
        let (done_tx, done_rx) = flume::bounded(1);
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..100 {
            let counter = counter.clone();
            let done = if i == 99 { Some(done_tx.clone()) } else { None };
            pool.worker(0).post(move |_| {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, i, "command ran out of order");
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
        }

        done_rx.recv().unwrap();
        pool.shutdown();
    }

    #[test]
    fn workers_accept_local_tasks() {
        let pool = ThreadPool::new(1).unwrap();
        let (done_tx, done_rx) = flume::bounded(1);
        pool.worker(0).post(move |_| {
            tokio::task::spawn_local(async move {
                let _ = done_tx.send(());
            });
        });
        done_rx.recv().unwrap();
        pool.shutdown();
    }
}
