use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::Error;
use crate::request::{DeliverFn, QueuedRequest};
use crate::util::lock_unpoisoned;

/// Where success/error callbacks run. Callers hand in their event loop;
/// the queue never invokes listeners on its own dispatcher threads.
pub trait DeliveryExecutor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs jobs inline on the posting thread. Listeners fire on dispatcher
/// threads; useful for tests and headless tools.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateExecutor;

impl DeliveryExecutor for ImmediateExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

/// A dedicated delivery thread draining a channel in posting order; the
/// default executor when the caller does not supply one.
pub struct ThreadExecutor {
    sender: Mutex<Option<mpsc::Sender<Box<dyn FnOnce() + Send>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadExecutor {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let handle = std::thread::Builder::new()
            .name("fetchq-delivery".to_owned())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
                debug!("delivery thread stopped");
            })
            .ok();
        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(handle),
        }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryExecutor for ThreadExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        let sender = lock_unpoisoned(&self.sender);
        match sender.as_ref().map(|sender| sender.send(job)) {
            Some(Ok(())) => {}
            _ => debug!("delivery thread gone; dropping job"),
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        lock_unpoisoned(&self.sender).take();
        if let Some(handle) = lock_unpoisoned(&self.handle).take() {
            let _ = handle.join();
        }
    }
}

/// Posts delivery closures onto the executor. A closure checks the cancel
/// flag, invokes the listener, runs optional afterwork, and finishes the
/// request unless the delivery was an intermediate (soft-expired) one.
pub(crate) struct ResponseDelivery {
    executor: Arc<dyn DeliveryExecutor>,
}

impl ResponseDelivery {
    pub(crate) fn new(executor: Arc<dyn DeliveryExecutor>) -> Self {
        Self { executor }
    }

    pub(crate) fn post_response(
        &self,
        request: Arc<dyn QueuedRequest>,
        deliver: DeliverFn,
        intermediate: bool,
        afterwork: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.executor.execute(Box::new(move || {
            if request.is_canceled() {
                request.finish("canceled-at-delivery");
                return;
            }
            deliver();
            if let Some(afterwork) = afterwork {
                afterwork();
            }
            if !intermediate {
                request.finish("done");
            }
        }));
    }

    pub(crate) fn post_error(&self, request: Arc<dyn QueuedRequest>, error: Error) {
        self.executor.execute(Box::new(move || {
            if request.is_canceled() {
                request.finish("canceled-at-delivery");
                return;
            }
            request.invoke_error_listener(&error);
            request.finish("done-with-error");
        }));
    }
}
