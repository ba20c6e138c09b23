use super::*;
use crate::{rx::rx_loop, tx::tx_loop};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    MutexGuard, PoisonError,
};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

/// Lower bound on how long teardown waits for RX and TX to exit
const MIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything guarded by the per-connection lock
#[derive(Debug, Default)]
pub(crate) struct StubQueues {
    pub table: PendingTransferTable,
    /// Finished transfers in completion order
    pub ready: VecDeque<ReadyTransfer>,
    pub unlinks: UnlinkQueue,
}

#[derive(Debug)]
enum FatalSlot {
    Clear,
    Pending(StubError),
    Consumed,
}

/// State shared by RX, TX and the completion callbacks
pub(crate) struct Shared {
    pub config: StubConfig,
    pub devid: u32,
    pub stack: Arc<dyn LocalUsbStack>,
    queues: Mutex<StubQueues>,
    tx_wakeup: Notify,
    stopping: AtomicBool,
    stop: watch::Sender<bool>,
    fatal: Mutex<FatalSlot>,
    fatal_raised: Notify,
}

impl Shared {
    pub fn new(config: StubConfig, devid: u32, stack: Arc<dyn LocalUsbStack>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            devid,
            stack,
            queues: Mutex::new(StubQueues::default()),
            tx_wakeup: Notify::new(),
            stopping: AtomicBool::new(false),
            stop,
            fatal: Mutex::new(FatalSlot::Clear),
            fatal_raised: Notify::new(),
        }
    }

    pub fn queues(&self) -> MutexGuard<'_, StubQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn completion(self: &Arc<Self>, id: UrbId) -> Completion {
        Completion {
            shared: Arc::downgrade(self),
            id,
        }
    }

    pub fn wake_tx(&self) {
        self.tx_wakeup.notify_one();
    }

    pub async fn tx_wakeup(&self) {
        self.tx_wakeup.notified().await
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Stop accepting work and wake both loops
    pub fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.send_replace(true);
        self.wake_tx();
    }

    /// Resolves once [Shared::begin_stop] has been called
    pub async fn stopped(&self) {
        let mut stop = self.subscribe_stop();
        loop {
            let stopped = *stop.borrow_and_update();
            if stopped || stop.changed().await.is_err() {
                return;
            }
        }
    }

    /// Report a connection-fatal error. Only the first one is kept.
    pub fn raise(&self, err: StubError) {
        let mut slot = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            FatalSlot::Clear => {
                *slot = FatalSlot::Pending(err);
                drop(slot);
                self.fatal_raised.notify_one();
            }
            _ => debug!("Ignoring follow-up error: {}", err),
        }
    }

    pub fn take_fatal(&self) -> Option<StubError> {
        let mut slot = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, FatalSlot::Consumed) {
            FatalSlot::Pending(err) => Some(err),
            other => {
                *slot = other;
                None
            }
        }
    }

    async fn fatal_error(&self) -> StubError {
        loop {
            let raised = self.fatal_raised.notified();
            if let Some(err) = self.take_fatal() {
                return err;
            }
            raised.await;
        }
    }

    /// Completion path: runs on whatever thread the local stack reports from
    fn on_urb_complete(&self, urb: Urb) {
        let id = urb.id;
        let mut queues = self.queues();

        let done = match queues.table.get_mut(id.seqnum) {
            Some(executor) => executor.on_local_completion(urb),
            None => {
                debug!(
                    "Completion for seqnum {} part {} after it was reclaimed",
                    id.seqnum, id.part
                );
                return;
            }
        };
        if !done {
            return;
        }
        let executor = match queues.table.take(id.seqnum) {
            Some(executor) => executor,
            None => return,
        };
        if self.is_stopping() {
            debug!("Releasing seqnum {} during teardown", id.seqnum);
            return;
        }

        match executor.finish() {
            Finished::Reply(ready) => {
                trace!("seqnum {} ready, status {}", ready.seqnum, ready.status);
                queues.ready.push_back(ready);
            }
            Finished::Unlinked(request) => {
                trace!(
                    "seqnum {} unlinked by {}, status {}",
                    request.unlink_seqnum,
                    request.seqnum,
                    request.status
                );
                queues.unlinks.push(request);
            }
        }
        drop(queues);
        self.wake_tx();
    }
}

/// Handle through which the local stack returns one URB
///
/// Holds only a weak reference to the connection: completing after the
/// connection is gone just drops the URB.
pub struct Completion {
    shared: Weak<Shared>,
    id: UrbId,
}

impl Completion {
    pub fn id(&self) -> UrbId {
        self.id
    }

    /// Return the URB with its result filled in. Never blocks on I/O.
    pub fn complete(self, mut urb: Urb) {
        urb.id = self.id;
        match self.shared.upgrade() {
            Some(shared) => shared.on_urb_complete(urb),
            None => trace!(
                "Completion for seqnum {} after connection closed",
                self.id.seqnum
            ),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}

/// What a teardown had to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// URBs the local stack was asked to cancel
    pub cancelled: usize,
    /// Transfers reclaimed without their completion arriving
    pub reclaimed: usize,
    /// Whether teardown had to abort RX or TX
    pub aborted_tasks: bool,
}

/// One exported-device session over one socket
pub struct Connection {
    shared: Arc<Shared>,
    rx: Mutex<Option<JoinHandle<()>>>,
    tx: Mutex<Option<JoinHandle<()>>>,
    teardown: tokio::sync::Mutex<Option<TeardownReport>>,
}

impl Connection {
    /// Split the socket and spawn the RX and TX tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(
        socket: S,
        devid: u32,
        stack: Arc<dyn LocalUsbStack>,
        config: StubConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(socket);
        let shared = Arc::new(Shared::new(config, devid, stack));
        let rx = tokio::spawn(rx_loop(shared.clone(), reader));
        let tx = tokio::spawn(tx_loop(shared.clone(), writer));
        debug!("Connection for devid {:#x} started", devid);

        Arc::new(Self {
            shared,
            rx: Mutex::new(Some(rx)),
            tx: Mutex::new(Some(tx)),
            teardown: tokio::sync::Mutex::new(None),
        })
    }

    /// Wait for the first connection-fatal error
    ///
    /// The error is handed out once; later callers wait forever.
    pub async fn fatal_error(&self) -> StubError {
        self.shared.fatal_error().await
    }

    /// Resolves once teardown has begun
    pub async fn stopped(&self) {
        self.shared.stopped().await
    }

    /// Transfers still in flight at the local stack
    pub fn pending_transfers(&self) -> usize {
        self.shared.queues().table.len()
    }

    /// Replies queued for TX
    pub fn queued_replies(&self) -> usize {
        let queues = self.shared.queues();
        queues.ready.len() + queues.unlinks.len()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.is_stopping()
    }

    /// Tear the connection down
    ///
    /// Stops RX, cancels every outstanding URB, waits a bounded time for the
    /// completions, then reclaims whatever is left without the local stack,
    /// drops queued replies, joins both tasks and so closes the socket.
    /// Safe to call repeatedly and concurrently; later calls wait for the
    /// first and return its report.
    pub async fn shutdown(&self) -> TeardownReport {
        let mut teardown = self.teardown.lock().await;
        if let Some(report) = *teardown {
            return report;
        }
        let mut report = TeardownReport::default();
        let config = &self.shared.config;

        self.shared.begin_stop();

        let outstanding = self.shared.queues().table.outstanding_urbs();
        report.cancelled = outstanding.len();
        for id in outstanding {
            self.shared.stack.cancel(id);
        }

        let mut attempts = 0;
        loop {
            let pending = self.shared.queues().table.len();
            if pending == 0 {
                break;
            }
            if attempts >= config.teardown_retries {
                let reclaimed = self.shared.queues().table.drain_all();
                report.reclaimed = reclaimed.len();
                warn!(
                    "Local stack did not return {} transfers, forcing reset",
                    reclaimed.len()
                );
                break;
            }
            attempts += 1;
            trace!("Waiting for {} transfers ({}/{})", pending, attempts, config.teardown_retries);
            tokio::time::sleep(config.teardown_retry_interval()).await;
        }

        {
            let mut queues = self.shared.queues();
            queues.ready.clear();
            queues.unlinks.clear();
        }

        let join_timeout = (config.teardown_retry_interval() * (config.teardown_retries + 1))
            .max(MIN_JOIN_TIMEOUT);
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let (rx_aborted, tx_aborted) = futures::future::join(
            join_or_abort("RX", rx, join_timeout),
            join_or_abort("TX", tx, join_timeout),
        )
        .await;
        report.aborted_tasks = rx_aborted || tx_aborted;

        info!(
            "Connection for devid {:#x} closed ({} cancelled, {} reclaimed)",
            self.shared.devid, report.cancelled, report.reclaimed
        );
        *teardown = Some(report);
        report
    }
}

/// Returns true if the task had to be aborted
async fn join_or_abort(side: &str, handle: Option<JoinHandle<()>>, timeout: Duration) -> bool {
    let mut handle = match handle {
        Some(handle) => handle,
        None => return false,
    };
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            warn!("[{}] Task ended abnormally: {}", side, err);
            false
        }
        Err(_) => {
            warn!("[{}] Task did not stop, aborting", side);
            handle.abort();
            let _ = handle.await;
            true
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // a connection dropped without teardown must not leave tasks behind
        self.shared.begin_stop();
        for handle in [&self.rx, &self.tx] {
            if let Some(handle) = handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }
    }
}
