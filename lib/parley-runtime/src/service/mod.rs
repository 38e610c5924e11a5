// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Long-running service lifecycle.
//!
//! A service is a [`Machine`] driven by [`spawn`]. Its behaviour is a sequence
//! of states; each call to [`Machine::run_state`] blocks until the state can
//! hand over to the next one, or returns `None` to terminate. Two latches stop
//! a service from the outside:
//!
//! - **graceful stop** asks the machine to finish tracked work and refuse new
//!   work;
//! - **forceful stop** asks it to unwind immediately. Forceful stop always
//!   preempts a graceful stop that is in progress.
//!
//! After the last state, [`Machine::finalize`] runs exactly once, whatever the
//! outcome, and may replace the terminal error. Completion is then published
//! through [`ServiceHandle::done`] and [`ServiceHandle::err`].
//!
//! ```text
//!   Running ──graceful──▶ Draining ──┐
//!      │                     │       ├──terminated──▶ Stopped
//!      └──────forceful───────┴──▶ Stopping ─┘
//! ```

mod mailbox;
mod phase;

pub use mailbox::{mailbox, Mailbox, Poster};
pub use phase::{Event, Phase};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Returned when work is offered to a service that no longer accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("service is stopped")]
pub struct Stopped;

/// Stop latches shared between a service and its handles.
///
/// The graceful token is a child of the forceful token, so anything waiting
/// for a graceful stop also wakes on a forceful one.
#[derive(Debug, Clone)]
pub struct Signals {
    inner: Arc<SignalsInner>,
}

#[derive(Debug)]
struct SignalsInner {
    forceful: CancellationToken,
    graceful: CancellationToken,
    phase: Mutex<Phase>,
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    pub fn new() -> Self {
        let forceful = CancellationToken::new();
        let graceful = forceful.child_token();
        Self {
            inner: Arc::new(SignalsInner {
                forceful,
                graceful,
                phase: Mutex::new(Phase::Running),
            }),
        }
    }

    /// Request a graceful stop. Idempotent.
    pub fn graceful_stop(&self) {
        self.apply(Event::GracefulStop);
        self.inner.graceful.cancel();
    }

    /// Request a forceful stop. Idempotent.
    pub fn stop(&self) {
        self.apply(Event::ForcefulStop);
        self.inner.forceful.cancel();
    }

    /// Resolves once either stop has been requested.
    pub fn graceful(&self) -> WaitForCancellationFuture<'_> {
        self.inner.graceful.cancelled()
    }

    /// Resolves once a forceful stop has been requested.
    pub fn forceful(&self) -> WaitForCancellationFuture<'_> {
        self.inner.forceful.cancelled()
    }

    pub fn is_graceful_requested(&self) -> bool {
        self.inner.graceful.is_cancelled()
    }

    pub fn is_forceful_requested(&self) -> bool {
        self.inner.forceful.is_cancelled()
    }

    /// A token cancelled on forceful stop, for work spawned by the service.
    pub fn forceful_token(&self) -> CancellationToken {
        self.inner.forceful.child_token()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    fn apply(&self, event: Event) -> Phase {
        let mut phase = self.inner.phase.lock();
        *phase = phase.on(event);
        *phase
    }
}

/// Single-fire completion: a done latch plus the terminal error.
#[derive(Debug, Clone, Default)]
struct Completion {
    done: CancellationToken,
    error: Arc<OnceLock<Option<Arc<anyhow::Error>>>>,
}

impl Completion {
    fn complete(&self, result: anyhow::Result<()>) {
        if self.error.set(result.err().map(Arc::new)).is_ok() {
            self.done.cancel();
        }
    }
}

/// Behaviour of a long-running service.
#[async_trait]
pub trait Machine: Send + 'static {
    type State: Debug + Send;

    /// Run one state until it hands over to the next state (`Some`) or the
    /// service should terminate (`None`).
    async fn run_state(
        &mut self,
        state: Self::State,
        signals: &Signals,
    ) -> anyhow::Result<Option<Self::State>>;

    /// Runs exactly once after the last state. The returned value becomes the
    /// terminal result of the service.
    async fn finalize(&mut self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        result
    }
}

/// Handle to a spawned service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    name: &'static str,
    signals: Signals,
    completion: Completion,
}

impl ServiceHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request a forceful stop.
    pub fn stop(&self) {
        self.signals.stop();
    }

    /// Request a graceful stop.
    pub fn graceful_stop(&self) {
        self.signals.graceful_stop();
    }

    /// Wait until the service and its finalizer have completed.
    pub async fn done(&self) {
        self.completion.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.completion.done.is_cancelled()
    }

    /// The terminal error, once the service is done.
    pub fn err(&self) -> Option<Arc<anyhow::Error>> {
        self.completion.error.get().cloned().flatten()
    }

    /// Wait for completion and return the terminal result.
    pub async fn wait(&self) -> Result<(), Arc<anyhow::Error>> {
        self.done().await;
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.signals.phase()
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }
}

/// Drive `machine` on a new task starting from `initial`.
pub fn spawn<M: Machine>(
    name: &'static str,
    signals: Signals,
    mut machine: M,
    initial: M::State,
) -> ServiceHandle {
    let handle = ServiceHandle {
        name,
        signals: signals.clone(),
        completion: Completion::default(),
    };

    let run_signals = signals.clone();
    let task = tokio::spawn(async move {
        let result = run(&mut machine, initial, &run_signals, name).await;
        machine.finalize(result).await
    });

    let completion = handle.completion.clone();
    tokio::spawn(async move {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("service {name} task failed: {e}")),
        };
        match &result {
            Ok(()) => tracing::debug!(target: "parley::service", service = name, "service stopped"),
            Err(e) => tracing::warn!(target: "parley::service", service = name, error = %e, "service stopped with error"),
        }
        signals.apply(Event::Terminated);
        completion.complete(result);
    });

    handle
}

async fn run<M: Machine>(
    machine: &mut M,
    initial: M::State,
    signals: &Signals,
    name: &'static str,
) -> anyhow::Result<()> {
    let mut state = initial;
    loop {
        tracing::trace!(target: "parley::service", service = name, state = ?state, "entering state");
        match machine.run_state(state, signals).await? {
            Some(next) => state = next,
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    enum CounterState {
        Counting,
        Draining,
    }

    struct Counter {
        mailbox: Mailbox<usize>,
        total: Arc<AtomicUsize>,
        finalized: Arc<AtomicUsize>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Machine for Counter {
        type State = CounterState;

        async fn run_state(
            &mut self,
            state: CounterState,
            signals: &Signals,
        ) -> anyhow::Result<Option<CounterState>> {
            match state {
                CounterState::Counting => loop {
                    tokio::select! {
                        biased;
                        _ = signals.forceful() => return Ok(None),
                        _ = signals.graceful() => return Ok(Some(CounterState::Draining)),
                        Some(n) = self.mailbox.recv() => {
                            if Some(n) == self.fail_on {
                                anyhow::bail!("refusing {n}");
                            }
                            self.total.fetch_add(n, Ordering::SeqCst);
                        }
                    }
                },
                CounterState::Draining => {
                    for n in self.mailbox.drain() {
                        self.total.fetch_add(n, Ordering::SeqCst);
                    }
                    Ok(None)
                }
            }
        }

        async fn finalize(&mut self, result: anyhow::Result<()>) -> anyhow::Result<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    fn start(fail_on: Option<usize>) -> (ServiceHandle, Poster<usize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let signals = Signals::new();
        let (poster, mailbox) = mailbox(&signals);
        let total = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let machine = Counter {
            mailbox,
            total: total.clone(),
            finalized: finalized.clone(),
            fail_on,
        };
        let handle = spawn("counter", signals, machine, CounterState::Counting);
        (handle, poster, total, finalized)
    }

    #[tokio::test]
    async fn test_graceful_stop_drains_posted_work() {
        let (handle, poster, total, finalized) = start(None);
        poster.post(1).unwrap();
        poster.post(2).unwrap();

        handle.graceful_stop();
        handle.graceful_stop();
        handle.wait().await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 3);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(handle.phase(), Phase::Stopped);
        assert_eq!(poster.post(5), Err(Stopped));
    }

    #[tokio::test]
    async fn test_forceful_stop_preempts_graceful() {
        let (handle, poster, _total, finalized) = start(None);
        handle.graceful_stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.done())
            .await
            .expect("service should stop");
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(handle.err().is_none());
        assert_eq!(poster.post_before_drain(1), Err(Stopped));
    }

    #[tokio::test]
    async fn test_post_before_drain_refused_after_graceful_stop() {
        let signals = Signals::new();
        let (poster, _mailbox) = mailbox::<u8>(&signals);
        signals.graceful_stop();
        assert_eq!(signals.phase(), Phase::Draining);
        assert_eq!(poster.post_before_drain(1), Err(Stopped));
        assert!(poster.post(1).is_ok());
        signals.stop();
        assert_eq!(poster.post(1), Err(Stopped));
    }

    #[tokio::test]
    async fn test_terminal_error_is_readable_repeatedly() {
        let (handle, poster, _total, finalized) = start(Some(7));
        poster.post(7).unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(err.to_string().contains("refusing 7"));
        assert!(handle.err().is_some());
        assert!(handle.err().is_some());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }
}
