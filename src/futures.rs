//! Durable futures returned by the orchestration context.
//!
//! Readiness is decided entirely at schedule time from the history snapshot:
//! a call whose matching entry is already terminal carries its output, anything
//! else stays pending for the whole pass. `Poll::Pending` reaching the root
//! future is the suspension signal the replay executor catches. A suspended
//! orchestrator is recreated fresh from history on the next pass, never resumed
//! in place, so these futures never need a real waker.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Output delivered to a durable future upon completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

/// Shared core of the typed durable futures.
#[derive(Debug)]
pub struct DurableFuture {
    outcome: Option<DurableOutput>,
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().outcome.take() {
            Some(out) => Poll::Ready(out),
            None => Poll::Pending,
        }
    }
}

/// Future for `schedule_activity`; resolves to the activity's result.
#[derive(Debug)]
pub struct ActivityFuture(DurableFuture);

impl ActivityFuture {
    pub(crate) fn new(outcome: Option<DurableOutput>) -> Self {
        Self(DurableFuture { outcome })
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::Activity(r)) => Poll::Ready(r),
            Poll::Ready(other) => unreachable!("activity future resolved with {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future for `schedule_sub_orchestration`; resolves to the child's terminal result.
#[derive(Debug)]
pub struct SubOrchestrationFuture(DurableFuture);

impl SubOrchestrationFuture {
    pub(crate) fn new(outcome: Option<DurableOutput>) -> Self {
        Self(DurableFuture { outcome })
    }
}

impl Future for SubOrchestrationFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::SubOrchestration(r)) => Poll::Ready(r),
            Poll::Ready(other) => unreachable!("sub-orchestration future resolved with {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future for `schedule_timer`; resolves once the timer has fired.
#[derive(Debug)]
pub struct TimerFuture(DurableFuture);

impl TimerFuture {
    pub(crate) fn new(outcome: Option<DurableOutput>) -> Self {
        Self(DurableFuture { outcome })
    }
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
            Poll::Ready(other) => unreachable!("timer future resolved with {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future for `schedule_wait`; resolves to the raised payload.
#[derive(Debug)]
pub struct EventFuture(DurableFuture);

impl EventFuture {
    pub(crate) fn new(outcome: Option<DurableOutput>) -> Self {
        Self(DurableFuture { outcome })
    }
}

impl Future for EventFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::External(data)) => Poll::Ready(data),
            Poll::Ready(other) => unreachable!("event future resolved with {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

// poll() projects &mut self into the inner future without structural pinning;
// these assertions keep that sound if the types grow !Unpin fields.
#[allow(dead_code)]
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
    assert_unpin::<ActivityFuture>();
    assert_unpin::<SubOrchestrationFuture>();
    assert_unpin::<TimerFuture>();
    assert_unpin::<EventFuture>();
};
