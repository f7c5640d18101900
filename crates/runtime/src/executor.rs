//! Run loop which interleaves actor code with clock advances.
//!
//! Each actor is a boxed future polled with a no-op waker. A blocking call registers a wait in the kernel and awaits
//! a [Suspend] future, which returns `Pending` to the run loop until the kernel records a wake for this call. The
//! kernel is never borrowed while actor code is polled, so actors freely call into the kernel through their handles.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::task::noop_waker_ref;

use crate::{
    actor::{ActorBody, ActorId, ActorState},
    context::ActorContext,
    kernel::{KernelRef, WakeReason},
};

/// Suspension point of an actor waiting for the wake identified by `token`.
pub(crate) struct Suspend {
    kernel: KernelRef,
    actor: ActorId,
    token: u64,
    polled: bool,
}

impl Suspend {
    pub fn new(kernel: KernelRef, actor: ActorId, token: u64) -> Self {
        Self {
            kernel,
            actor,
            token,
            polled: false,
        }
    }
}

impl Future for Suspend {
    type Output = WakeReason;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // the first poll always gives control back to the run loop, even if the wake is already recorded
        if !self.polled {
            self.polled = true;
            return Poll::Pending;
        }
        match self.kernel.borrow_mut().take_wake(self.actor, self.token) {
            Some(reason) => Poll::Ready(reason),
            None => Poll::Pending,
        }
    }
}

/// Runs the simulation until no regular actor is alive, no event is left or the clock reaches `limit`.
pub(crate) fn run(kernel: &KernelRef, limit: Option<f64>) {
    loop {
        run_actors(kernel);

        let mut k = kernel.borrow_mut();
        if !k.has_live_regular_actors() {
            let daemons_alive = k.actors.values().any(|a| a.daemon && a.state != ActorState::Dead);
            if daemons_alive {
                k.kill_daemons();
                continue;
            }
            break;
        }
        let limit = limit.map(|limit| limit.max(k.clock));
        match (k.next_event_time(), limit) {
            (None, None) => {
                k.report_deadlock();
                break;
            }
            (None, Some(limit)) => {
                k.advance_to(limit);
                break;
            }
            (Some(time), Some(limit)) if time > limit => {
                k.advance_to(limit);
                break;
            }
            (Some(time), _) => k.advance_to(time),
        }
    }
    flush(kernel);
    kernel.borrow_mut().finalize_stats();
}

/// Polls runnable actors in FIFO order until nobody is runnable and no deferred callback is pending.
fn run_actors(kernel: &KernelRef) {
    loop {
        let had_callbacks = flush(kernel);
        let next = {
            let mut k = kernel.borrow_mut();
            let mut next = None;
            while let Some(id) = k.runnable.pop_front() {
                let runnable = k
                    .actors
                    .get(&id)
                    .is_some_and(|a| a.state == ActorState::Runnable && !a.suspended);
                if runnable {
                    next = Some(id);
                    break;
                }
            }
            next
        };
        match next {
            Some(id) => poll_actor(kernel, id),
            None if had_callbacks => continue,
            None => break,
        }
    }
}

fn poll_actor(kernel: &KernelRef, id: ActorId) {
    let (future, body, name) = {
        let mut k = kernel.borrow_mut();
        k.current = Some(id);
        let record = k.actors.get_mut(&id).expect("runnable actor is registered");
        (record.future.take(), record.body.take(), record.name.clone())
    };
    let mut future = match (future, body) {
        (Some(future), _) => future,
        (None, Some(ActorBody::Once(f))) => f(ActorContext::new(kernel.clone(), id, name)),
        (None, Some(ActorBody::Restartable(factory))) => factory(ActorContext::new(kernel.clone(), id, name)),
        (None, None) => panic!("actor {} is polled after its code was dropped", id),
    };

    let mut cx = Context::from_waker(noop_waker_ref());
    let poll = future.as_mut().poll(&mut cx);

    let mut k = kernel.borrow_mut();
    k.current = None;
    let alive = k.is_alive(id);
    match poll {
        Poll::Ready(()) => {
            if alive {
                k.actor_finished(id);
            }
        }
        Poll::Pending if alive => {
            if let Some(record) = k.actors.get_mut(&id) {
                record.future = Some(future);
            }
            return;
        }
        Poll::Pending => {}
    }
    drop(k);
    drop(future);
}

/// Runs deferred callbacks and drops the code of dead actors. Returns whether any callback was run.
fn flush(kernel: &KernelRef) -> bool {
    let (deferred, graveyard) = {
        let mut k = kernel.borrow_mut();
        (std::mem::take(&mut k.deferred), std::mem::take(&mut k.graveyard))
    };
    drop(graveyard);
    let had_callbacks = !deferred.is_empty();
    for callback in deferred {
        callback();
    }
    had_callbacks
}
