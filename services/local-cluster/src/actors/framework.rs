//! A small actor runtime on top of tokio tasks.
//!
//! An actor is spawned onto the current runtime and talked to through its
//! [`ActorHandle`]. Whoever spawned it keeps the [`ActorRef`], which is the
//! only way to stop it:
//!
//! ```text
//! spawn ──► on_start ──► handle(msg)* ──► on_stop ──► mailbox closed
//!                           ▲
//!              terminate ───┘ (checked before every message)
//! ```
//!
//! The mailbox closes only after `on_stop` has returned, so
//! [`ActorHandle::is_closed`] doubles as a "confirmed stopped" flag.
//! [`ActorRef::started`] reports the outcome of `on_start`.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Anything that can sit in a mailbox.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of a spawned actor. Messages are handled one at a time.
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Prefix of the actor id.
    fn name(&self) -> &str;

    /// `Ok(false)` ends the actor after this message.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    /// An error here skips the message loop; `on_stop` still runs.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    /// Runs exactly once, while the mailbox is still open.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Per-actor bookkeeping passed to every callback.
pub struct ActorContext<M: Message> {
    pub actor_id: String,
    pub messages_processed: u64,
    myself: ActorHandle<M>,
}

impl<M: Message> ActorContext<M> {
    /// The actor's own address, for handing to collaborators that call back.
    pub fn myself(&self) -> ActorHandle<M> {
        self.myself.clone()
    }
}

/// How an actor's task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorExit {
    /// Stopped after a terminate request.
    Terminated,
    /// The actor asked to stop by returning `Ok(false)`.
    Requested,
    /// `on_start` or a handler returned a permanent error.
    Failed(String),
    /// The task panicked or was aborted.
    Panicked,
}

#[derive(Debug, Error)]
pub enum ActorError {
    /// Logged; the actor keeps going.
    #[error("transient error: {0}")]
    Transient(String),

    /// Ends the actor.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Addresses
// =============================================================================

/// Cloneable address of an actor. Equal addresses name the same actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ActorHandle").field(&self.actor_id).finish()
    }
}

impl<M: Message> PartialEq for ActorHandle<M> {
    fn eq(&self, other: &Self) -> bool {
        self.actor_id == other.actor_id
    }
}

impl<M: Message> Eq for ActorHandle<M> {}

impl<M: Message> ActorHandle<M> {
    /// Waits for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// True once the actor has stopped and released its mailbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owning reference to a spawned actor's task.
///
/// Dropping it terminates the actor without waiting; use
/// [`ActorRef::stop`] to observe the stop.
pub struct ActorRef {
    pub actor_id: String,
    task: tokio::task::JoinHandle<ActorExit>,
    terminate_tx: watch::Sender<bool>,
    started_rx: Option<oneshot::Receiver<Result<(), String>>>,
}

impl ActorRef {
    /// Ask the actor to stop. Messages still queued are dropped.
    pub fn terminate(&self) {
        let _ = self.terminate_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until `on_start` has returned.
    ///
    /// Fails with `Permanent` when `on_start` failed and with
    /// `ActorStopped` when the task died before reporting. Once it has
    /// succeeded, later calls return `Ok` immediately.
    pub async fn started(&mut self) -> Result<(), ActorError> {
        let Some(started_rx) = self.started_rx.take() else {
            return Ok(());
        };
        match started_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ActorError::Permanent(reason)),
            Err(_) => Err(ActorError::ActorStopped),
        }
    }

    /// Block until the task has finished and dropped the actor.
    ///
    /// Never times out. A panicked task counts as stopped.
    pub async fn wait(self) -> ActorExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(actor_id = %self.actor_id, error = %e, "Actor task did not complete cleanly");
                ActorExit::Panicked
            }
        }
    }

    /// `terminate` then `wait`.
    pub async fn stop(self) -> ActorExit {
        self.terminate();
        self.wait().await
    }
}

/// Spawn `actor` on the current tokio runtime with a bounded mailbox.
///
/// Panics outside a runtime, like `tokio::spawn`.
pub fn spawn<A: Actor>(actor: A, mailbox_size: usize) -> (ActorHandle<A::Message>, ActorRef) {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    let actor_id = format!("{}_{}", actor.name(), NEXT_ID.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel(mailbox_size);
    let (terminate_tx, terminate_rx) = watch::channel(false);
    let (started_tx, started_rx) = oneshot::channel();

    let handle = ActorHandle {
        tx,
        actor_id: actor_id.clone(),
    };
    let task = tokio::spawn(run(actor, rx, terminate_rx, started_tx, handle.clone()));
    debug!(actor_id = %actor_id, "Spawned actor");

    let actor_ref = ActorRef {
        actor_id,
        task,
        terminate_tx,
        started_rx: Some(started_rx),
    };
    (handle, actor_ref)
}

async fn run<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut terminate: watch::Receiver<bool>,
    started_tx: oneshot::Sender<Result<(), String>>,
    myself: ActorHandle<A::Message>,
) -> ActorExit {
    let mut ctx = ActorContext {
        actor_id: myself.actor_id.clone(),
        messages_processed: 0,
        myself,
    };

    let exit = match actor.on_start(&mut ctx).await {
        Err(e) => {
            error!(actor_id = %ctx.actor_id, error = %e, "Actor failed to start");
            let reason = match e {
                ActorError::Permanent(reason) | ActorError::Transient(reason) => reason,
                other => other.to_string(),
            };
            let _ = started_tx.send(Err(reason.clone()));
            ActorExit::Failed(reason)
        }
        Ok(()) => {
            let _ = started_tx.send(Ok(()));
            run_loop(&mut actor, &mut rx, &mut terminate, &mut ctx).await
        }
    };

    actor.on_stop(&mut ctx).await;
    debug!(
        actor_id = %ctx.actor_id,
        messages_processed = ctx.messages_processed,
        exit = ?exit,
        "Actor stopped"
    );

    // Mailbox first: once it is closed, every address observes the stop.
    drop(rx);
    drop(ctx);
    drop(actor);

    exit
}

async fn run_loop<A: Actor>(
    actor: &mut A,
    rx: &mut mpsc::Receiver<A::Message>,
    terminate: &mut watch::Receiver<bool>,
    ctx: &mut ActorContext<A::Message>,
) -> ActorExit {
    loop {
        tokio::select! {
            biased;

            changed = terminate.changed() => {
                // A dropped ActorRef counts as a terminate request.
                if changed.is_err() || *terminate.borrow() {
                    return ActorExit::Terminated;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    return ActorExit::Terminated;
                };
                ctx.messages_processed += 1;

                match actor.handle(msg, ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %ctx.actor_id, "Actor requested stop");
                        return ActorExit::Requested;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %ctx.actor_id, error = %reason, "Actor failed");
                        return ActorExit::Failed(reason);
                    }
                    Err(e) => warn!(actor_id = %ctx.actor_id, error = %e, "Actor error"),
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
