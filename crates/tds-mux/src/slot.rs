//! Operation slots: the per-connection reservation and read-order machinery.
//!
//! A session hands out a bounded number of slots. Each slot writes one
//! request and reads its one response. Requests go out in the order their
//! slots were written; responses come back in that same order, so a
//! [`SlotQueue`] records the write order and only lets the slot at its head
//! read from the transport.
//!
//! ```text
//! Reserved ──write──▶ Written ──read──▶ Completed
//!     │                  │
//!     └──────cancel──────┴──▶ Cancelled
//! ```
//!
//! A cancelled slot that was never written just gives its reservation back.
//! A cancelled slot whose request is already queued stays at its position
//! as *abandoned*; its response is read and discarded before the slot behind
//! it may read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::command::{Command, ExecutionFlags, FlushMode, SharedFlags};
use crate::error::Error;
use crate::result::ResultSetReader;
use crate::session::SessionShared;

/// Lifecycle of one operation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Reserved, nothing written yet.
    Reserved,
    /// Request queued on the connection.
    Written,
    /// Response read.
    Completed,
    /// Cancelled or timed out before completion.
    Cancelled,
}

/// Identity of a reservation within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotTicket {
    pub(crate) id: u64,
    pub(crate) exclusive: bool,
}

#[derive(Debug)]
struct PendingRead {
    ticket: SlotTicket,
    seq: u64,
    abandoned: bool,
}

#[derive(Debug)]
struct QueueState {
    open: bool,
    active: usize,
    exclusive: bool,
    next_id: u64,
    written_seq: u64,
    flushed_seq: u64,
    pending: VecDeque<PendingRead>,
}

/// What a slot waiting to read should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Turn {
    /// This slot is at the head and may read.
    Ready,
    /// An abandoned response at the head must be drained first.
    Drain(SlotTicket, u64),
    /// Another slot is ahead.
    Wait,
    /// The queue no longer accepts work.
    Closed,
}

/// Reservation counts and read order for one session.
#[derive(Debug)]
pub(crate) struct SlotQueue {
    state: Mutex<QueueState>,
    turn: Notify,
    depth: usize,
}

impl SlotQueue {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                open: true,
                active: 0,
                exclusive: false,
                next_id: 1,
                written_seq: 0,
                flushed_seq: 0,
                pending: VecDeque::new(),
            }),
            turn: Notify::new(),
            depth,
        }
    }

    /// Reserve a slot without waiting.
    pub(crate) fn try_reserve(&self, exclusive: bool) -> Result<SlotTicket, Error> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::SessionFaulted);
        }
        let conflict = state.exclusive || (exclusive && state.active > 0);
        if conflict || state.active >= self.depth {
            return Err(Error::SlotBusy);
        }
        state.active += 1;
        state.exclusive = exclusive;
        let id = state.next_id;
        state.next_id += 1;
        Ok(SlotTicket { id, exclusive })
    }

    /// Whether a reservation of this kind would currently succeed.
    pub(crate) fn has_room(&self, exclusive: bool) -> bool {
        let state = self.state.lock();
        state.open
            && !state.exclusive
            && state.active < self.depth
            && (!exclusive || state.active == 0)
    }

    /// Record a written request. Returns its write sequence number.
    pub(crate) fn push_written(&self, ticket: SlotTicket) -> u64 {
        let mut state = self.state.lock();
        state.written_seq += 1;
        let seq = state.written_seq;
        state.pending.push_back(PendingRead {
            ticket,
            seq,
            abandoned: false,
        });
        seq
    }

    pub(crate) fn written_seq(&self) -> u64 {
        self.state.lock().written_seq
    }

    pub(crate) fn flushed_seq(&self) -> u64 {
        self.state.lock().flushed_seq
    }

    pub(crate) fn mark_flushed(&self, seq: u64) {
        let mut state = self.state.lock();
        state.flushed_seq = state.flushed_seq.max(seq);
    }

    pub(crate) fn turn(&self, ticket: SlotTicket) -> Turn {
        let state = self.state.lock();
        if !state.open {
            return Turn::Closed;
        }
        match state.pending.front() {
            Some(head) if head.ticket.id == ticket.id => Turn::Ready,
            Some(head) if head.abandoned => Turn::Drain(head.ticket, head.seq),
            Some(_) => Turn::Wait,
            None => Turn::Closed,
        }
    }

    /// The head entry, if it is abandoned.
    pub(crate) fn abandoned_head(&self) -> Option<(SlotTicket, u64)> {
        let state = self.state.lock();
        if !state.open {
            return None;
        }
        state
            .pending
            .front()
            .filter(|head| head.abandoned)
            .map(|head| (head.ticket, head.seq))
    }

    /// Pop `ticket` from the head and release its reservation.
    pub(crate) fn complete(&self, ticket: SlotTicket) -> bool {
        let mut state = self.state.lock();
        let at_head = state
            .pending
            .front()
            .is_some_and(|head| head.ticket.id == ticket.id);
        if !at_head {
            return false;
        }
        state.pending.pop_front();
        Self::release_locked(&mut state, ticket);
        drop(state);
        self.turn.notify_waiters();
        true
    }

    /// Cancel a slot. Returns `true` if its request was queued and now
    /// awaits draining; otherwise the reservation is released right away.
    pub(crate) fn abandon(&self, ticket: SlotTicket) -> bool {
        let mut state = self.state.lock();
        if let Some(entry) = state.pending.iter_mut().find(|p| p.ticket.id == ticket.id) {
            entry.abandoned = true;
            drop(state);
            self.turn.notify_waiters();
            return true;
        }
        Self::release_locked(&mut state, ticket);
        false
    }

    /// Stop accepting work and wake every waiter.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.pending.clear();
        state.active = 0;
        state.exclusive = false;
        drop(state);
        self.turn.notify_waiters();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub(crate) fn active(&self) -> usize {
        self.state.lock().active
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Future resolved at the next queue change. Enable it before checking
    /// [`turn`](Self::turn) so no wakeup is lost.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.turn.notified()
    }

    fn release_locked(state: &mut QueueState, ticket: SlotTicket) {
        if !state.open {
            return;
        }
        state.active = state.active.saturating_sub(1);
        if ticket.exclusive {
            state.exclusive = false;
        }
    }
}

/// A reserved position on a session, ready to write one command.
///
/// Dropping an unwritten slot returns the reservation.
#[derive(Debug)]
pub struct OperationSlot {
    session: Arc<SessionShared>,
    ticket: SlotTicket,
    state: SlotState,
}

impl OperationSlot {
    pub(crate) fn new(session: Arc<SessionShared>, ticket: SlotTicket) -> Self {
        Self {
            session,
            ticket,
            state: SlotState::Reserved,
        }
    }

    /// Slot id, unique within its session.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.ticket.id
    }

    /// Id of the owning session.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// Whether the slot holds the connection exclusively.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.ticket.exclusive
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Serialize `command` onto the connection.
    ///
    /// With [`FlushMode::Deferred`] the request stays buffered until a later
    /// immediate write or the first read that needs it.
    pub async fn write(
        mut self,
        command: &Command,
        mode: FlushMode,
    ) -> Result<CommandExecution, Error> {
        let seq = self
            .session
            .write_command(self.ticket, command, mode)
            .await?;
        self.state = SlotState::Written;
        let timeout = command
            .timeout()
            .or(self.session.config().command_timeout);
        Ok(CommandExecution {
            session: Arc::clone(&self.session),
            ticket: self.ticket,
            seq,
            timeout,
            flags: SharedFlags::new(),
            state: SlotState::Written,
        })
    }

    /// Give the reservation back without writing.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.state == SlotState::Reserved {
            self.state = SlotState::Cancelled;
            self.session.abandon_slot(self.ticket);
        }
    }
}

impl Drop for OperationSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// A written command waiting for its response.
///
/// Dropping it before [`read`](Self::read) abandons the response, which the
/// session then drains and discards.
#[derive(Debug)]
pub struct CommandExecution {
    session: Arc<SessionShared>,
    ticket: SlotTicket,
    seq: u64,
    timeout: Option<Duration>,
    flags: Arc<SharedFlags>,
    state: SlotState,
}

impl CommandExecution {
    /// Slot id, unique within its session.
    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.ticket.id
    }

    /// Id of the owning session.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Execution flags so far.
    #[must_use]
    pub fn flags(&self) -> ExecutionFlags {
        self.flags.snapshot()
    }

    /// Whether the request has reached the transport.
    #[must_use]
    pub fn is_flushed(&self) -> bool {
        self.session.slots().flushed_seq() >= self.seq
    }

    /// Wait for this command's turn and read its response.
    ///
    /// Earlier responses on the connection are read first by their own
    /// slots, or drained if those were abandoned. On timeout the response is
    /// abandoned and [`Error::CommandTimeout`] is returned.
    ///
    /// A task holding two executions from one session must read them in
    /// the order they were written; the later one waits for the earlier.
    pub async fn read(mut self) -> Result<ResultSetReader, Error> {
        let outcome = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.session.read_response(self.ticket, self.seq))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::debug!(
                            session = self.session.id(),
                            slot = self.ticket.id,
                            timeout = ?limit,
                            "command timed out, abandoning response"
                        );
                        self.abandon();
                        return Err(Error::CommandTimeout(limit));
                    }
                }
            }
            None => self.session.read_response(self.ticket, self.seq).await,
        };

        match outcome {
            Ok(payload) => {
                self.state = SlotState::Completed;
                Ok(ResultSetReader::new(
                    payload,
                    Arc::clone(&self.session),
                    Arc::clone(&self.flags),
                ))
            }
            Err(err) => {
                // the session is faulted or closed; nothing left to drain
                self.state = SlotState::Cancelled;
                Err(err)
            }
        }
    }

    /// Abandon the response.
    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if self.state == SlotState::Written {
            self.state = SlotState::Cancelled;
            self.flags.set_cancelled();
            self.session.abandon_slot(self.ticket);
        }
    }
}

impl Drop for CommandExecution {
    fn drop(&mut self) {
        self.abandon();
    }
}
