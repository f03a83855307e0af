//! Channel locking and deferred events
//!
//! Every event for a channel (a received frame, a transmit confirmation, a main function tick, an
//! application request) runs its transition while holding the channel lock. An event which finds
//! the lock taken is not lost: it is parked in the channel's [`Deferred`] record, and the context
//! holding the lock replays it before letting go. Deferred events are replayed in a fixed order:
//! transmit confirmation, then received frame, then ticks.
//!
//! Parking an event and releasing the lock both happen inside one `fetch_update` on the lock
//! state, so an event can never be parked after the holder has looked for work and before it has
//! unlocked.
//!
//! Upper layer notifications raised by a transition are collected on the guard and delivered once
//! the lock is released, so the upper layer may call back into the engine for the same channel.
use core::cell::UnsafeCell;

use cantp_common::{messages::CanId, pci::FrameType, AtomicCell, CanFrame, PduId, TpError};
use heapless::Vec;

use crate::channel::{ChannelRecord, ChannelState, Direction, Owner};

/// Notifications one guard can hold before they are delivered under the lock
const MAX_NOTIFICATIONS: usize = 4;

/// A received frame waiting to be processed by a channel
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingFrame {
    pub owner: Owner,
    pub kind: FrameType,
    pub frame: CanFrame,
    /// Address information of the frame, used to lock a reception to one peer
    pub n_ai: u16,
}

/// An event to run on a locked channel
#[derive(Clone, Copy, Debug)]
pub(crate) enum Event {
    /// The CAN driver confirmed the frame the channel is waiting on
    TxConfirmation,
    /// A frame addressed to the channel
    Frame(PendingFrame),
    /// Main function ticks elapsed. Zero ticks re-runs pending work without advancing timers.
    Tick(u32),
    /// A transition run directly by the caller
    Request,
}

/// The end of a transfer, to be reported to the upper layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Notification {
    pub direction: Direction,
    pub pdu: PduId,
    pub result: Result<(), TpError>,
}

/// Events which arrived while the channel was locked
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Deferred {
    tx_confirmation: bool,
    frame: Option<PendingFrame>,
    ticks: Option<u32>,
}

impl Deferred {
    fn push(&mut self, event: Event) -> Option<PendingFrame> {
        match event {
            Event::TxConfirmation => {
                self.tx_confirmation = true;
                None
            }
            Event::Frame(frame) => self.frame.replace(frame),
            Event::Tick(n) => {
                self.ticks = Some(self.ticks.unwrap_or(0).saturating_add(n));
                None
            }
            Event::Request => None,
        }
    }

    fn pop(&mut self) -> Option<Event> {
        if core::mem::take(&mut self.tx_confirmation) {
            return Some(Event::TxConfirmation);
        }
        if let Some(frame) = self.frame.take() {
            return Some(Event::Frame(frame));
        }
        self.ticks.take().map(Event::Tick)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct LockState {
    locked: bool,
    owner: Option<Owner>,
    deferred: Deferred,
}

/// Result of trying to run an event on a channel
pub(crate) enum Acquire<'c> {
    /// The lock was taken; run the event and then drain with [`ChannelGuard::next_or_unlock`]
    Locked(ChannelGuard<'c>),
    /// Another context holds the lock and will run the event
    Deferred {
        /// A deferred frame which was replaced by this event
        overwritten: Option<PendingFrame>,
    },
}

/// One slot of the channel pool
pub(crate) struct Channel {
    state: AtomicCell<ChannelState>,
    lock: AtomicCell<LockState>,
    /// Identifier of the frames this channel sends, while it is busy
    out_id: AtomicCell<Option<CanId>>,
    record: UnsafeCell<ChannelRecord>,
}

// The record is only accessed through a ChannelGuard, and at most one guard exists per channel
unsafe impl Sync for Channel {}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state.load())
            .field("owner", &self.owner())
            .finish()
    }
}

impl Channel {
    pub fn new() -> Self {
        Self {
            state: AtomicCell::new(ChannelState::Idle),
            lock: AtomicCell::new(LockState::default()),
            out_id: AtomicCell::new(None),
            record: UnsafeCell::new(ChannelRecord::default()),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state.load()
    }

    pub fn owner(&self) -> Option<Owner> {
        self.lock.load().owner
    }

    pub fn out_id(&self) -> Option<CanId> {
        self.out_id.load()
    }

    /// Returns true if this channel sends on `id` and is waiting for a confirmation
    pub fn confirming_on(&self, id: CanId) -> bool {
        self.state().awaits_confirmation() && self.out_id() == Some(id)
    }

    /// Returns true if this channel holds a frame for `id` back
    pub fn postponed_on(&self, id: CanId) -> bool {
        self.state().is_postponed() && self.out_id() == Some(id)
    }

    /// Take the lock, or park `event` for the current holder
    pub fn lock_or_defer(&self, event: Event) -> Acquire<'_> {
        let mut overwritten = None;
        let mut deferred = false;
        let _ = self.lock.fetch_update(|mut s| {
            if s.locked {
                overwritten = s.deferred.push(event);
                deferred = true;
            } else {
                s.locked = true;
                deferred = false;
            }
            Some(s)
        });
        if deferred {
            Acquire::Deferred { overwritten }
        } else {
            Acquire::Locked(self.guard())
        }
    }

    /// Take the lock if it is free, without parking anything
    pub fn try_lock(&self) -> Option<ChannelGuard<'_>> {
        self.lock
            .fetch_update(|mut s| {
                if s.locked {
                    None
                } else {
                    s.locked = true;
                    Some(s)
                }
            })
            .ok()
            .map(|_| self.guard())
    }

    /// Take the lock of an unowned, unlocked channel and assign it to `owner`
    pub fn claim(&self, owner: Owner) -> Option<ChannelGuard<'_>> {
        self.lock
            .fetch_update(|mut s| {
                if s.locked || s.owner.is_some() {
                    None
                } else {
                    s.locked = true;
                    s.owner = Some(owner);
                    Some(s)
                }
            })
            .ok()
            .map(|_| self.guard())
    }

    fn guard(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            channel: self,
            // SAFETY: the lock flag was just set by this context, so no other guard exists
            rec: unsafe { &mut *self.record.get() },
            released: false,
            notifications: Vec::new(),
        }
    }
}

/// Exclusive access to a locked channel
pub(crate) struct ChannelGuard<'c> {
    channel: &'c Channel,
    pub rec: &'c mut ChannelRecord,
    released: bool,
    notifications: Vec<Notification, MAX_NOTIFICATIONS>,
}

impl ChannelGuard<'_> {
    pub fn state(&self) -> ChannelState {
        self.channel.state.load()
    }

    pub fn set_state(&mut self, state: ChannelState) {
        let old = self.channel.state.swap(state);
        if old != state {
            defmt_or_log::debug!("Channel {:?} -> {:?}", old, state);
        }
    }

    pub fn owner(&self) -> Option<Owner> {
        self.channel.owner()
    }

    pub fn set_owner(&mut self, owner: Option<Owner>) {
        let _ = self.channel.lock.fetch_update(|mut s| {
            s.owner = owner;
            Some(s)
        });
    }

    pub fn out_id(&self) -> Option<CanId> {
        self.channel.out_id()
    }

    pub fn set_out_id(&mut self, id: Option<CanId>) {
        self.channel.out_id.store(id);
    }

    /// Return the channel to idle, clearing the record and the owner
    pub fn reset(&mut self) {
        *self.rec = ChannelRecord::default();
        self.set_out_id(None);
        self.set_owner(None);
        self.set_state(ChannelState::Idle);
    }

    /// Hold `notification` until the lock is released
    ///
    /// Hands it back if the guard is full.
    pub fn defer_notification(&mut self, notification: Notification) -> Result<(), Notification> {
        self.notifications.push(notification)
    }

    /// Take the held notifications, in the order they were raised
    pub fn take_notifications(&mut self) -> Vec<Notification, MAX_NOTIFICATIONS> {
        core::mem::take(&mut self.notifications)
    }

    /// Drop everything parked while the channel was locked
    pub fn discard_deferred(&mut self) {
        let _ = self.channel.lock.fetch_update(|mut s| {
            s.deferred = Deferred::default();
            Some(s)
        });
    }

    /// Take the next parked event, or release the lock if there is none
    ///
    /// After this returns None the guard no longer holds the lock.
    pub fn next_or_unlock(&mut self) -> Option<Event> {
        if self.released {
            return None;
        }
        let mut next = None;
        let _ = self.channel.lock.fetch_update(|mut s| {
            next = s.deferred.pop();
            if next.is_none() {
                s.locked = false;
            }
            Some(s)
        });
        if next.is_none() {
            self.released = true;
        }
        next
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.channel.lock.fetch_update(|mut s| {
                s.locked = false;
                Some(s)
            });
        }
    }
}
