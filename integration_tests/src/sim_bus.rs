//! A simulated CAN bus connecting transport engines in one process
//!
//! Frames handed to a [`SimDriver`] are queued on the bus, and only delivered when the test calls
//! [`SimBus::pump`] or [`SimBus::advance`]. Delivering a frame first confirms it to the sending
//! node, then passes it to every other node. Frames sent while handling a delivery are queued
//! behind it, so the engines never recurse into each other.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
    },
};

use cantp_common::{messages::CanId, CanDriver, CanFrame, CanSendError};
use cantp_engine::CanTp;
use crossbeam::channel::{unbounded, Receiver, Sender};

/// Index of a sender which is not one of the simulated nodes, e.g. the test itself
pub const EXTERNAL: usize = usize::MAX;

/// Something attached to the bus
pub trait SimNode {
    /// A frame from another node
    fn receive(&self, frame: &CanFrame);
    /// A frame this node sent went out
    fn confirm(&self, id: CanId);
    /// One main function period passed
    fn tick(&self);
}

impl<const N: usize> SimNode for CanTp<'_, N> {
    fn receive(&self, frame: &CanFrame) {
        self.rx_indication(frame);
    }

    fn confirm(&self, id: CanId) {
        self.tx_confirmation(id);
    }

    fn tick(&self) {
        self.main_function();
    }
}

/// A frame seen on the bus
#[derive(Clone, Copy, Debug)]
pub struct BusRecord {
    /// Index of the sending node
    pub sender: usize,
    /// Bus time, in main function periods, at which it was sent
    pub tick: u32,
    pub frame: CanFrame,
}

pub struct SimBus {
    queue: Mutex<VecDeque<(usize, CanFrame)>>,
    history: Mutex<Vec<BusRecord>>,
    monitors: Mutex<Vec<Sender<BusRecord>>>,
    tick: AtomicU32,
    confirm: AtomicBool,
    reject: AtomicBool,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    /// Pump iterations after which a test is assumed to be stuck in a frame loop
    const MAX_DELIVERIES: usize = 100_000;

    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            tick: AtomicU32::new(0),
            confirm: AtomicBool::new(true),
            reject: AtomicBool::new(false),
        }
    }

    /// Create the CAN driver for node `node`
    pub fn driver(&self, node: usize) -> SimDriver<'_> {
        SimDriver { bus: self, node }
    }

    /// Get a receiver which sees a copy of every frame sent from now on
    pub fn new_receiver(&self) -> Receiver<BusRecord> {
        let (tx, rx) = unbounded();
        self.monitors.lock().unwrap().push(tx);
        rx
    }

    /// Stop or resume transmit confirmations, as if the frames never got acknowledged
    pub fn set_confirmations(&self, enabled: bool) {
        self.confirm.store(enabled, Ordering::Relaxed);
    }

    /// Make the drivers refuse every frame
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    pub fn now(&self) -> u32 {
        self.tick.load(Ordering::Relaxed)
    }

    fn send(&self, sender: usize, frame: CanFrame) -> Result<(), CanSendError> {
        if self.reject.load(Ordering::Relaxed) {
            return Err(CanSendError { frame });
        }
        let record = BusRecord {
            sender,
            tick: self.now(),
            frame,
        };
        self.history.lock().unwrap().push(record);
        for monitor in self.monitors.lock().unwrap().iter() {
            monitor.send(record).ok();
        }
        self.queue.lock().unwrap().push_back((sender, frame));
        Ok(())
    }

    /// Put a frame on the bus as if an outside node sent it, and deliver everything queued
    pub fn inject(&self, nodes: &[&dyn SimNode], frame: CanFrame) {
        self.send(EXTERNAL, frame).unwrap();
        self.pump(nodes);
    }

    /// Deliver queued frames until the bus is quiet. Returns the number of frames delivered.
    pub fn pump(&self, nodes: &[&dyn SimNode]) -> usize {
        let mut delivered = 0;
        loop {
            // The queue lock must not be held while the nodes run
            let next = self.queue.lock().unwrap().pop_front();
            let Some((sender, frame)) = next else {
                return delivered;
            };
            if self.confirm.load(Ordering::Relaxed) {
                if let Some(node) = nodes.get(sender) {
                    node.confirm(frame.id());
                }
            }
            for (i, node) in nodes.iter().enumerate() {
                if i != sender {
                    node.receive(&frame);
                }
            }
            delivered += 1;
            assert!(
                delivered < Self::MAX_DELIVERIES,
                "Bus never went quiet, nodes are stuck sending"
            );
        }
    }

    /// Run `periods` main function periods on every node, delivering frames after each
    pub fn advance(&self, nodes: &[&dyn SimNode], periods: u32) {
        for _ in 0..periods {
            self.tick.fetch_add(1, Ordering::Relaxed);
            for node in nodes {
                node.tick();
            }
            self.pump(nodes);
        }
    }

    /// Every frame sent so far
    pub fn history(&self) -> Vec<BusRecord> {
        self.history.lock().unwrap().clone()
    }

    /// Frames sent so far by node `node`
    pub fn sent_by(&self, node: usize) -> Vec<CanFrame> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sender == node)
            .map(|r| r.frame)
            .collect()
    }
}

/// The CAN driver of one simulated node
pub struct SimDriver<'b> {
    bus: &'b SimBus,
    node: usize,
}

impl CanDriver for SimDriver<'_> {
    fn transmit(&self, frame: &CanFrame) -> Result<(), CanSendError> {
        self.bus.send(self.node, *frame)
    }
}
