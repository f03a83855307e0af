//! An upper layer which records everything the engine tells it
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use cantp_common::{BufferError, PduId, TpError, UpperLayer};

/// Buffer reported when no limit was set
pub const UNLIMITED_WINDOW: usize = 1 << 20;

#[derive(Debug)]
struct State {
    tx_data: HashMap<PduId, VecDeque<u8>>,
    tx_busy: usize,
    tx_refuse: bool,
    rx_window: usize,
    rx_busy: usize,
    rx_refuse: Option<BufferError>,
    rx_partial: HashMap<PduId, Vec<u8>>,
    rx_starts: Vec<(PduId, u32)>,
    received: Vec<(PduId, Vec<u8>)>,
    rx_results: Vec<(PduId, Result<(), TpError>)>,
    tx_results: Vec<(PduId, Result<(), TpError>)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            tx_data: HashMap::new(),
            tx_busy: 0,
            tx_refuse: false,
            rx_window: UNLIMITED_WINDOW,
            rx_busy: 0,
            rx_refuse: None,
            rx_partial: HashMap::new(),
            rx_starts: Vec::new(),
            received: Vec::new(),
            rx_results: Vec::new(),
            tx_results: Vec::new(),
        }
    }
}

/// A PDU router stand-in
///
/// Received data is consumed as soon as it is copied, so the free buffer is always the configured
/// window.
#[derive(Debug, Default)]
pub struct TestUpper {
    state: Mutex<State>,
}

impl TestUpper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue payload for the next transmission on `pdu`
    pub fn queue_tx(&self, pdu: PduId, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .tx_data
            .entry(pdu)
            .or_default()
            .extend(data);
    }

    /// Answer the next `polls` data requests with Busy
    pub fn delay_tx(&self, polls: usize) {
        self.state.lock().unwrap().tx_busy = polls;
    }

    pub fn refuse_tx(&self) {
        self.state.lock().unwrap().tx_refuse = true;
    }

    /// Limit the free buffer reported to the engine
    pub fn set_rx_window(&self, window: usize) {
        self.state.lock().unwrap().rx_window = window;
    }

    /// Answer the next `polls` buffer requests with Busy
    pub fn delay_rx(&self, polls: usize) {
        self.state.lock().unwrap().rx_busy = polls;
    }

    /// Refuse new receptions with `error`
    pub fn refuse_rx(&self, error: Option<BufferError>) {
        self.state.lock().unwrap().rx_refuse = error;
    }

    /// Completed messages, in order of completion
    pub fn received(&self) -> Vec<(PduId, Vec<u8>)> {
        self.state.lock().unwrap().received.clone()
    }

    /// Lengths announced by every reception started
    pub fn rx_starts(&self) -> Vec<(PduId, u32)> {
        self.state.lock().unwrap().rx_starts.clone()
    }

    pub fn rx_results(&self) -> Vec<(PduId, Result<(), TpError>)> {
        self.state.lock().unwrap().rx_results.clone()
    }

    pub fn tx_results(&self) -> Vec<(PduId, Result<(), TpError>)> {
        self.state.lock().unwrap().tx_results.clone()
    }
}

impl UpperLayer for TestUpper {
    fn start_of_reception(&self, id: PduId, total_length: u32) -> Result<usize, BufferError> {
        let mut state = self.state.lock().unwrap();
        state.rx_starts.push((id, total_length));
        if let Some(error) = state.rx_refuse {
            return Err(error);
        }
        state.rx_partial.insert(id, Vec::new());
        if state.rx_busy > 0 {
            state.rx_busy -= 1;
            return Err(BufferError::Busy);
        }
        Ok(state.rx_window)
    }

    fn copy_rx_data(&self, id: PduId, data: &[u8]) -> Result<usize, BufferError> {
        let mut state = self.state.lock().unwrap();
        if data.is_empty() {
            if state.rx_busy > 0 {
                state.rx_busy -= 1;
                return Err(BufferError::Busy);
            }
            return Ok(state.rx_window);
        }
        if data.len() > state.rx_window {
            return Err(BufferError::Busy);
        }
        state
            .rx_partial
            .get_mut(&id)
            .ok_or(BufferError::NotOk)?
            .extend_from_slice(data);
        Ok(state.rx_window)
    }

    fn rx_indication(&self, id: PduId, result: Result<(), TpError>) {
        let mut state = self.state.lock().unwrap();
        state.rx_results.push((id, result));
        let data = state.rx_partial.remove(&id).unwrap_or_default();
        if result.is_ok() {
            state.received.push((id, data));
        }
    }

    fn copy_tx_data(&self, id: PduId, buf: &mut [u8]) -> Result<usize, BufferError> {
        let mut state = self.state.lock().unwrap();
        if state.tx_refuse {
            return Err(BufferError::NotOk);
        }
        if state.tx_busy > 0 {
            state.tx_busy -= 1;
            return Err(BufferError::Busy);
        }
        let queue = state.tx_data.get_mut(&id).ok_or(BufferError::NotOk)?;
        let len = buf.len();
        if queue.len() < len {
            return Err(BufferError::Busy);
        }
        for (dst, src) in buf.iter_mut().zip(queue.drain(..len)) {
            *dst = src;
        }
        Ok(queue.len())
    }

    fn tx_confirmation(&self, id: PduId, result: Result<(), TpError>) {
        self.state.lock().unwrap().tx_results.push((id, result));
    }
}
