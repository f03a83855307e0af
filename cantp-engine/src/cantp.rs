//! The transport engine object
use cantp_common::{
    messages::CanId,
    pci::{FrameType, StMin},
    AtomicCell, CanDriver, CanFrame, PduId, TpError, UpperLayer,
};
use defmt_or_log::{debug, info, warn};
use heapless::Vec;

use crate::{
    allocator::Allocation,
    channel::{ChannelState, DataFrame, Direction, Owner, RxState, TxState},
    codec::{valid_data_length, valid_fc_length},
    config::{CanTpConfig, ConfigError, RxNSduConfig, TxNSduConfig, MAX_NSDUS},
    det::{ApiId, CanTpError, DetError},
    lock::{Acquire, Channel, ChannelGuard, Event, Notification},
};

/// Tx STmin override value meaning "use the value from the flow control frame"
pub(crate) const ST_MIN_FROM_FC: u8 = 0xFF;

/// A flow control parameter which can be changed at runtime
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parameter {
    /// Block size sent in flow control frames
    BlockSize,
    /// Separation time, raw STmin encoding
    StMin,
}

#[derive(Debug)]
pub(crate) struct RxParams {
    pub block_size: AtomicCell<u8>,
    pub st_min: AtomicCell<u8>,
    pub n_sa: AtomicCell<u8>,
}

impl RxParams {
    fn new(cfg: &RxNSduConfig) -> Self {
        Self {
            block_size: AtomicCell::new(cfg.block_size),
            st_min: AtomicCell::new(cfg.st_min),
            n_sa: AtomicCell::new(cfg.n_sa),
        }
    }

    fn reset(&self, cfg: &RxNSduConfig) {
        self.block_size.store(cfg.block_size);
        self.st_min.store(cfg.st_min);
        self.n_sa.store(cfg.n_sa);
    }
}

#[derive(Debug)]
pub(crate) struct TxParams {
    /// STmin to use instead of the one received in flow control, or [`ST_MIN_FROM_FC`]
    pub st_min: AtomicCell<u8>,
    pub n_sa: AtomicCell<u8>,
}

impl TxParams {
    fn new(cfg: &TxNSduConfig) -> Self {
        Self {
            st_min: AtomicCell::new(ST_MIN_FROM_FC),
            n_sa: AtomicCell::new(cfg.n_sa),
        }
    }

    fn reset(&self, cfg: &TxNSduConfig) {
        self.st_min.store(ST_MIN_FROM_FC);
        self.n_sa.store(cfg.n_sa);
    }
}

/// An ISO 15765-2 transport engine with `CHANNELS` concurrent transfers
///
/// All methods take `&self` and may be called from any context: the CAN receive and transmit
/// complete interrupts call [`rx_indication`](Self::rx_indication) and
/// [`tx_confirmation`](Self::tx_confirmation), a periodic task calls
/// [`main_function`](Self::main_function), and the application calls
/// [`transmit`](Self::transmit) and the parameter APIs. None of them block.
///
/// The upper layer and the CAN driver are called synchronously from within these methods, while
/// the engine holds the lock of the channel concerned. They may call back into the engine; events
/// for a locked channel are processed as soon as the current one is finished.
#[allow(missing_debug_implementations)]
pub struct CanTp<'a, const CHANNELS: usize> {
    pub(crate) config: &'a CanTpConfig<'a>,
    pub(crate) driver: &'a dyn CanDriver,
    pub(crate) upper: &'a dyn UpperLayer,
    pub(crate) channels: [Channel; CHANNELS],
    pub(crate) rx_params: Vec<RxParams, MAX_NSDUS>,
    pub(crate) tx_params: Vec<TxParams, MAX_NSDUS>,
    busy: AtomicCell<usize>,
    initialized: AtomicCell<bool>,
    error_cb: AtomicCell<Option<&'static (dyn Fn(ApiId, DetError) + Sync)>>,
}

impl<'a, const CHANNELS: usize> CanTp<'a, CHANNELS> {
    /// Create a new engine
    ///
    /// The engine must be initialised with [`init`](Self::init) before use.
    pub fn new(
        config: &'a CanTpConfig<'a>,
        driver: &'a dyn CanDriver,
        upper: &'a dyn UpperLayer,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rx_params = Vec::new();
        for cfg in config.rx_nsdus {
            rx_params
                .push(RxParams::new(cfg))
                .map_err(|_| ConfigError::TooManyNSdus {
                    len: config.rx_nsdus.len(),
                })?;
        }
        let mut tx_params = Vec::new();
        for cfg in config.tx_nsdus {
            tx_params
                .push(TxParams::new(cfg))
                .map_err(|_| ConfigError::TooManyNSdus {
                    len: config.tx_nsdus.len(),
                })?;
        }
        Ok(Self {
            config,
            driver,
            upper,
            channels: core::array::from_fn(|_| Channel::new()),
            rx_params,
            tx_params,
            busy: AtomicCell::new(0),
            initialized: AtomicCell::new(false),
            error_cb: AtomicCell::new(None),
        })
    }

    /// Reset every channel and runtime parameter, and start accepting requests
    ///
    /// Transfers in progress are dropped without notifying the upper layer.
    pub fn init(&self) {
        self.reset_channels();
        for (params, cfg) in self.rx_params.iter().zip(self.config.rx_nsdus) {
            params.reset(cfg);
        }
        for (params, cfg) in self.tx_params.iter().zip(self.config.tx_nsdus) {
            params.reset(cfg);
        }
        self.initialized.store(true);
        info!(
            "CanTp initialised: {} channels, {} Rx N-SDUs, {} Tx N-SDUs",
            CHANNELS,
            self.config.rx_nsdus.len(),
            self.config.tx_nsdus.len()
        );
    }

    /// Stop accepting requests and drop all transfers in progress
    pub fn shutdown(&self) {
        self.initialized.store(false);
        self.reset_channels();
        info!("CanTp shut down");
    }

    fn reset_channels(&self) {
        for channel in &self.channels {
            match channel.try_lock() {
                Some(mut g) => {
                    g.discard_deferred();
                    g.reset();
                }
                None => warn!("Channel in use during reset"),
            }
        }
        let active = self
            .channels
            .iter()
            .filter(|c| c.state() != ChannelState::Idle)
            .count();
        self.busy.store(active);
    }

    /// Returns true between [`init`](Self::init) and [`shutdown`](Self::shutdown)
    pub fn is_initialized(&self) -> bool {
        self.initialized.load()
    }

    /// Number of channels currently transferring a message
    pub fn busy_channels(&self) -> usize {
        self.busy.load()
    }

    /// The state of channel `index`, or None if there is no such channel
    pub fn channel_state(&self, index: usize) -> Option<ChannelState> {
        self.channels.get(index).map(|c| c.state())
    }

    /// Set a callback to receive development error reports
    ///
    /// It must be static. Usually this will be a static fn, but in some circumstances, it may be
    /// desirable to use Box::leak to pass a heap allocated closure instead.
    pub fn set_error_callback(&self, callback: &'static (dyn Fn(ApiId, DetError) + Sync)) {
        self.error_cb.store(Some(callback));
    }

    pub(crate) fn report(&self, api: ApiId, error: DetError) {
        warn!("Development error {:?} in {:?}", error, api);
        if let Some(cb) = self.error_cb.load() {
            cb(api, error);
        }
    }

    fn fail<T>(&self, api: ApiId, error: CanTpError) -> Result<T, CanTpError> {
        if let Some(det) = error.det() {
            self.report(api, det);
        }
        Err(error)
    }

    fn check_init(&self, api: ApiId) -> Result<(), CanTpError> {
        if self.is_initialized() {
            Ok(())
        } else {
            self.fail(api, CanTpError::Uninit)
        }
    }

    fn rx_nsdu(&self, api: ApiId, id: PduId) -> Result<&RxNSduConfig, CanTpError> {
        match self.config.rx_nsdus.get(id as usize) {
            Some(cfg) => Ok(cfg),
            None => self.fail(api, CanTpError::InvalidRxId { id }),
        }
    }

    fn tx_nsdu(&self, api: ApiId, id: PduId) -> Result<&TxNSduConfig, CanTpError> {
        match self.config.tx_nsdus.get(id as usize) {
            Some(cfg) => Ok(cfg),
            None => self.fail(api, CanTpError::InvalidTxId { id }),
        }
    }

    pub(crate) fn rx_cfg(&self, pdu: PduId) -> &RxNSduConfig {
        &self.config.rx_nsdus[pdu as usize]
    }

    pub(crate) fn tx_cfg(&self, pdu: PduId) -> &TxNSduConfig {
        &self.config.tx_nsdus[pdu as usize]
    }

    pub(crate) fn ticks(&self, us: u32) -> u32 {
        self.config.ticks(us)
    }

    /// Request transmission of a `length` byte message on Tx N-SDU `tx_id`
    ///
    /// The payload is pulled from the upper layer with
    /// [`copy_tx_data`](UpperLayer::copy_tx_data) as frames are sent, and the outcome is
    /// reported with [`UpperLayer::tx_confirmation`].
    pub fn transmit(&self, tx_id: PduId, length: u32) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::Transmit;
        self.check_init(API)?;
        let cfg = self.tx_nsdu(API, tx_id)?;
        if length == 0 {
            return self.fail(API, CanTpError::InvalidTxLength { id: tx_id, length });
        }
        if length as usize > cfg.max_sf_payload()
            && cfg.ta_type == crate::config::TaType::Functional
        {
            return self.fail(API, CanTpError::InvalidTaType { id: tx_id, length });
        }
        match self.allocate(Owner::tx(tx_id)) {
            Allocation::Claimed(mut g) => {
                self.start_transmission(&mut g, tx_id, length);
                self.drain(&mut g, Event::Request);
                Ok(())
            }
            Allocation::Existing(_) => Err(CanTpError::Busy { id: tx_id }),
            Allocation::Exhausted => {
                warn!("No free channel to transmit N-SDU {}", tx_id);
                Err(CanTpError::NoChannel)
            }
        }
    }

    /// Abort the transmission of Tx N-SDU `tx_id`
    ///
    /// The upper layer is notified with [`TpError::Canceled`]. The request is refused once the
    /// last frame of the message is waiting for its confirmation.
    pub fn cancel_transmit(&self, tx_id: PduId) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::CancelTransmit;
        self.check_init(API)?;
        self.tx_nsdu(API, tx_id)?;
        let owner = Owner::tx(tx_id);
        self.cancel(owner, |g| match g.state() {
            ChannelState::Tx(TxState::Confirm(DataFrame::Single)) => false,
            ChannelState::Tx(TxState::Confirm(_)) => g.rec.remaining() != 0,
            ChannelState::Tx(_) => true,
            _ => false,
        })
    }

    /// Abort the reception of Rx N-SDU `rx_id`
    ///
    /// The upper layer is notified with [`TpError::Canceled`]. The request is refused for single
    /// frame receptions and once the last consecutive frame is due.
    pub fn cancel_receive(&self, rx_id: PduId) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::CancelReceive;
        self.check_init(API)?;
        let cfg = self.rx_nsdu(API, rx_id)?;
        let owner = Owner::rx(rx_id);
        self.cancel(owner, |g| match g.state() {
            ChannelState::Rx(RxState::BufferRequest(DataFrame::Single)) => false,
            ChannelState::Rx(_) => {
                let cf = crate::config::cf_payload(cfg.addressing, g.rec.rx_frame_len);
                !g.rec.flags.last_frame && g.rec.remaining() as usize > cf
            }
            _ => false,
        })
    }

    fn cancel(
        &self,
        owner: Owner,
        cancelable: impl FnOnce(&ChannelGuard<'_>) -> bool,
    ) -> Result<(), CanTpError> {
        let Some(idx) = self.find_channel(owner) else {
            return Err(CanTpError::Refused);
        };
        let Some(mut g) = self.channels[idx].try_lock() else {
            return Err(CanTpError::Refused);
        };
        let result = if g.owner() == Some(owner) && cancelable(&g) {
            info!("Canceling {:?} N-SDU {}", owner.direction, owner.pdu);
            self.stop(&mut g, Some(Err(TpError::Canceled)));
            Ok(())
        } else {
            Err(CanTpError::Refused)
        };
        self.drain(&mut g, Event::Request);
        result
    }

    /// Change the block size or STmin sent in flow control frames for Rx N-SDU `rx_id`
    ///
    /// Refused while the N-SDU is receiving.
    pub fn change_parameter(
        &self,
        rx_id: PduId,
        parameter: Parameter,
        value: u8,
    ) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::ChangeParameter;
        self.check_init(API)?;
        self.rx_nsdu(API, rx_id)?;
        if parameter == Parameter::StMin && !StMin::is_valid(value) {
            return self.fail(API, CanTpError::ParamValue { value });
        }
        if self.find_channel(Owner::rx(rx_id)).is_some() {
            return Err(CanTpError::Busy { id: rx_id });
        }
        let params = &self.rx_params[rx_id as usize];
        match parameter {
            Parameter::BlockSize => params.block_size.store(value),
            Parameter::StMin => params.st_min.store(value),
        }
        Ok(())
    }

    /// Read the block size or STmin sent in flow control frames for Rx N-SDU `rx_id`
    pub fn read_parameter(&self, rx_id: PduId, parameter: Parameter) -> Result<u8, CanTpError> {
        const API: ApiId = ApiId::ReadParameter;
        self.check_init(API)?;
        self.rx_nsdu(API, rx_id)?;
        let params = &self.rx_params[rx_id as usize];
        Ok(match parameter {
            Parameter::BlockSize => params.block_size.load(),
            Parameter::StMin => params.st_min.load(),
        })
    }

    /// Override the STmin received in flow control frames for Tx N-SDU `tx_id`
    ///
    /// Only [`Parameter::StMin`] can be overridden.
    pub fn change_tx_parameter(
        &self,
        tx_id: PduId,
        parameter: Parameter,
        value: u8,
    ) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::ChangeTxParameter;
        self.check_init(API)?;
        self.tx_nsdu(API, tx_id)?;
        if parameter != Parameter::StMin {
            return self.fail(API, CanTpError::ParamId);
        }
        if !StMin::is_valid(value) {
            return self.fail(API, CanTpError::ParamValue { value });
        }
        self.tx_params[tx_id as usize].st_min.store(value);
        Ok(())
    }

    /// Go back to using the STmin received in flow control frames for Tx N-SDU `tx_id`
    pub fn reset_tx_parameter(&self, tx_id: PduId, parameter: Parameter) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::ResetTxParameter;
        self.check_init(API)?;
        self.tx_nsdu(API, tx_id)?;
        if parameter != Parameter::StMin {
            return self.fail(API, CanTpError::ParamId);
        }
        self.tx_params[tx_id as usize].st_min.store(ST_MIN_FROM_FC);
        Ok(())
    }

    fn n_sa_cell(
        &self,
        api: ApiId,
        id: PduId,
        direction: Direction,
    ) -> Result<&AtomicCell<u8>, CanTpError> {
        let (addressing, other_exists) = match direction {
            Direction::Rx => (
                self.config.rx_nsdus.get(id as usize).map(|c| c.addressing),
                (id as usize) < self.config.tx_nsdus.len(),
            ),
            Direction::Tx => (
                self.config.tx_nsdus.get(id as usize).map(|c| c.addressing),
                (id as usize) < self.config.rx_nsdus.len(),
            ),
        };
        let Some(addressing) = addressing else {
            let error = match (other_exists, direction) {
                (true, _) => CanTpError::ParamDirection { id },
                (false, Direction::Rx) => CanTpError::InvalidRxId { id },
                (false, Direction::Tx) => CanTpError::InvalidTxId { id },
            };
            return self.fail(api, error);
        };
        if !addressing.has_n_sa() {
            return self.fail(api, CanTpError::OperNotSupported);
        }
        Ok(match direction {
            Direction::Rx => &self.rx_params[id as usize].n_sa,
            Direction::Tx => &self.tx_params[id as usize].n_sa,
        })
    }

    /// Change the source address of an Extended or NormalFixed N-SDU
    pub fn set_n_sa(&self, id: PduId, direction: Direction, n_sa: u8) -> Result<(), CanTpError> {
        const API: ApiId = ApiId::SetNSa;
        self.check_init(API)?;
        self.n_sa_cell(API, id, direction)?.store(n_sa);
        Ok(())
    }

    /// Read the source address of an Extended or NormalFixed N-SDU
    pub fn get_n_sa(&self, id: PduId, direction: Direction) -> Result<u8, CanTpError> {
        const API: ApiId = ApiId::GetNSa;
        self.check_init(API)?;
        Ok(self.n_sa_cell(API, id, direction)?.load())
    }

    /// Process a frame received from the CAN driver
    ///
    /// Frames which do not belong to a configured N-SDU are ignored.
    pub fn rx_indication(&self, frame: &CanFrame) {
        const API: ApiId = ApiId::RxIndication;
        if self.check_init(API).is_err() {
            return;
        }
        let Some(pending) = self.lookup_frame(frame) else {
            debug!("Ignoring frame with id {:?}", frame.id());
            return;
        };
        let length_ok = match pending.kind {
            FrameType::FlowControl => {
                let cfg = self.tx_cfg(pending.owner.pdu);
                valid_fc_length(
                    frame.len(),
                    cfg.addressing,
                    cfg.padding,
                    cfg.max_frame_length,
                )
            }
            _ => frame.len() <= self.rx_cfg(pending.owner.pdu).max_frame_length,
        };
        if !length_ok {
            self.report(API, DetError::InvalidRxLength);
            return;
        }

        match pending.kind {
            FrameType::Single | FrameType::First => match self.allocate(pending.owner) {
                Allocation::Existing(idx) => self.run(idx, Event::Frame(pending)),
                Allocation::Claimed(mut g) => self.drain(&mut g, Event::Frame(pending)),
                Allocation::Exhausted => {
                    warn!("No free channel for Rx N-SDU {}", pending.owner.pdu)
                }
            },
            FrameType::Consecutive | FrameType::FlowControl => {
                match self.find_channel(pending.owner) {
                    Some(idx) => self.run(idx, Event::Frame(pending)),
                    None => debug!(
                        "Ignoring {:?} for idle N-SDU {}",
                        pending.kind, pending.owner.pdu
                    ),
                }
            }
        }
    }

    /// Process the confirmation of a frame sent with identifier `id`
    pub fn tx_confirmation(&self, id: CanId) {
        if self.check_init(ApiId::TxConfirmation).is_err() {
            return;
        }
        match self.channels.iter().position(|c| c.confirming_on(id)) {
            Some(idx) => self.run(idx, Event::TxConfirmation),
            None => debug!("Unexpected confirmation for {:?}", id),
        }
        // Frames held back for this identifier can go now
        for (idx, channel) in self.channels.iter().enumerate() {
            if channel.postponed_on(id) {
                self.run(idx, Event::Tick(0));
            }
        }
    }

    /// Advance the timers of all busy channels by one period
    ///
    /// Must be called every [`main_function_period_us`](CanTpConfig::main_function_period_us).
    pub fn main_function(&self) {
        if !self.is_initialized() || self.busy.load() == 0 {
            return;
        }
        for (idx, channel) in self.channels.iter().enumerate() {
            if channel.state() != ChannelState::Idle {
                self.run(idx, Event::Tick(1));
            }
        }
    }

    /// Run `event` on channel `idx`, or leave it to the current lock holder
    pub(crate) fn run(&self, idx: usize, event: Event) {
        match self.channels[idx].lock_or_defer(event) {
            Acquire::Locked(mut g) => self.drain(&mut g, event),
            Acquire::Deferred { overwritten } => {
                if let Some(old) = overwritten {
                    if old.kind == FrameType::Consecutive {
                        self.report(ApiId::RxIndication, DetError::OverwriteFrame);
                    }
                }
            }
        }
    }

    /// Run `first`, then everything deferred while it ran, then unlock
    ///
    /// Transfers which ended along the way are reported to the upper layer after the lock is
    /// released.
    pub(crate) fn drain(&self, g: &mut ChannelGuard<'_>, first: Event) {
        let mut next = Some(first);
        while let Some(event) = next {
            match event {
                Event::TxConfirmation => self.on_tx_confirmation(g),
                Event::Frame(pending) => self.on_frame(g, &pending),
                Event::Tick(ticks) => self.on_tick(g, ticks),
                Event::Request => (),
            }
            if g.state() == ChannelState::Idle && g.owner().is_some() {
                g.set_owner(None);
            }
            next = g.next_or_unlock();
        }
        for notification in g.take_notifications() {
            self.notify(notification);
        }
    }

    pub(crate) fn mark_busy(&self) {
        self.busy.fetch_add(1);
    }

    /// End the transfer on the channel, notifying the upper layer with `result` if given
    ///
    /// Stopping an idle channel does nothing. The notification goes out when the channel is
    /// drained.
    pub(crate) fn stop(&self, g: &mut ChannelGuard<'_>, result: Option<Result<(), TpError>>) {
        let Some(direction) = g.state().direction() else {
            return;
        };
        let pdu = g.rec.pdu;
        g.reset();
        // Every busy channel was counted by mark_busy
        debug_assert!(self.busy.load() > 0);
        self.busy.fetch_sub(1);
        match result {
            Some(Err(e)) => warn!("{:?} N-SDU {} failed: {:?}", direction, pdu, e),
            _ => debug!("{:?} N-SDU {} finished", direction, pdu),
        }
        if let Some(result) = result {
            let notification = Notification {
                direction,
                pdu,
                result,
            };
            if let Err(notification) = g.defer_notification(notification) {
                self.notify(notification);
            }
        }
    }

    fn notify(&self, n: Notification) {
        match n.direction {
            Direction::Rx => self.upper.rx_indication(n.pdu, n.result),
            Direction::Tx => self.upper.tx_confirmation(n.pdu, n.result),
        }
    }

    /// Returns true if a channel is waiting for the confirmation of a frame sent on `id`
    pub(crate) fn id_confirming(&self, id: CanId) -> bool {
        self.channels.iter().any(|c| c.confirming_on(id))
    }

    /// Move the channel into a confirmation state on `id`, unless another channel already waits
    /// for a confirmation there
    ///
    /// The check and the state change happen in one critical section, so two channels sharing an
    /// identifier never both have a frame in flight.
    pub(crate) fn claim_id(
        &self,
        g: &mut ChannelGuard<'_>,
        id: CanId,
        confirming: ChannelState,
    ) -> bool {
        critical_section::with(|_| {
            if self.id_confirming(id) {
                return false;
            }
            g.set_state(confirming);
            true
        })
    }

    pub(crate) fn rx_frame_length_ok(&self, pdu: PduId, len: usize) -> bool {
        let cfg = self.rx_cfg(pdu);
        valid_data_length(len, cfg.padding, cfg.max_frame_length)
    }
}
