#![allow(dead_code)]
use std::{future::Future, sync::Mutex, time::Duration};

use cantp_engine::{
    common::{messages::CanId, pci::FrameType, CanFrame},
    config::{CanTpConfig, RxNSduConfig, TxNSduConfig},
    ApiId, CanTp, DetError,
};
use crossbeam::channel::Receiver;
use integration_tests::{
    sim_bus::{BusRecord, SimBus, SimNode},
    test_upper::TestUpper,
};

/// Channels of every test engine
pub const CHANNELS: usize = 2;

/// An engine on the simulated bus, with the upper layer it reports to
///
/// Everything is leaked so the fixtures can be shared freely by test tasks.
pub struct TestNode {
    pub engine: &'static CanTp<'static, CHANNELS>,
    pub upper: &'static TestUpper,
}

impl TestNode {
    pub fn new(
        bus: &'static SimBus,
        index: usize,
        rx: &[RxNSduConfig],
        tx: &[TxNSduConfig],
    ) -> Self {
        let rx: &'static [RxNSduConfig] = Box::leak(rx.to_vec().into_boxed_slice());
        let tx: &'static [TxNSduConfig] = Box::leak(tx.to_vec().into_boxed_slice());
        let config: &'static CanTpConfig = Box::leak(Box::new(CanTpConfig::new(rx, tx, PERIOD_US)));
        let driver: &'static _ = Box::leak(Box::new(bus.driver(index)));
        let upper: &'static TestUpper = Box::leak(Box::new(TestUpper::new()));
        let engine: &'static CanTp<'static, CHANNELS> =
            Box::leak(Box::new(CanTp::new(config, driver, upper).unwrap()));
        engine.init();
        Self { engine, upper }
    }
}

pub fn new_bus() -> &'static SimBus {
    Box::leak(Box::new(SimBus::new()))
}

/// Main function period used by every test configuration
pub const PERIOD_US: u32 = 1000;

/// Tester to ECU requests
pub const REQUEST_ID: CanId = CanId::std(0x7E0);
/// ECU to tester responses, and the ECU's flow control
pub const RESPONSE_ID: CanId = CanId::std(0x7E8);

/// Timers short enough to expire within a test: 10 periods for everything but N_Br/N_Cs
pub const TX_FAST: TxNSduConfig = TxNSduConfig {
    n_as_us: 10_000,
    n_bs_us: 10_000,
    n_cs_us: 5_000,
    ..TxNSduConfig::DEFAULT
};

pub const RX_FAST: RxNSduConfig = RxNSduConfig {
    n_ar_us: 10_000,
    n_br_us: 5_000,
    n_cr_us: 10_000,
    ..RxNSduConfig::DEFAULT
};

/// Tester side of the 0x7E0/0x7E8 pair
pub const TESTER_TX: TxNSduConfig = TxNSduConfig {
    tx_id: REQUEST_ID,
    fc_id: RESPONSE_ID,
    ..TX_FAST
};

pub const TESTER_RX: RxNSduConfig = RxNSduConfig {
    rx_id: RESPONSE_ID,
    fc_id: REQUEST_ID,
    ..RX_FAST
};

/// ECU side of the 0x7E0/0x7E8 pair
pub const ECU_RX: RxNSduConfig = RxNSduConfig {
    rx_id: REQUEST_ID,
    fc_id: RESPONSE_ID,
    ..RX_FAST
};

pub const ECU_TX: TxNSduConfig = TxNSduConfig {
    tx_id: RESPONSE_ID,
    fc_id: REQUEST_ID,
    ..TX_FAST
};

pub fn frame(id: CanId, data: &[u8]) -> CanFrame {
    CanFrame::new(id, data).unwrap()
}

pub fn frame_type(frame: &CanFrame, offset: usize) -> Option<FrameType> {
    FrameType::from_pci_byte(frame.data()[offset])
}

/// Flow control frames among `frames`, as (flow status byte, block size, STmin)
pub fn flow_controls(frames: &[CanFrame], offset: usize) -> Vec<(u8, u8, u8)> {
    frames
        .iter()
        .filter(|f| frame_type(f, offset) == Some(FrameType::FlowControl))
        .map(|f| {
            let d = &f.data()[offset..];
            (d[0], d[1], d[2])
        })
        .collect()
}

/// A recognizable message body
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

static DET_LOG: Mutex<Vec<(ApiId, DetError)>> = Mutex::new(Vec::new());

fn record_det(api: ApiId, error: DetError) {
    DET_LOG.lock().unwrap().push((api, error));
}

/// Start collecting the development errors reported by `engine`
pub fn capture_det<const N: usize>(engine: &CanTp<'_, N>) {
    DET_LOG.lock().unwrap().clear();
    engine.set_error_callback(&record_det);
}

pub fn det_errors() -> Vec<(ApiId, DetError)> {
    DET_LOG.lock().unwrap().clone()
}

/// Run `test_task` while the main functions tick and the bus delivers frames in the background
pub async fn test_with_background_process<T>(
    bus: &SimBus,
    nodes: &[&dyn SimNode],
    test_task: impl Future<Output = T>,
) -> T {
    let process_task = async {
        loop {
            tokio::time::sleep(Duration::from_micros(PERIOD_US as u64)).await;
            bus.advance(nodes, 1);
        }
    };

    tokio::select! {
        _ = process_task => panic!("Process task exited"),
        test_result = test_task => test_result
    }
}

/// Wait for `done` to hold, polling every millisecond
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("Timed out waiting for the transfer");
}

pub struct BusLogger {
    rx: Receiver<BusRecord>,
}

impl BusLogger {
    pub fn new(rx: Receiver<BusRecord>) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Ok(record) = self.rx.try_recv() {
            println!(
                "{:>5} node {:>2} {:?} {:02X?}",
                record.tick,
                record.sender as isize,
                record.frame.id(),
                record.frame.data()
            );
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}
