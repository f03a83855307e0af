//! Drivers which confirm frames and deliver new ones from inside `transmit`
use cantp_engine::{
    common::{pci::FrameType, TpError},
    config::{CanTpConfig, RxNSduConfig, TxNSduConfig},
    ApiId, CanTp, DetError,
};
use integration_tests::{hook_driver::HookDriver, test_upper::TestUpper};
use serial_test::serial;

mod utils;
use utils::*;

const FF_20: [u8; 8] = [0x10, 0x14, 1, 2, 3, 4, 5, 6];
const CF_1: [u8; 8] = [0x21, 7, 8, 9, 10, 11, 12, 13];
const CF_2: [u8; 8] = [0x22, 14, 15, 16, 17, 18, 19, 20];

struct HookedNode {
    driver: &'static HookDriver,
    engine: &'static CanTp<'static, CHANNELS>,
    upper: &'static TestUpper,
}

impl HookedNode {
    fn new(rx: &[RxNSduConfig], tx: &[TxNSduConfig]) -> Self {
        let rx: &'static [RxNSduConfig] = Box::leak(rx.to_vec().into_boxed_slice());
        let tx: &'static [TxNSduConfig] = Box::leak(tx.to_vec().into_boxed_slice());
        let config: &'static CanTpConfig = Box::leak(Box::new(CanTpConfig::new(rx, tx, PERIOD_US)));
        let driver: &'static HookDriver = Box::leak(Box::new(HookDriver::new()));
        let upper: &'static TestUpper = Box::leak(Box::new(TestUpper::new()));
        let engine: &'static CanTp<'static, CHANNELS> =
            Box::leak(Box::new(CanTp::new(config, driver, upper).unwrap()));
        engine.init();
        Self {
            driver,
            engine,
            upper,
        }
    }
}

#[test]
#[serial]
fn test_confirmation_inside_transmit() {
    let node = HookedNode::new(&[], &[TESTER_TX]);
    let engine = node.engine;
    node.driver.set_hook(move |sent| {
        engine.tx_confirmation(sent.id());
        if frame_type(sent, 0) == Some(FrameType::First) {
            engine.rx_indication(&frame(
                RESPONSE_ID,
                &[0x30, 0, 0, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC],
            ));
        }
    });

    let data = payload(20);
    node.upper.queue_tx(0, &data);
    engine.transmit(0, 20).unwrap();

    // Every event was replayed before transmit returned
    let sent = node.driver.sent();
    assert_eq!(
        vec![0x10, 0x21, 0x22],
        sent.iter().map(|f| f.data()[0]).collect::<Vec<_>>()
    );
    assert_eq!(&data[..6], &sent[0].data()[2..]);
    assert_eq!(vec![(0, Ok(()))], node.upper.tx_results());
    assert_eq!(0, engine.busy_channels());
}

#[test]
#[serial]
fn test_consecutive_frame_inside_flow_control_transmit() {
    let node = HookedNode::new(&[ECU_RX], &[]);
    let engine = node.engine;
    node.driver.set_hook(move |sent| {
        engine.rx_indication(&frame(REQUEST_ID, &CF_1));
        engine.tx_confirmation(sent.id());
    });

    engine.rx_indication(&frame(REQUEST_ID, &FF_20));
    assert_eq!(vec![(0x30, 0, 0)], flow_controls(&node.driver.sent(), 0));
    // The first consecutive frame was held until the flow control was confirmed
    assert!(node.upper.rx_results().is_empty());

    engine.rx_indication(&frame(REQUEST_ID, &CF_2));
    assert_eq!(vec![(0, Ok(()))], node.upper.rx_results());
    assert_eq!(vec![(0, (1..=20).collect::<Vec<u8>>())], node.upper.received());
}

#[test]
#[serial]
fn test_frame_overwritten_while_locked() {
    let node = HookedNode::new(&[ECU_RX], &[]);
    capture_det(node.engine);
    let engine = node.engine;
    node.driver.set_hook(move |sent| {
        engine.rx_indication(&frame(REQUEST_ID, &CF_1));
        engine.rx_indication(&frame(REQUEST_ID, &CF_2));
        engine.tx_confirmation(sent.id());
    });

    engine.rx_indication(&frame(REQUEST_ID, &FF_20));

    // Only the newer frame is replayed, and it is out of sequence
    assert_eq!(
        vec![(ApiId::RxIndication, DetError::OverwriteFrame)],
        det_errors()
    );
    assert_eq!(vec![(0, Err(TpError::WrongSn))], node.upper.rx_results());
    assert_eq!(0, engine.busy_channels());
}
