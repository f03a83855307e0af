use cantp_engine::{
    common::{messages::CanId, BufferError, TpError},
    config::{AddressingFormat, RxNSduConfig, TxNSduConfig},
    CanTpError,
};
use integration_tests::sim_bus::SimNode;
use serial_test::serial;

mod utils;
use utils::*;

#[test]
#[serial]
fn test_single_frame() {
    let bus = new_bus();
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ECU_RX], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    tester.upper.queue_tx(0, &[0x22, 0xF1, 0x90]);
    tester.engine.transmit(0, 3).unwrap();
    bus.pump(&nodes);

    let sent = bus.sent_by(0);
    assert_eq!(1, sent.len());
    assert_eq!(
        &[0x03, 0x22, 0xF1, 0x90, 0xCC, 0xCC, 0xCC, 0xCC],
        sent[0].data()
    );
    assert_eq!(vec![(0, vec![0x22, 0xF1, 0x90])], ecu.upper.received());
    assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
    assert_eq!(0, tester.engine.busy_channels());
    assert_eq!(0, ecu.engine.busy_channels());
}

#[test]
#[serial]
fn test_ten_byte_message() {
    let bus = new_bus();
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ECU_RX], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    let data = payload(10);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 10).unwrap();
    bus.pump(&nodes);

    let history = bus.history();
    assert_eq!(3, history.len());
    // First frame from the tester, with the first 6 bytes
    assert_eq!(0, history[0].sender);
    assert_eq!(&[0x10, 0x0A], &history[0].frame.data()[..2]);
    assert_eq!(&data[..6], &history[0].frame.data()[2..]);
    // Clear to send, no block limit, no separation time
    assert_eq!(1, history[1].sender);
    assert_eq!(RESPONSE_ID, history[1].frame.id());
    assert_eq!(
        &[0x30, 0x00, 0x00, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC],
        history[1].frame.data()
    );
    // One consecutive frame with the remaining 4 bytes, padded
    assert_eq!(0, history[2].sender);
    assert_eq!(0x21, history[2].frame.data()[0]);
    assert_eq!(&data[6..], &history[2].frame.data()[1..5]);
    assert_eq!(&[0xCC, 0xCC, 0xCC], &history[2].frame.data()[5..]);

    assert_eq!(vec![(0, 10)], ecu.upper.rx_starts());
    assert_eq!(vec![(0, data)], ecu.upper.received());
    assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
}

#[test]
#[serial]
fn test_escaped_first_frame_and_sequence_wrap() {
    let bus = new_bus();
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ECU_RX], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    let data = payload(4096);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 4096).unwrap();
    bus.pump(&nodes);

    let sent = bus.sent_by(0);
    assert_eq!(
        &[0x10, 0x00, 0x00, 0x00, 0x10, 0x00],
        &sent[0].data()[..6]
    );
    // 2 bytes in the first frame, 7 in each consecutive frame
    assert_eq!(1 + 585, sent.len());
    for (i, cf) in sent[1..].iter().enumerate() {
        assert_eq!(0x20 | ((i + 1) & 0x0F) as u8, cf.data()[0]);
    }
    assert_eq!(vec![(0, data)], ecu.upper.received());
    assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
}

#[test]
#[serial]
fn test_overflow_refusal() {
    let bus = new_bus();
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ECU_RX], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    ecu.upper.refuse_rx(Some(BufferError::Overflow));
    tester.upper.queue_tx(0, &payload(100));
    tester.engine.transmit(0, 100).unwrap();
    bus.pump(&nodes);

    let ecu_frames = bus.sent_by(1);
    assert_eq!(1, ecu_frames.len());
    assert_eq!(
        &[0x32, 0x00, 0x00, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC],
        ecu_frames[0].data()
    );
    // The upper layer already knows it refused
    assert!(ecu.upper.rx_results().is_empty());
    assert_eq!(0, ecu.engine.busy_channels());
    assert_eq!(vec![(0, Err(TpError::NoBuffer))], tester.upper.tx_results());
}

#[test]
#[serial]
fn test_parallel_channels() {
    let bus = new_bus();
    let tester_tx = [
        TESTER_TX,
        TxNSduConfig {
            tx_id: CanId::std(0x7E1),
            fc_id: CanId::std(0x7E9),
            ..TESTER_TX
        },
        TxNSduConfig {
            tx_id: CanId::std(0x7E2),
            fc_id: CanId::std(0x7EA),
            ..TESTER_TX
        },
    ];
    let ecu_rx = [
        ECU_RX,
        RxNSduConfig {
            rx_id: CanId::std(0x7E1),
            fc_id: CanId::std(0x7E9),
            ..ECU_RX
        },
    ];
    let tester = TestNode::new(bus, 0, &[], &tester_tx);
    let ecu = TestNode::new(bus, 1, &ecu_rx, &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    let first = payload(50);
    let second: Vec<u8> = payload(70).iter().map(|b| !b).collect();
    tester.upper.queue_tx(0, &first);
    tester.upper.queue_tx(1, &second);
    tester.engine.transmit(0, 50).unwrap();
    tester.engine.transmit(1, 70).unwrap();
    assert_eq!(2, tester.engine.busy_channels());

    // Every channel is taken, and an N-SDU can only have one transfer at a time
    assert_eq!(Err(CanTpError::NoChannel), tester.engine.transmit(2, 20));
    assert_eq!(
        Err(CanTpError::Busy { id: 0 }),
        tester.engine.transmit(0, 20)
    );

    bus.pump(&nodes);

    let mut received = ecu.upper.received();
    received.sort();
    assert_eq!(vec![(0, first), (1, second)], received);
    let mut results = tester.upper.tx_results();
    results.sort_by_key(|(id, _)| *id);
    assert_eq!(vec![(0, Ok(())), (1, Ok(()))], results);
    assert_eq!(0, tester.engine.busy_channels());
}

#[test]
#[serial]
fn test_block_size_and_separation_time() {
    let bus = new_bus();
    let ecu_rx = RxNSduConfig {
        block_size: 2,
        st_min: 5,
        ..ECU_RX
    };
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    // 6 bytes in the first frame, then 5 consecutive frames in blocks of 2
    let data = payload(40);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 40).unwrap();
    bus.pump(&nodes);
    bus.advance(&nodes, 100);

    assert_eq!(
        vec![(0x30, 2, 5), (0x30, 2, 5), (0x30, 2, 5)],
        flow_controls(&bus.sent_by(1), 0)
    );
    let cf_ticks: Vec<u32> = bus
        .history()
        .iter()
        .filter(|r| r.sender == 0 && r.frame.data()[0] & 0xF0 == 0x20)
        .map(|r| r.tick)
        .collect();
    assert_eq!(5, cf_ticks.len());
    // Separation time applies between the frames of a block
    assert!(cf_ticks[1] - cf_ticks[0] >= 5);
    assert!(cf_ticks[3] - cf_ticks[2] >= 5);

    assert_eq!(vec![(0, data)], ecu.upper.received());
    assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
}

#[test]
#[serial]
fn test_block_size_limited_by_buffer() {
    let bus = new_bus();
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ECU_RX], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    // Room for three consecutive frames at a time
    ecu.upper.set_rx_window(21);
    let data = payload(100);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 100).unwrap();
    bus.pump(&nodes);

    let fcs = flow_controls(&bus.sent_by(1), 0);
    assert!(!fcs.is_empty());
    assert!(fcs.iter().all(|&fc| fc == (0x30, 3, 0)));
    assert_eq!(vec![(0, data)], ecu.upper.received());
}

#[test]
#[serial]
fn test_wait_frames_while_buffer_busy() {
    let bus = new_bus();
    let ecu_rx = RxNSduConfig {
        wft_max: 2,
        ..ECU_RX
    };
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    ecu.upper.delay_rx(8);
    let data = payload(20);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 20).unwrap();
    bus.pump(&nodes);
    bus.advance(&nodes, 30);

    let fcs = flow_controls(&bus.sent_by(1), 0);
    assert_eq!((0x31, 0, 0), fcs[0]);
    assert_eq!(Some(&(0x30, 0, 0)), fcs.last());
    assert_eq!(vec![(0, data)], ecu.upper.received());
    assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
}

#[test]
#[serial]
fn test_wait_frame_overrun() {
    let bus = new_bus();
    let ecu_rx = RxNSduConfig {
        wft_max: 1,
        ..ECU_RX
    };
    let tester = TestNode::new(bus, 0, &[], &[TESTER_TX]);
    let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    ecu.upper.delay_rx(1000);
    tester.upper.queue_tx(0, &payload(20));
    tester.engine.transmit(0, 20).unwrap();
    bus.pump(&nodes);
    bus.advance(&nodes, 30);

    assert_eq!(vec![(0x31, 0, 0)], flow_controls(&bus.sent_by(1), 0));
    assert_eq!(vec![(0, Err(TpError::WftOverrun))], ecu.upper.rx_results());
    assert_eq!(vec![(0, Err(TpError::TimeoutBs))], tester.upper.tx_results());
}

#[test]
#[serial]
fn test_can_fd_transfer() {
    let bus = new_bus();
    let tester_tx = TxNSduConfig {
        max_frame_length: 64,
        ..TESTER_TX
    };
    let ecu_rx = RxNSduConfig {
        max_frame_length: 64,
        ..ECU_RX
    };
    let tester = TestNode::new(bus, 0, &[], &[tester_tx]);
    let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    let data = payload(100);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 100).unwrap();
    bus.pump(&nodes);

    let sent = bus.sent_by(0);
    assert_eq!(2, sent.len());
    assert!(sent.iter().all(|f| f.is_fd()));
    // 62 bytes in the first frame, the remaining 38 padded up to a valid FD length
    assert_eq!(64, sent[0].len());
    assert_eq!(&[0x10, 100], &sent[0].data()[..2]);
    assert_eq!(48, sent[1].len());
    assert_eq!(0x21, sent[1].data()[0]);
    assert_eq!(vec![(0, data)], ecu.upper.received());

    // A single frame longer than 7 bytes uses the escaped length
    let data = payload(20);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 20).unwrap();
    bus.pump(&nodes);
    let sf = *bus.sent_by(0).last().unwrap();
    assert_eq!(24, sf.len());
    assert_eq!(&[0x00, 20], &sf.data()[..2]);
    assert_eq!((0, data), ecu.upper.received()[1]);
}

#[test]
#[serial]
fn test_fd_receiver_accepts_shorter_frames() {
    let ecu_rx = RxNSduConfig {
        max_frame_length: 64,
        ..ECU_RX
    };
    for (sender_frame_length, len) in [(8, 20), (16, 40)] {
        let bus = new_bus();
        let tester_tx = TxNSduConfig {
            max_frame_length: sender_frame_length,
            ..TESTER_TX
        };
        let tester = TestNode::new(bus, 0, &[], &[tester_tx]);
        let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
        let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

        let data = payload(len);
        tester.upper.queue_tx(0, &data);
        tester.engine.transmit(0, len as u32).unwrap();
        bus.pump(&nodes);

        assert_eq!(sender_frame_length, bus.sent_by(0)[0].len());
        assert_eq!(vec![(0, data)], ecu.upper.received());
        assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
        // Flow control follows the sender's frame format
        let fc = bus.sent_by(1);
        assert_eq!(1, fc.len());
        assert_eq!(8, fc[0].len());
        assert_eq!(sender_frame_length > 8, fc[0].is_fd());
    }
}

#[test]
#[serial]
fn test_unpadded_frames() {
    let bus = new_bus();
    let tester_tx = TxNSduConfig {
        padding: false,
        ..TESTER_TX
    };
    let ecu_rx = RxNSduConfig {
        padding: false,
        ..ECU_RX
    };
    let tester = TestNode::new(bus, 0, &[], &[tester_tx]);
    let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    let data = payload(10);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, 10).unwrap();
    bus.pump(&nodes);

    let history = bus.history();
    assert_eq!(8, history[0].frame.len());
    assert_eq!(3, history[1].frame.len());
    assert_eq!(5, history[2].frame.len());
    assert_eq!(vec![(0, data)], ecu.upper.received());
}

fn round_trip(tester_tx: TxNSduConfig, ecu_rx: RxNSduConfig, len: usize) -> Vec<CanId> {
    let bus = new_bus();
    let tester = TestNode::new(bus, 0, &[], &[tester_tx]);
    let ecu = TestNode::new(bus, 1, &[ecu_rx], &[]);
    let nodes: [&dyn SimNode; 2] = [tester.engine, ecu.engine];

    let data = payload(len);
    tester.upper.queue_tx(0, &data);
    tester.engine.transmit(0, len as u32).unwrap();
    bus.pump(&nodes);

    assert_eq!(vec![(0, data)], ecu.upper.received());
    assert_eq!(vec![(0, Ok(()))], tester.upper.tx_results());
    let history = bus.history();
    if tester_tx.is_fd() {
        assert!(history.iter().all(|r| r.frame.is_fd()));
    }
    // Address bytes in front of every frame
    if tester_tx.addressing.pci_offset() == 1 {
        for record in &history {
            let expected = match (tester_tx.addressing, record.sender) {
                (AddressingFormat::Extended, 0) => tester_tx.n_ta,
                (AddressingFormat::Extended, _) => tester_tx.n_sa,
                _ => tester_tx.n_ae,
            };
            assert_eq!(expected, record.frame.data()[0]);
        }
    }
    history.iter().map(|r| r.frame.id()).collect()
}

/// Run a segmented exchange on classic frames, then on 64 byte CAN-FD frames
fn classic_and_fd_round_trips(
    tester_tx: TxNSduConfig,
    ecu_rx: RxNSduConfig,
) -> [Vec<CanId>; 2] {
    let classic = round_trip(tester_tx, ecu_rx, 30);
    let fd = round_trip(
        TxNSduConfig {
            max_frame_length: 64,
            ..tester_tx
        },
        RxNSduConfig {
            max_frame_length: 64,
            ..ecu_rx
        },
        150,
    );
    [classic, fd]
}

#[test]
#[serial]
fn test_extended_addressing() {
    let tester_tx = TxNSduConfig {
        tx_id: CanId::std(0x600),
        fc_id: CanId::std(0x601),
        addressing: AddressingFormat::Extended,
        n_sa: 0xF1,
        n_ta: 0x22,
        ..TESTER_TX
    };
    let ecu_rx = RxNSduConfig {
        rx_id: CanId::std(0x600),
        fc_id: CanId::std(0x601),
        addressing: AddressingFormat::Extended,
        n_sa: 0xF1,
        n_ta: 0x22,
        ..ECU_RX
    };
    classic_and_fd_round_trips(tester_tx, ecu_rx);
}

#[test]
#[serial]
fn test_mixed_addressing() {
    let tester_tx = TxNSduConfig {
        tx_id: CanId::std(0x610),
        fc_id: CanId::std(0x611),
        addressing: AddressingFormat::Mixed,
        n_ae: 0x55,
        ..TESTER_TX
    };
    let ecu_rx = RxNSduConfig {
        rx_id: CanId::std(0x610),
        fc_id: CanId::std(0x611),
        addressing: AddressingFormat::Mixed,
        n_ae: 0x55,
        ..ECU_RX
    };
    classic_and_fd_round_trips(tester_tx, ecu_rx);
}

#[test]
#[serial]
fn test_normal_fixed_addressing() {
    let tester_tx = TxNSduConfig {
        addressing: AddressingFormat::NormalFixed,
        n_sa: 0xF1,
        n_ta: 0x10,
        ..TESTER_TX
    };
    let ecu_rx = RxNSduConfig {
        addressing: AddressingFormat::NormalFixed,
        n_sa: 0xF1,
        n_ta: 0x10,
        ..ECU_RX
    };
    for ids in classic_and_fd_round_trips(tester_tx, ecu_rx) {
        assert_eq!(CanId::extended(0x18DA_10F1), ids[0]);
        assert_eq!(CanId::extended(0x18DA_F110), ids[1]);
    }
}
