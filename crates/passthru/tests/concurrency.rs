//! Interrupt-driven refreshes racing control-surface operations

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use nexum_pcsc_passthru::regs::{
    REG_READER_ATR_LEN, REG_READER_CONTROL, REG_READER_RX_ADDR, REG_READER_RX_SIZE,
    REG_READER_STATE, reader_block_offset,
};
use nexum_pcsc_passthru::sim::RegisterAccess;
use nexum_pcsc_passthru::{
    Command, ControlWord, PassthruError, Protocols, ReaderEvent, ReaderSnapshot, ShareMode,
};

use common::{TEST_ATR, attach, test_card};

const ROUNDS: usize = 200;

#[test]
fn test_refresh_and_transmit_never_interleave() {
    let (hw, device) = attach(1);
    hw.insert_card(0, test_card());
    let device = Arc::new(device);
    let done = Arc::new(AtomicBool::new(false));

    let worker = {
        let device = device.clone();
        let done = done.clone();
        thread::spawn(move || {
            let reader = device.reader(0).unwrap();
            let mut exchanged = 0usize;
            while !done.load(Ordering::Relaxed) {
                match reader.connect(Protocols::ANY) {
                    Ok(_) => {}
                    Err(PassthruError::CardAbsent(0)) => continue,
                    Err(err) => panic!("unexpected connect error: {err}"),
                }
                match reader.transmit(&[0x00, 0xB0, 0x00, 0x00], 258) {
                    // a card pulled mid-exchange answers with nothing
                    Ok(response) => {
                        assert!(response.is_empty() || response[..] == [0x90, 0x00]);
                        exchanged += 1;
                    }
                    Err(PassthruError::NotConnected(0) | PassthruError::CardAbsent(0)) => {}
                    Err(err) => panic!("unexpected transmit error: {err}"),
                }
                match reader.disconnect() {
                    Ok(_) | Err(PassthruError::CardAbsent(0)) => {}
                    Err(err) => panic!("unexpected disconnect error: {err}"),
                }
            }
            exchanged
        })
    };

    for _ in 0..ROUNDS {
        hw.remove_card(0);
        hw.insert_card(0, test_card());
    }
    done.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    let reader = device.reader(0).unwrap();
    let change = reader.refresh_state();
    assert!(change.current.is_present());
}

#[test]
fn test_removal_always_ends_the_session() {
    let (hw, device) = attach(2);
    let events = device.subscribe();

    for round in 0..ROUNDS {
        hw.insert_card(0, test_card());
        let reader = device.reader(0).unwrap();
        reader.connect(Protocols::T1).unwrap();

        hw.remove_card(0);
        assert!(!reader.is_connected(), "round {round}");
    }

    let lost = events
        .try_iter()
        .filter(|event| matches!(event, ReaderEvent::SessionLost { reader: 0 }))
        .count();
    assert_eq!(lost, ROUNDS);
}

#[test]
fn test_readers_operate_independently() {
    let (hw, device) = attach(2);
    hw.insert_card(0, test_card());
    hw.insert_card(1, test_card());
    let device = Arc::new(device);

    let workers: Vec<_> = (0..2)
        .map(|index| {
            let device = device.clone();
            thread::spawn(move || {
                let reader = device.reader(index).unwrap();
                reader.connect(Protocols::ANY).unwrap();
                for _ in 0..ROUNDS {
                    let response = reader.transmit(&[0x80, 0xCA, 0x00, 0x00], 258).unwrap();
                    assert_eq!(&response[..], &[0x90, 0x00]);
                }
                reader.disconnect().unwrap();
            })
        })
        .collect();

    for _ in 0..ROUNDS {
        device.handle_interrupt();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(device.readers().iter().all(|reader| !reader.is_connected()));
}

#[test]
fn test_connect_transaction_is_one_unbroken_run() {
    let (hw, device) = attach(1);
    hw.insert_card(0, test_card());
    let device = Arc::new(device);
    let done = Arc::new(AtomicBool::new(false));
    hw.clear_accesses();

    let refresher = {
        let device = device.clone();
        let done = done.clone();
        thread::spawn(move || {
            let reader = device.reader(0).unwrap();
            while !done.load(Ordering::Relaxed) {
                reader.refresh_state();
            }
        })
    };

    let reader = device.reader(0).unwrap();
    for _ in 0..ROUNDS {
        reader.connect(Protocols::ANY).unwrap();
        reader.disconnect().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    refresher.join().unwrap();

    let base = reader_block_offset(0);
    let control = base + REG_READER_CONTROL;
    let connect_word = ControlWord::connect(Protocols::ANY, ShareMode::Shared).bits();
    let read_atr_word = ControlWord::new(Command::ReadAtr).bits();
    let log = hw.accesses();

    let starts: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, access)| {
            **access
                == RegisterAccess::Write {
                    offset: control,
                    value: connect_word,
                }
        })
        .map(|(at, _)| at)
        .collect();
    assert_eq!(starts.len(), ROUNDS);

    for at in starts {
        let run = &log[at + 1..at + 5];
        let atr_len = base + REG_READER_ATR_LEN;
        let rx_addr = base + REG_READER_RX_ADDR;
        let rx_size = base + REG_READER_RX_SIZE;
        assert!(
            matches!(run[0], RegisterAccess::Read { offset, .. } if offset == atr_len),
            "ATR length read follows connect at {at}: {run:?}"
        );
        assert!(
            matches!(run[1], RegisterAccess::Write { offset, .. } if offset == rx_addr),
            "rx address follows at {at}: {run:?}"
        );
        assert!(
            matches!(run[2], RegisterAccess::Write { offset, .. } if offset == rx_size),
            "rx size follows at {at}: {run:?}"
        );
        assert_eq!(
            run[3],
            RegisterAccess::Write {
                offset: control,
                value: read_atr_word,
            },
            "read-ATR command closes the run at {at}"
        );
        assert!(
            !run.iter().any(|access| matches!(
                access,
                RegisterAccess::Read { offset, .. } if *offset == base + REG_READER_STATE
            )),
            "no status read inside the run at {at}"
        );
    }
}

#[test]
fn test_racing_refresh_and_connect_match_a_serial_order() {
    let (hw, device) = attach(3);
    for slot in 0..3 {
        hw.insert_card(slot, test_card());
    }
    let as_reader_zero = |snapshot: ReaderSnapshot| ReaderSnapshot {
        index: 0,
        ..snapshot
    };

    // the two outcomes a serial execution can produce
    let refresh_first = {
        let reader = device.reader(1).unwrap();
        reader.refresh_state();
        reader.connect(Protocols::ANY).unwrap();
        as_reader_zero(reader.snapshot())
    };
    let connect_first = {
        let reader = device.reader(2).unwrap();
        reader.connect(Protocols::ANY).unwrap();
        reader.refresh_state();
        as_reader_zero(reader.snapshot())
    };
    assert_ne!(refresh_first, connect_first);
    assert_eq!(refresh_first.atr.map(|atr| atr.len()), Some(TEST_ATR.len()));

    let device = Arc::new(device);
    for round in 0..ROUNDS {
        let reader = device.reader(0).unwrap();
        reader.disconnect().unwrap();
        reader.refresh_state();

        let barrier = Arc::new(Barrier::new(2));
        let refresher = {
            let device = device.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let reader = device.reader(0).unwrap();
                barrier.wait();
                reader.refresh_state();
            })
        };
        barrier.wait();
        reader.connect(Protocols::ANY).unwrap();
        refresher.join().unwrap();

        let snapshot = reader.snapshot();
        assert!(
            snapshot == refresh_first || snapshot == connect_first,
            "round {round}: {snapshot:?}"
        );
    }
}
