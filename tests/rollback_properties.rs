use esp32_ap_ota::boot::validate_boot;
use esp32_ap_ota::boot_diagnostics::DiagnosticResult;
use esp32_ap_ota::ota::image::assemble_image;
use esp32_ap_ota::ota::{
    BankId, BankState, CancelReason, ImageStore, MemoryImageStore, StoreError, TransferEngine,
    TransferError, TransferState,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Begin,
    Chunk(Vec<u8>),
    HeaderChunk(Vec<u8>),
    WholeImage,
    Finish,
    Cancel,
    TransportError,
    WriteFaultAt(usize),
    Reboot { healthy: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Begin),
        2 => prop::collection::vec(any::<u8>(), 0..48).prop_map(Op::Chunk),
        2 => prop::collection::vec(any::<u8>(), 0..48).prop_map(|mut bytes| {
            bytes.insert(0, 0xE9);
            Op::HeaderChunk(bytes)
        }),
        3 => Just(Op::WholeImage),
        3 => Just(Op::Finish),
        1 => Just(Op::Cancel),
        1 => Just(Op::TransportError),
        1 => (0usize..600).prop_map(Op::WriteFaultAt),
        2 => any::<bool>().prop_map(|healthy| Op::Reboot { healthy }),
    ]
}

fn image() -> Vec<u8> {
    assemble_image(0x4037_5000, &[(0x3fc8_8000, &[0x77u8; 200][..])], true)
}

fn start(mut store: MemoryImageStore, healthy: bool) -> TransferEngine<MemoryImageStore> {
    // a rollback restarts; keep power-cycling until some bank is allowed to run
    for _ in 0..3 {
        store.reboot();
        let outcome = validate_boot(
            &mut store,
            &mut |_: BankId| {
                if healthy {
                    DiagnosticResult::ok()
                } else {
                    DiagnosticResult::failed("unhealthy")
                }
            },
            &mut || {},
        )
        .unwrap();
        if let Some(token) = outcome.proceed() {
            return TransferEngine::new(store, token);
        }
    }
    panic!("device never settled on a bank");
}

fn boot_target_is_bootable(store: &MemoryImageStore) -> bool {
    let boot = store.current_boot_bank().unwrap();
    store.bank_state(boot).unwrap().is_bootable()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn boot_target_never_invalid(ops in prop::collection::vec(arb_op(), 1..40)) {
        let image = image();
        let mut engine = Some(start(MemoryImageStore::new(4096), true));

        for op in ops {
            let mut current = engine.take().unwrap();
            let boot_before = current.store().current_boot_bank().unwrap();

            match op {
                Op::Begin => {
                    let open_before = current.is_receiving();
                    let received_before = current.watch().received();
                    let result = current.begin();
                    if open_before {
                        let single_writer = matches!(result, Err(TransferError::SessionActive { .. }));
                        prop_assert!(single_writer);
                        prop_assert!(current.is_receiving());
                        prop_assert_eq!(current.watch().received(), received_before);
                    }
                }
                Op::Chunk(bytes) | Op::HeaderChunk(bytes) => {
                    let _ = current.write_chunk(&bytes);
                }
                Op::WholeImage => {
                    let _ = current.write_chunk(&image);
                }
                Op::Finish => {
                    if current.finish().is_err() {
                        prop_assert_eq!(current.store().current_boot_bank().unwrap(), boot_before);
                    }
                }
                Op::Cancel => {
                    let _ = current.cancel(CancelReason::Requested);
                    prop_assert!(current.cancel(CancelReason::Requested).is_none());
                    prop_assert_eq!(current.state(), TransferState::Idle);
                }
                Op::TransportError => {
                    let _ = current.fail("connection reset");
                    prop_assert!(current.fail("connection reset").is_none());
                }
                Op::WriteFaultAt(at) => current.store_mut().fail_writes_at(at),
                Op::Reboot { healthy } => {
                    current = start(current.into_store(), healthy);
                }
            }

            prop_assert!(boot_target_is_bootable(current.store()));
            if !current.is_receiving() {
                prop_assert_eq!(current.state(), TransferState::Idle);
            }
            engine = Some(current);
        }
    }

    #[test]
    fn failed_finalize_keeps_boot_bank(payload in prop::collection::vec(any::<u8>(), 31..400)) {
        let mut engine = start(MemoryImageStore::new(4096), true);
        let mut bytes = payload;
        bytes[0] = 0xE9;
        // random tails are never a checksummed image
        bytes.resize(bytes.len().max(33), 0x00);
        bytes[1] = 0;

        engine.begin().unwrap();
        let _ = engine.write_chunk(&bytes);
        let result = engine.finish();

        let rejected = matches!(
            result,
            Err(TransferError::Store { source: StoreError::IncompleteImage { .. }, .. })
        );
        prop_assert!(rejected);
        prop_assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
        prop_assert_eq!(engine.store().bank_state(BankId::B).unwrap(), BankState::Invalid);
    }

    #[test]
    fn abort_is_idempotent(prefix in prop::collection::vec(any::<u8>(), 0..64), repeats in 1usize..5) {
        let mut engine = start(MemoryImageStore::new(4096), true);
        engine.begin().unwrap();
        let _ = engine.write_chunk(&prefix);
        let was_open = engine.is_receiving();

        let first = engine.cancel(CancelReason::Requested);
        prop_assert_eq!(first.is_some(), was_open);
        let store_after_first = engine.store().clone();
        for _ in 0..repeats {
            prop_assert!(engine.cancel(CancelReason::Requested).is_none());
        }
        prop_assert_eq!(engine.state(), TransferState::Idle);
        prop_assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
        prop_assert_eq!(engine.store().record(BankId::B), store_after_first.record(BankId::B));
    }
}
