use esp32_ap_ota::boot::{validate_boot, BootOutcome, BootValidated};
use esp32_ap_ota::boot_diagnostics::{AlwaysHealthy, DiagnosticResult};
use esp32_ap_ota::network::upload_response;
use esp32_ap_ota::ota::image::assemble_image;
use esp32_ap_ota::ota::memory::header_check;
use esp32_ap_ota::ota::{
    BankId, BankRecord, BankState, ImageStore, MemoryImageStore, ReadSource, SessionOutcome,
    TransferEngine, TransferError, TransferEvent, TransferState,
};
use std::sync::mpsc::{channel, Receiver};

fn boot(store: &mut MemoryImageStore) -> BootValidated {
    validate_boot(store, &mut AlwaysHealthy, &mut || panic!("unexpected restart"))
        .unwrap()
        .proceed()
        .unwrap()
}

fn engine(mut store: MemoryImageStore) -> (TransferEngine<MemoryImageStore>, Receiver<TransferEvent>) {
    let token = boot(&mut store);
    let (tx, rx) = channel();
    let mut engine = TransferEngine::new(store, token);
    engine.set_observer(Box::new(tx));
    (engine, rx)
}

fn transitions(rx: &Receiver<TransferEvent>) -> Vec<TransferState> {
    rx.try_iter()
        .filter_map(|event| match event {
            TransferEvent::State { state } => Some(state),
            _ => None,
        })
        .collect()
}

fn upload(engine: &mut TransferEngine<MemoryImageStore>, bytes: &[u8]) -> Result<esp32_ap_ota::ota::TransferReport, TransferError> {
    let mut source = ReadSource::new(bytes, 16);
    engine.run_upload(&mut source)
}

fn firmware() -> Vec<u8> {
    let code = [0x13u8; 300];
    let data = [0x42u8; 77];
    assemble_image(0x4037_5a30, &[(0x4037_0000, &code[..]), (0x3fc9_0000, &data[..])], true)
}

#[test]
fn scenario_a_valid_header_commits() {
    let (mut engine, rx) = engine(MemoryImageStore::new(64 * 1024).with_check(header_check));
    let mut image = vec![0u8; 40];
    image[0] = 0xE9;

    let report = upload(&mut engine, &image).unwrap();

    assert_eq!(report.bank, BankId::B);
    assert_eq!(report.bytes, 40);
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Committed));
    assert_eq!(
        transitions(&rx),
        vec![TransferState::Receiving, TransferState::Committing, TransferState::Idle]
    );
    assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::B);
    assert_eq!(engine.store().bank_state(BankId::B).unwrap(), BankState::Unverified);
}

#[test]
fn scenario_b_bad_magic_aborts() {
    let (mut engine, rx) = engine(MemoryImageStore::new(64 * 1024).with_check(header_check));
    let image = vec![0u8; 40];

    let err = upload(&mut engine, &image).unwrap_err();

    assert!(matches!(err, TransferError::InvalidHeader { .. }));
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Aborted));
    assert_eq!(
        transitions(&rx),
        vec![TransferState::Receiving, TransferState::Aborting, TransferState::Idle]
    );
    assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
    assert_eq!(engine.store().bank_state(BankId::B).unwrap(), BankState::Invalid);
    assert_eq!(engine.store().bytes_programmed(), 0);
    assert_eq!(upload_response(&Err(err), false).status, 400);
}

#[test]
fn scenario_c_empty_stream_aborts() {
    let (mut engine, _rx) = engine(MemoryImageStore::new(64 * 1024));

    let err = upload(&mut engine, &[]).unwrap_err();

    assert!(matches!(err, TransferError::EmptyUpload { bank: BankId::B }));
    assert_eq!(engine.last_outcome(), Some(SessionOutcome::Aborted));
    assert!(!engine.store().is_session_open());
    assert!(engine.store().bank_data(BankId::B).is_empty());
    assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
}

fn on_probation() -> MemoryImageStore {
    MemoryImageStore::new(64 * 1024)
        .with_record(BankId::A, BankRecord::new(BankState::Confirmed, false))
        .with_record(BankId::B, BankRecord::new(BankState::Unverified, true))
}

#[test]
fn scenario_d_healthy_probation_is_confirmed() {
    let mut store = on_probation();
    let mut restarts = 0;

    let outcome = validate_boot(
        &mut store,
        &mut |_: BankId| DiagnosticResult::ok(),
        &mut || restarts += 1,
    )
    .unwrap();

    assert!(matches!(outcome, BootOutcome::Confirmed(_)));
    assert_eq!(store.bank_state(BankId::B).unwrap(), BankState::Confirmed);
    assert_eq!(store.current_boot_bank().unwrap(), BankId::B);
    assert_eq!(restarts, 0);
}

#[test]
fn scenario_e_failed_probation_rolls_back() {
    let mut store = on_probation();
    let mut restarts = 0;

    let outcome = validate_boot(
        &mut store,
        &mut |_: BankId| DiagnosticResult::failed("watchdog tripped during init"),
        &mut || restarts += 1,
    )
    .unwrap();

    assert!(matches!(outcome, BootOutcome::RolledBack { from: BankId::B, to: BankId::A, .. }));
    assert_eq!(store.bank_state(BankId::B).unwrap(), BankState::Invalid);
    assert_eq!(store.current_boot_bank().unwrap(), BankId::A);
    assert_eq!(restarts, 1);
}

#[test]
fn scenario_f_confirmed_boot_is_untouched() {
    let mut store = MemoryImageStore::new(64 * 1024);
    let before = (store.record(BankId::A), store.record(BankId::B));
    let mut diagnostic_runs = 0;

    let outcome = validate_boot(
        &mut store,
        &mut |_: BankId| {
            diagnostic_runs += 1;
            DiagnosticResult::ok()
        },
        &mut || panic!("unexpected restart"),
    )
    .unwrap();

    assert!(matches!(outcome, BootOutcome::Steady(_)));
    assert_eq!(diagnostic_runs, 0);
    assert_eq!((store.record(BankId::A), store.record(BankId::B)), before);
}

#[test]
fn real_image_survives_reboot_and_is_confirmed() {
    let (mut engine, _rx) = engine(MemoryImageStore::new(64 * 1024));
    let image = firmware();

    let report = upload(&mut engine, &image).unwrap();
    assert_eq!(report.bytes, image.len());

    let mut store = engine.into_store();
    store.reboot();

    let token = boot(&mut store);
    assert_eq!(token.bank(), BankId::B);
    assert_eq!(store.bank_state(BankId::B).unwrap(), BankState::Confirmed);
    assert_eq!(store.bank_data(BankId::B), &image[..]);

    // the next update goes back into bank A
    let mut engine = TransferEngine::new(store, token);
    assert_eq!(engine.begin().unwrap(), BankId::A);
}

#[test]
fn corrupted_image_never_moves_boot_target() {
    let (mut engine, _rx) = engine(MemoryImageStore::new(64 * 1024));
    let mut image = firmware();
    image[100] ^= 0xFF;

    let err = upload(&mut engine, &image).unwrap_err();

    assert!(matches!(err, TransferError::Store { .. }));
    assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
    assert_eq!(engine.store().bank_state(BankId::B).unwrap(), BankState::Invalid);
    assert_eq!(upload_response(&Err(err), false).status, 400);
}

#[test]
fn oversized_image_is_rejected_with_413() {
    let (mut engine, _rx) = engine(MemoryImageStore::new(256));
    let image = firmware();

    let err = upload(&mut engine, &image).unwrap_err();

    assert_eq!(upload_response(&Err(err), false).status, 413);
    assert_eq!(engine.store().current_boot_bank().unwrap(), BankId::A);
}

#[test]
fn failed_update_then_rollback_returns_to_factory_image() {
    let (mut engine, _rx) = engine(MemoryImageStore::new(64 * 1024));
    upload(&mut engine, &firmware()).unwrap();

    let mut store = engine.into_store();
    store.reboot();
    let mut restarted = false;
    let outcome = validate_boot(
        &mut store,
        &mut |_: BankId| DiagnosticResult::failed("display init failed"),
        &mut || restarted = true,
    )
    .unwrap();
    assert!(restarted);
    assert!(outcome.proceed().is_none());

    store.reboot();
    let token = boot(&mut store);
    assert_eq!(token.bank(), BankId::A);
    assert_eq!(store.bank_state(BankId::A).unwrap(), BankState::Confirmed);
    assert_eq!(store.bank_state(BankId::B).unwrap(), BankState::Invalid);
}
