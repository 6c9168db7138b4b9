//! Write ladder, policy checks and mode reconciliation

use ahc_protocol::registers::{self, packed, TempScale};
use ahc_protocol::{ChannelMode, FunctionCode, Request, SimChannel, SimulatedController};
use ufhsrv::{NormalizeOptions, PollerSettings, UfhSrvError, UrgentEntry};

mod common;
use common::{build_poller, ch, seeded_controller, test_settings};

fn functions(sim: &SimulatedController) -> Vec<FunctionCode> {
    sim.requests().iter().map(Request::function_code).collect()
}

fn config_writes(sim: &SimulatedController) -> usize {
    let addr = registers::config_addr(ch(1));
    sim.requests()
        .iter()
        .filter(|r| r.address() == addr && r.function_code() != FunctionCode::Read)
        .count()
}

#[tokio::test]
async fn test_setpoint_written_with_single_strict_write() {
    let sim = seeded_controller(&[1]);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    poller.write_channel_setpoint(ch(1), 22.5).await.unwrap();

    let raw = TempScale::default().c_to_raw(22.5);
    assert_eq!(
        sim.requests(),
        vec![Request::Write {
            addr: registers::setpoint_addr(ch(1)),
            value: raw,
        }]
    );
    assert_eq!(sim.register(registers::setpoint_addr(ch(1))), raw);

    // The cache only changes once the urgent refresh reads it back
    assert_eq!(poller.get_channel_setpoint(ch(1)), None);
    assert_eq!(poller.urgent_queue(), vec![UrgentEntry::new(ch(1))]);
    poller.step().await;
    assert!(poller
        .get_channel_setpoint(ch(1))
        .is_some_and(|c| (c - 22.5).abs() < 0.01));
}

#[tokio::test]
async fn test_standby_setpoint_targets_standby_register() {
    let sim = seeded_controller(&[3]);
    let mut poller = build_poller(&sim, test_settings(&[3]));

    poller
        .write_channel_standby_setpoint(ch(3), 17.0)
        .await
        .unwrap();

    assert_eq!(
        sim.register(registers::standby_setpoint_addr(ch(3))),
        TempScale::default().c_to_raw(17.0)
    );
    poller.step().await;
    assert!(poller
        .get_channel_standby_setpoint(ch(3))
        .is_some_and(|c| (c - 17.0).abs() < 0.01));
}

#[tokio::test]
async fn test_setpoint_skips_read_modify_write() {
    let sim = seeded_controller(&[1]);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    sim.corrupt_next_responses(2);
    let err = poller.write_channel_setpoint(ch(1), 22.0).await.unwrap_err();

    assert!(matches!(err, UfhSrvError::ProtocolError(_)));
    assert_eq!(
        functions(&sim),
        vec![FunctionCode::Write, FunctionCode::WriteMasked]
    );
    assert!(poller.urgent_queue().is_empty());
}

#[tokio::test]
async fn test_non_finite_setpoint_rejected_without_io() {
    let sim = seeded_controller(&[1]);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    let err = poller
        .write_channel_setpoint(ch(1), f32::NAN)
        .await
        .unwrap_err();
    assert!(matches!(err, UfhSrvError::ValidationError(_)));
    assert_eq!(sim.request_count(), 0);
}

#[tokio::test]
async fn test_group_setpoint_skips_invalid_members() {
    let sim = seeded_controller(&[1, 2]);
    let mut poller = build_poller(&sim, test_settings(&[1, 2]));

    let written = poller.write_group_setpoint(&[1, 0, 2, 17], 19.5).await;

    assert_eq!(written, 2);
    let raw = TempScale::default().c_to_raw(19.5);
    assert_eq!(sim.register(registers::setpoint_addr(ch(1))), raw);
    assert_eq!(sim.register(registers::setpoint_addr(ch(2))), raw);
    assert_eq!(sim.request_count(), 2);
}

#[tokio::test]
async fn test_mode_falls_back_to_masked_write() {
    let sim = seeded_controller(&[1]);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    sim.corrupt_next_responses(1);
    poller.write_channel_mode(ch(1), ChannelMode::Off).await.unwrap();

    assert_eq!(
        functions(&sim),
        vec![FunctionCode::Write, FunctionCode::WriteMasked]
    );
    let config = sim.register(registers::config_addr(ch(1)));
    assert_eq!(registers::decode_mode(config), ChannelMode::Off);
}

#[tokio::test]
async fn test_mode_falls_back_to_read_modify_write() {
    let sim = seeded_controller(&[1]);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    sim.corrupt_next_responses(2);
    poller.write_channel_mode(ch(1), ChannelMode::Off).await.unwrap();

    assert_eq!(
        functions(&sim),
        vec![
            FunctionCode::Write,
            FunctionCode::WriteMasked,
            FunctionCode::Read,
            FunctionCode::Write,
        ]
    );
    let config = sim.register(registers::config_addr(ch(1)));
    assert_eq!(registers::decode_mode(config), ChannelMode::Off);
}

#[tokio::test]
async fn test_strict_channel_stops_after_first_rung() {
    let sim = seeded_controller(&[1]);
    let mut settings = test_settings(&[1]);
    settings.strict_mode_channels.insert(ch(1));
    let mut poller = build_poller(&sim, settings);

    sim.corrupt_next_responses(1);
    let result = poller.write_channel_mode(ch(1), ChannelMode::Off).await;

    assert!(result.is_err());
    assert_eq!(sim.request_count(), 1);
    assert!(poller.urgent_queue().is_empty());
}

#[tokio::test]
async fn test_mode_writes_disabled() {
    let sim = seeded_controller(&[1]);
    let settings = PollerSettings {
        allow_mode_writes: false,
        ..test_settings(&[1])
    };
    let mut poller = build_poller(&sim, settings);

    let err = poller
        .write_channel_mode(ch(1), ChannelMode::Off)
        .await
        .unwrap_err();
    assert!(matches!(err, UfhSrvError::WriteRejected(_)));

    let err = poller
        .normalize_channel(ch(1), NormalizeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UfhSrvError::WriteRejected(_)));
    assert_eq!(sim.request_count(), 0);
}

#[tokio::test]
async fn test_mode_confirmed_by_refresh() {
    let sim = seeded_controller(&[1]);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    poller.write_channel_mode(ch(1), ChannelMode::Off).await.unwrap();
    poller.step().await;

    assert_eq!(poller.get_channel_mode(ch(1)), Some(ChannelMode::Off));
    assert_eq!(config_writes(&sim), 1);
    assert!(poller.urgent_queue().is_empty());
}

#[tokio::test]
async fn test_mode_drift_corrected_then_abandoned() {
    let sim = seeded_controller(&[1]);
    sim.ignore_mode_writes(true);
    let settings = PollerSettings {
        max_mode_reconcile_attempts: 2,
        ..test_settings(&[1])
    };
    let mut poller = build_poller(&sim, settings);

    poller.write_channel_mode(ch(1), ChannelMode::Off).await.unwrap();

    // Each refresh sees HEAT and issues one correction
    poller.step().await;
    assert_eq!(config_writes(&sim), 2);
    poller.step().await;
    assert_eq!(config_writes(&sim), 3);

    // Third refresh gives up without writing or requeueing
    poller.step().await;
    assert_eq!(config_writes(&sim), 3);
    assert!(poller.urgent_queue().is_empty());
    assert_eq!(poller.get_channel_mode(ch(1)), Some(ChannelMode::Heat));

    poller.step().await;
    assert_eq!(config_writes(&sim), 3);
}

#[tokio::test]
async fn test_child_lock_preserves_mode() {
    let sim = SimulatedController::new();
    sim.seed_channel(
        ch(1),
        &SimChannel {
            mode: ChannelMode::Off,
            ..Default::default()
        },
    );
    let mut poller = build_poller(&sim, test_settings(&[1]));
    poller.refresh_channel_now(ch(1));
    poller.step().await;

    poller.write_channel_child_lock(ch(1), true).await.unwrap();
    let config = sim.register(registers::config_addr(ch(1)));
    assert!(registers::decode_child_lock(config));
    assert_eq!(registers::decode_mode(config), ChannelMode::Off);

    poller.step().await;
    assert_eq!(poller.get_channel_child_lock(ch(1)), Some(true));

    poller.write_channel_child_lock(ch(1), false).await.unwrap();
    poller.step().await;
    assert_eq!(poller.get_channel_child_lock(ch(1)), Some(false));
    assert_eq!(poller.get_channel_mode(ch(1)), Some(ChannelMode::Off));
}

#[tokio::test]
async fn test_normalize_masked_keeps_lock_and_flags() {
    let sim = seeded_controller(&[1]);
    let addr = registers::config_addr(ch(1));
    let dirty = packed::CONFIGURATION_MODE_STANDBY_ALT
        | packed::CONFIGURATION_CHILD_LOCK_MASK
        | packed::CONFIGURATION_OVERRIDE_FLAGS_MASK;
    sim.set_register(addr, dirty);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    poller
        .normalize_channel(ch(1), NormalizeOptions::default())
        .await
        .unwrap();

    assert_eq!(functions(&sim), vec![FunctionCode::WriteMasked]);
    assert_eq!(
        sim.register(addr),
        packed::CONFIGURATION_CHILD_LOCK_MASK | packed::CONFIGURATION_OVERRIDE_FLAGS_MASK
    );
}

#[tokio::test]
async fn test_normalize_extended_clears_lock_and_flags() {
    let sim = seeded_controller(&[1]);
    let addr = registers::config_addr(ch(1));
    sim.set_register(
        addr,
        packed::CONFIGURATION_MODE_STANDBY
            | packed::CONFIGURATION_CHILD_LOCK_MASK
            | packed::CONFIGURATION_OVERRIDE_FLAGS_MASK
            | 0x0100,
    );
    let mut poller = build_poller(&sim, test_settings(&[1]));

    let options = NormalizeOptions {
        extended: true,
        ..Default::default()
    };
    poller.normalize_channel(ch(1), options).await.unwrap();

    // Bits outside the cleared fields survive
    assert_eq!(sim.register(addr), 0x0100);
}

#[tokio::test]
async fn test_normalize_aggressive_overwrites_word() {
    let sim = seeded_controller(&[1]);
    let addr = registers::config_addr(ch(1));
    sim.set_register(addr, 0x0100 | packed::CONFIGURATION_OVERRIDE_FLAGS_MASK);
    let mut poller = build_poller(&sim, test_settings(&[1]));

    let options = NormalizeOptions {
        aggressive: true,
        to_off: true,
        ..Default::default()
    };
    poller.normalize_channel(ch(1), options).await.unwrap();

    assert_eq!(functions(&sim), vec![FunctionCode::Write]);
    assert_eq!(
        sim.register(addr),
        registers::baseline_config(ChannelMode::Off, false)
    );

    poller.step().await;
    assert_eq!(poller.get_channel_mode(ch(1)), Some(ChannelMode::Off));
    assert!(poller.urgent_queue().is_empty());
}
