//! Flash passes against the simulated E39
//!
//! Run with: cargo test -p reflash-tests --test flash_test

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use reflash_core::{
    Compressor, EventSink, FailureKind, FlashError, FlashOrchestrator, Heartbeat, ReflashError,
    ReflashSettings, TargetId,
};
use reflash_sim::{EcuMode, FaultPlan, SimulatedEcu};
use reflash_uds::UdsService;

use common::{assert_progress_complete, base_image, image, Bench};

const E39_LEN: usize = 0x30_0400;

/// Base image with partition 3 and partition 7 changed
fn changed_image(base: &[u8]) -> Vec<u8> {
    let mut changed = base.to_vec();
    changed[0x07_0000..0x07_0100].fill(0x55);
    changed[0x25_0000] ^= 0xFF;
    changed
}

/// Base image with only partition 3 changed
fn bank3_changed(base: &[u8]) -> Vec<u8> {
    let mut changed = base.to_vec();
    changed[0x06_1000..0x06_1040].fill(0xA0);
    changed
}

fn e39_bench(base: &[u8]) -> Bench {
    let target = TargetId::E39.descriptor();
    Bench::new(SimulatedEcu::new(target.clone()).with_image(base), target)
}

// =============================================================================
// Partition selection
// =============================================================================

#[tokio::test]
async fn test_only_changed_partitions_are_written() {
    let base = base_image(E39_LEN);
    let new = changed_image(&base);
    let mut bench = e39_bench(&base);

    bench.reflasher.connect().await.unwrap();
    bench.drain();

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert_eq!(outcome.written_mask, 0x88);
    assert_eq!(outcome.bytes_written, 0x14_0000);
    assert!(!outcome.already_identical);
    assert!(!outcome.deferred_protected);
    assert!(outcome.compressed);

    let record = bench.ecu.record();
    assert_eq!(record.erase_masks, vec![0x88]);
    assert!(record.compressed_chunks > 0);
    assert_eq!(record.raw_blocks, 0);
    assert!(bench.ecu.image() == new, "flash content differs from the image");

    let (progress, info) = bench.drain();
    assert_progress_complete(&progress);
    assert!(info.iter().any(|m| m.contains("Flash complete")));

    // Teardown ran
    assert_eq!(bench.ecu.mode(), EcuMode::Boot);
    assert_eq!(record.returns_to_normal, 1);
}

#[tokio::test]
async fn test_identical_image_is_not_erased() {
    let base = base_image(E39_LEN);
    let mut bench = e39_bench(&base);

    let outcome = bench.reflasher.flash(&image(&base), 0, 0).await.unwrap();

    assert!(outcome.already_identical);
    assert_eq!(outcome.written_mask, 0);
    let record = bench.ecu.record();
    assert!(record.erase_masks.is_empty());
    assert_eq!(record.returns_to_normal, 1);

    let (_, info) = bench.drain();
    assert!(info.iter().any(|m| m.contains("Already identical")));
}

#[tokio::test]
async fn test_force_mask_rewrites_identical_partition() {
    let base = base_image(E39_LEN);
    let mut bench = e39_bench(&base);

    let outcome = bench.reflasher.flash(&image(&base), 0x02, 0).await.unwrap();

    assert_eq!(outcome.written_mask, 0x02);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x02]);
    assert!(bench.ecu.image() == base);
}

#[tokio::test]
async fn test_lock_mask_wins_over_diff() {
    let base = base_image(E39_LEN);
    let new = changed_image(&base);
    let mut bench = e39_bench(&base);

    let outcome = bench.reflasher.flash(&image(&new), 0, 0x80).await.unwrap();

    assert_eq!(outcome.written_mask, 0x08);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x08]);
    let flashed = bench.ecu.image();
    assert!(flashed[0x06_0000..0x0A_0000] == new[0x06_0000..0x0A_0000]);
    assert!(flashed[0x20_0000..0x30_0000] == base[0x20_0000..0x30_0000]);
}

#[tokio::test]
async fn test_boot_partition_never_written() {
    let base = base_image(E39_LEN);
    let mut new = base.clone();
    new[0x100] ^= 0xFF;
    let mut bench = e39_bench(&base);

    let outcome = bench.reflasher.flash(&image(&new), 0x01, 0).await.unwrap();

    assert!(outcome.already_identical);
    assert!(bench.ecu.record().erase_masks.is_empty());
}

// =============================================================================
// Protected partition
// =============================================================================

#[tokio::test]
async fn test_protected_partition_needs_second_pass() {
    let base = base_image(E39_LEN);
    let mut new = bank3_changed(&base);
    new[0x30_0010..0x30_0020].fill(0x11);
    let mut bench = e39_bench(&base);

    let first = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();
    assert_eq!(first.written_mask, 0x08);
    assert!(first.deferred_protected);
    assert!(bench.ecu.image()[0x30_0000..] == base[0x30_0000..]);

    let (_, info) = bench.drain();
    assert!(info.iter().any(|m| m.contains("flash the same image again")));

    let second = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();
    assert_eq!(second.written_mask, 0x100);
    assert!(!second.deferred_protected);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x08, 0x100]);
    assert!(bench.ecu.image() == new);
}

#[tokio::test]
async fn test_guard_pattern_keeps_protected_partition() {
    let base = base_image(E39_LEN);
    let mut new = base.clone();
    new[0x30_0100..0x30_0104].copy_from_slice(&[0xA5, 0x5A, 0xC3, 0x3C]);
    let mut bench = e39_bench(&base);

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert!(outcome.protected_guarded);
    assert!(outcome.already_identical);
    assert!(bench.ecu.record().erase_masks.is_empty());
    assert!(bench.ecu.image() == base);
}

// =============================================================================
// Fallbacks and retries
// =============================================================================

#[tokio::test]
async fn test_raw_transfer_when_compression_disabled() {
    let base = base_image(E39_LEN);
    let new = bank3_changed(&base);
    let target = TargetId::E39.descriptor();
    let settings = ReflashSettings::builder()
        .teardown(10, 5)
        .compression(false)
        .build();
    let mut bench = Bench::with_settings(
        SimulatedEcu::new(target.clone()).with_image(&base),
        target,
        settings,
    );

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert!(!outcome.compressed);
    let record = bench.ecu.record();
    assert_eq!(record.compressed_chunks, 0);
    // two 128 KiB chunks of 547 blocks each
    assert_eq!(record.raw_blocks, 1094);
    assert!(bench.ecu.image() == new);
}

#[tokio::test]
async fn test_compressor_failure_falls_back_to_raw() {
    let base = base_image(E39_LEN);
    let new = bank3_changed(&base);
    let target = TargetId::E39.descriptor();
    let settings = ReflashSettings::default();
    let ecu = Arc::new(
        SimulatedEcu::new(target.clone())
            .with_image(&base)
            .with_loader_running(),
    );
    let uds = UdsService::new(ecu.clone());
    let mut heartbeat = Heartbeat::new(uds.clone(), settings.heartbeat_interval());
    let events = EventSink::disabled();

    let outcome = FlashOrchestrator::new(&uds, &target, &settings, &mut heartbeat, &events)
        .with_compressor(Compressor::new().with_output_limit(16))
        .run(&image(&new), 0, 0)
        .await
        .unwrap();

    assert_eq!(outcome.written_mask, 0x08);
    assert!(!outcome.compressed);
    assert_eq!(ecu.record().compressed_chunks, 0);
    assert!(ecu.image() == new);
}

#[tokio::test]
async fn test_dropped_frame_restarts_transfer() {
    let base = base_image(E39_LEN);
    let new = bank3_changed(&base);
    let mut bench = e39_bench(&base);
    bench.ecu.set_faults(FaultPlan {
        dropped_frames: 1,
        ..Default::default()
    });

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert!(outcome.compressed);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x08]);
    assert!(bench.ecu.image() == new);
}

#[tokio::test]
async fn test_verification_failure_rewrites_partition_once() {
    let base = base_image(E39_LEN);
    let new = bank3_changed(&base);
    let mut bench = e39_bench(&base);
    bench.ecu.set_faults(FaultPlan {
        corrupt_writes: 1,
        ..Default::default()
    });

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert_eq!(outcome.written_mask, 0x08);
    assert!(!outcome.compressed);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x08, 0x08]);
    assert!(bench.ecu.record().raw_blocks > 0);
    assert!(bench.ecu.image() == new);

    let (_, info) = bench.drain();
    assert!(info.iter().any(|m| m.contains("rewriting uncompressed")));
}

#[tokio::test]
async fn test_second_verification_failure_is_fatal() {
    let base = base_image(E39_LEN);
    let new = bank3_changed(&base);
    let mut bench = e39_bench(&base);
    bench.ecu.set_faults(FaultPlan {
        corrupt_writes: u32::MAX,
        ..Default::default()
    });

    let err = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap_err();

    assert!(matches!(
        err,
        ReflashError::Flash(FlashError::VerificationFailed { index: 3 })
    ));
    assert_eq!(err.kind(), FailureKind::FatalData);
    let record = bench.ecu.record();
    assert_eq!(record.erase_masks, vec![0x08, 0x08]);
    assert_eq!(record.returns_to_normal, 1);
}

// =============================================================================
// Fatal errors
// =============================================================================

#[tokio::test]
async fn test_programming_failure_stops_without_retry() {
    let base = base_image(E39_LEN);
    let new = bank3_changed(&base);
    let mut bench = e39_bench(&base);
    bench.ecu.set_faults(FaultPlan {
        reject_compressed: true,
        ..Default::default()
    });

    let err = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap_err();

    assert!(matches!(
        err,
        ReflashError::Flash(FlashError::ProgrammingFailure { address: 0x06_0000 })
    ));
    assert_eq!(err.kind(), FailureKind::FatalSession);
    assert_eq!(bench.ecu.record().returns_to_normal, 1);
    assert_eq!(bench.ecu.mode(), EcuMode::Boot);
}

#[tokio::test]
async fn test_erase_rejection_leaves_flash_untouched() {
    let base = base_image(E39_LEN);
    let new = changed_image(&base);
    let mut bench = e39_bench(&base);
    bench.ecu.set_faults(FaultPlan {
        erase_status: Some(0x10),
        ..Default::default()
    });

    let err = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap_err();

    assert!(matches!(
        err,
        ReflashError::Flash(FlashError::EraseRejected {
            mask: 0x88,
            status: Some(0x10)
        })
    ));
    assert!(bench.ecu.image() == base);
    assert_eq!(bench.ecu.record().returns_to_normal, 1);
}

#[tokio::test]
async fn test_hardware_mismatch_aborts_before_erase() {
    let base = base_image(E39_LEN);
    let target = TargetId::E39.descriptor();
    let mut bench = Bench::new(
        SimulatedEcu::new(target.clone())
            .with_image(&base)
            .with_hardware_id(0x00BC_6200),
        target,
    );

    let err = bench
        .reflasher
        .flash(&image(&changed_image(&base)), 0, 0)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReflashError::Flash(FlashError::HardwareMismatch {
            expected: 0x00BC_6100,
            found: 0x00BC_6200
        })
    ));
    assert_eq!(err.kind(), FailureKind::FatalData);
    let record = bench.ecu.record();
    assert!(record.erase_masks.is_empty());
    assert_eq!(record.returns_to_normal, 1);
}

#[tokio::test]
async fn test_hardware_id_low_byte_is_masked() {
    let base = base_image(E39_LEN);
    let target = TargetId::E39.descriptor();
    let mut bench = Bench::new(
        SimulatedEcu::new(target.clone())
            .with_image(&base)
            .with_hardware_id(0x00BC_61FF),
        target,
    );

    let outcome = bench.reflasher.flash(&image(&base), 0, 0).await.unwrap();
    assert!(outcome.already_identical);
}

#[tokio::test]
async fn test_wrong_image_size_rejected() {
    let base = base_image(E39_LEN);
    let mut bench = e39_bench(&base);

    let err = bench
        .reflasher
        .flash(&image(&base[..0x30_0000]), 0, 0)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReflashError::Flash(FlashError::ImageSize {
            expected: 0x30_0400,
            actual: 0x30_0000
        })
    ));
}
