//! Flash and RAM dumps, dump files and read-back verification
//!
//! Run with: cargo test -p reflash-tests --test dump_test

mod common;

use pretty_assertions::assert_eq;
use reflash_core::{DumpError, FailureKind, ReflashError, TargetId};
use reflash_sim::{FaultPlan, SimulatedEcu, RAM_BASE};
use sha2::{Digest, Sha256};

use common::{assert_progress_complete, base_image, image, Bench};

fn e39_bench(base: &[u8]) -> Bench {
    let target = TargetId::E39.descriptor();
    Bench::new(SimulatedEcu::new(target.clone()).with_image(base), target)
}

#[tokio::test]
async fn test_read_flash_across_partitions() {
    let base = base_image(0x30_0400);
    let mut bench = e39_bench(&base);
    bench.reflasher.connect().await.unwrap();
    bench.drain();

    let data = bench
        .reflasher
        .read_flash(0x01_FF00, 0x02_0F00)
        .await
        .unwrap();

    assert_eq!(data.len(), 0x1000);
    assert!(data == base[0x01_FF00..0x02_0F00]);

    let (progress, _) = bench.drain();
    assert_progress_complete(&progress);
}

#[tokio::test]
async fn test_read_flash_connects_on_demand() {
    let base = base_image(0x30_0400);
    let mut bench = e39_bench(&base);

    let data = bench.reflasher.read_flash(0x40_0000, 0x40_0400).await.unwrap();

    assert!(data == base[0x30_0000..0x30_0400]);
    assert!(bench.reflasher.state().loader_active());
    assert!(bench.reflasher.disconnect().await);
}

#[tokio::test]
async fn test_read_flash_shrinks_blocks_on_error() {
    let base = base_image(0x30_0400);
    let mut bench = e39_bench(&base);
    bench.ecu.set_faults(FaultPlan {
        max_read_len: Some(16),
        ..Default::default()
    });

    let data = bench.reflasher.read_flash(0x02_0000, 0x02_0200).await.unwrap();

    assert!(data == base[0x02_0000..0x02_0200]);
    // every block fell back to 16 bytes
    assert_eq!(bench.ecu.record().reads, 0x200 / 16);
}

#[tokio::test]
async fn test_erased_flash_reads_as_ff() {
    let target = TargetId::E39.descriptor();
    let mut bench = Bench::new(SimulatedEcu::new(target.clone()), target);

    let data = bench.reflasher.read_flash(0x10_0000, 0x10_0100).await.unwrap();
    assert_eq!(data, vec![0xFF; 0x100]);
}

#[tokio::test]
async fn test_read_failure_is_reported_not_truncated() {
    let base = base_image(0x30_0400);
    let mut bench = e39_bench(&base);
    bench.reflasher.connect().await.unwrap();
    bench.ecu.set_faults(FaultPlan {
        failing_reads: 100,
        ..Default::default()
    });

    let err = bench
        .reflasher
        .read_flash(0x02_0000, 0x02_0400)
        .await
        .unwrap_err();

    match &err {
        ReflashError::Dump(DumpError::BlockFailed {
            address, attempts, ..
        }) => {
            assert_eq!(*address, 0x02_0000);
            assert_eq!(*attempts, 5);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), FailureKind::Transient);
}

#[tokio::test]
async fn test_read_ram_fixed_blocks() {
    let target = TargetId::E39.descriptor();
    let mut bench = Bench::new(SimulatedEcu::new(target.clone()), target);
    bench.reflasher.connect().await.unwrap();

    let data = bench
        .reflasher
        .read_ram(RAM_BASE, RAM_BASE + 0x40)
        .await
        .unwrap();

    let expected = bench.ecu.read_physical(RAM_BASE, 0x40).unwrap();
    assert_eq!(data, expected);
    assert_eq!(bench.ecu.record().reads, 4);
}

#[tokio::test]
async fn test_dump_file_with_hash_sidecar() {
    let base = base_image(0x30_0400);
    let mut bench = e39_bench(&base);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bank1.bin");

    let sidecar = bench
        .reflasher
        .dump_flash_to(&path, 0x02_0000, 0x04_0000)
        .await
        .unwrap();

    let written = std::fs::read(&path).unwrap();
    assert!(written == base[0x02_0000..0x04_0000]);

    assert_eq!(sidecar, dir.path().join("bank1.bin.sha256"));
    let text = std::fs::read_to_string(&sidecar).unwrap();
    let expected = hex::encode(Sha256::digest(&written));
    assert!(text.starts_with(&expected), "sidecar was {text:?}");
    assert!(text.trim_end().ends_with("bank1.bin"));
}

#[tokio::test]
async fn test_invalid_range_rejected() {
    let target = TargetId::E39.descriptor();
    let mut bench = Bench::new(SimulatedEcu::new(target.clone()), target);

    let err = bench
        .reflasher
        .read_flash(0x02_0000, 0x02_0000)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReflashError::Dump(DumpError::InvalidRange { .. })
    ));
}

// =============================================================================
// Read-back verification (E78)
// =============================================================================

#[tokio::test]
async fn test_e78_flash_verified_by_read_back() {
    let base = base_image(0x20_0000);
    let mut new = base.clone();
    new[0x03_0000..0x03_0010].fill(0x99);
    let target = TargetId::E78.descriptor();
    let mut bench = Bench::new(SimulatedEcu::new(target.clone()).with_image(&base), target);

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert_eq!(outcome.written_mask, 0x04);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x04]);
    assert!(bench.ecu.image() == new);
}

#[tokio::test]
async fn test_e78_read_back_catches_corruption() {
    let base = base_image(0x20_0000);
    let mut new = base.clone();
    new[0x01_0000] ^= 0x80;
    let target = TargetId::E78.descriptor();
    let mut bench = Bench::new(
        SimulatedEcu::new(target.clone())
            .with_image(&base)
            .with_faults(FaultPlan {
                corrupt_writes: 1,
                ..Default::default()
            }),
        target,
    );

    let outcome = bench.reflasher.flash(&image(&new), 0, 0).await.unwrap();

    assert_eq!(outcome.written_mask, 0x02);
    assert_eq!(bench.ecu.record().erase_masks, vec![0x02, 0x02]);
    assert!(bench.ecu.image() == new);
}
