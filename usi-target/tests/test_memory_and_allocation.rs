//! メモリ読み書きと対象プロセス内メモリ確保のテスト

mod common;

use common::Fixture;
use usi_target::{DetachOutcome, Memory, Protection, Session, SessionConfig, TraceeAllocator, TraceeError};

const PAGE: u64 = 4096;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_end_to_end_allocate_write_read_free() {
    let fixture = Fixture::idle();
    let mut session = Session::attach_and_stop(fixture.pid(), SessionConfig::default()).unwrap();
    assert_eq!(session.thread_ids().len(), 3);

    let allocator = TraceeAllocator::new(&session).unwrap();
    let region = allocator.allocate(&mut session, PAGE, Protection::READ_WRITE).unwrap();
    assert_eq!(region.base % PAGE, 0, "allocation not page aligned: 0x{:x}", region.base);
    assert_eq!(region.len, PAGE);

    let data = pattern(PAGE as usize, 7);
    Memory::new(&session).write(region.base, &data).unwrap();
    assert_eq!(Memory::new(&session).read(region.base, data.len()).unwrap(), data);

    allocator.free(&mut session, &region).unwrap();
    assert!(!Memory::new(&session).is_mapped(region.base).unwrap());

    assert_eq!(session.detach_and_continue(), DetachOutcome::Detached { resumed: 3 });
    assert!(fixture.finish().success());
}

#[test]
fn test_unaligned_write_keeps_neighbouring_bytes() {
    let fixture = Fixture::idle();
    let mut session = Session::attach_and_stop(fixture.pid(), SessionConfig::default()).unwrap();
    let allocator = TraceeAllocator::new(&session).unwrap();
    let region = allocator.allocate(&mut session, PAGE, Protection::READ_WRITE).unwrap();

    let memory = Memory::new(&session);
    memory.write(region.base, &vec![0xEE; 64]).unwrap();

    // 先頭と末尾がワード境界に揃っていない書き込み
    let data = pattern(21, 3);
    memory.write(region.base + 3, &data).unwrap();

    let readback = memory.read(region.base, 64).unwrap();
    assert_eq!(&readback[..3], &[0xEE; 3]);
    assert_eq!(&readback[3..24], data.as_slice());
    assert!(readback[24..].iter().all(|&b| b == 0xEE));

    // 1バイトの書き込み
    memory.write_u8(region.base + 40, 0x11).unwrap();
    assert_eq!(memory.read_u8(region.base + 40).unwrap(), 0x11);
    assert_eq!(memory.read_u8(region.base + 41).unwrap(), 0xEE);

    // 幅の違う値は read_typed/write_typed で扱う
    memory.write_typed(region.base + 48, &0x0102_0304_0506_0708u64).unwrap();
    assert_eq!(memory.read_typed::<u64>(region.base + 48).unwrap(), 0x0102_0304_0506_0708);
    assert_eq!(memory.read_typed::<u16>(region.base + 48).unwrap(), 0x0708);
    assert_eq!(memory.read_u32(region.base + 52).unwrap(), 0x0102_0304);

    allocator.free(&mut session, &region).unwrap();
}

#[test]
fn test_full_region_write_is_never_partial() {
    let fixture = Fixture::idle();
    let mut session = Session::attach_and_stop(fixture.pid(), SessionConfig::default()).unwrap();
    let allocator = TraceeAllocator::new(&session).unwrap();

    for pages in [1u64, 3] {
        let region = allocator.allocate(&mut session, pages * PAGE, Protection::READ_WRITE).unwrap();
        let data = pattern((pages * PAGE) as usize, pages as u8);
        Memory::new(&session).write(region.base, &data).unwrap();
        assert_eq!(Memory::new(&session).read(region.base, data.len()).unwrap(), data);
        allocator.free(&mut session, &region).unwrap();
    }
}

#[test]
fn test_transfers_crossing_into_unmapped_memory_are_partial() {
    let fixture = Fixture::idle();
    let mut session = Session::attach_and_stop(fixture.pid(), SessionConfig::default()).unwrap();
    let allocator = TraceeAllocator::new(&session).unwrap();

    // 2ページ確保して2ページ目を解放し、直後が未マップであることを保証する
    let region = allocator.allocate(&mut session, 2 * PAGE, Protection::READ_WRITE).unwrap();
    allocator.free_raw(&mut session, region.base + PAGE, PAGE).unwrap();

    let memory = Memory::new(&session);
    memory.write(region.base + PAGE - 96, &[0x5A; 96]).unwrap();

    match memory.read(region.base + PAGE - 96, 200) {
        Err(TraceeError::PartialRead { bytes, .. }) => assert_eq!(bytes, vec![0x5A; 96]),
        other => panic!("expected PartialRead, got {:?}", other),
    }

    match memory.write(region.base + PAGE - 96, &[0xA5; 200]) {
        Err(TraceeError::PartialWrite { written, .. }) => assert_eq!(written, 96),
        other => panic!("expected PartialWrite, got {:?}", other),
    }
    assert_eq!(memory.read(region.base + PAGE - 96, 96).unwrap(), vec![0xA5; 96]);

    // マッピング末尾にかかる端数ワードも書ける
    memory.write(region.base + PAGE - 3, &[1, 2, 3]).unwrap();
    assert_eq!(memory.read(region.base + PAGE - 8, 8).unwrap(), vec![0xA5, 0xA5, 0xA5, 0xA5, 0xA5, 1, 2, 3]);

    // 先頭から読めない場合は部分読み取りではない
    let err = memory.read(region.base + PAGE, 16).unwrap_err();
    assert!(matches!(err, TraceeError::MemoryAccess { .. }), "got {:?}", err);

    allocator.free_raw(&mut session, region.base, PAGE).unwrap();
}

#[test]
fn test_failed_allocation_reports_errno() {
    let fixture = Fixture::idle();
    let mut session = Session::attach_and_stop(fixture.pid(), SessionConfig::default()).unwrap();
    let allocator = TraceeAllocator::new(&session).unwrap();

    // 仮想アドレス空間に収まらないサイズ
    let err = allocator
        .allocate(&mut session, 1 << 62, Protection::READ_WRITE)
        .unwrap_err();
    assert!(matches!(err, TraceeError::AllocationFailed { .. }), "got {:?}", err);
    assert!(!err.is_fatal());

    // 境界に揃っていないアドレスの解放は EINVAL
    match allocator.free_raw(&mut session, 0x1001, PAGE) {
        Err(TraceeError::AllocationFailed { errno }) => assert_eq!(errno, nix::errno::Errno::EINVAL),
        other => panic!("expected AllocationFailed, got {:?}", other),
    }

    assert!(matches!(
        allocator.allocate(&mut session, 0, Protection::READ_WRITE),
        Err(TraceeError::InvalidArgument(_))
    ));

    // 失敗後もセッションは使える
    let region = allocator.allocate(&mut session, PAGE, Protection::READ_WRITE).unwrap();
    allocator.free(&mut session, &region).unwrap();
    session.detach_and_continue();
    assert!(fixture.finish().success());
}

#[test]
fn test_first_executable_region_is_readable() {
    let fixture = Fixture::idle();
    let session = Session::attach_and_stop(fixture.pid(), SessionConfig::default()).unwrap();
    let memory = Memory::new(&session);

    let (start, end) = memory.first_executable_region().unwrap();
    assert!(end > start);
    assert_eq!(memory.read(start, 64).unwrap().len(), 64);
    assert!(memory.is_mapped(fixture.symbol("answer")).unwrap());

    // 関数アドレスは実行ファイル自身のマッピング内にある
    let exe = std::fs::read_link(format!("/proc/{}/exe", fixture.pid())).unwrap();
    let text = memory.find_mapping_for(&exe).unwrap().expect("executable mapping");
    assert!(memory
        .mappings()
        .unwrap()
        .iter()
        .filter(|m| m.path.as_deref() == Some(exe.as_path()) && m.protection.exec)
        .any(|m| m.contains(fixture.symbol("answer"))));
    assert_eq!(text.path.as_deref(), Some(exe.as_path()));
    assert!(memory.find_mapping_for("/nonexistent/library.so").unwrap().is_none());
}
