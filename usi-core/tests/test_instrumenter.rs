//! Instrumenter の統合テスト
//!
//! fork した子プロセスは親と同じアドレス空間配置を持つので、
//! このテストバイナリ内の関数アドレスをそのまま子プロセスで呼び出せる。

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pause, ForkResult, Pid};
use usi_core::{InstrumentError, Instrumenter, Protection, SessionConfig, TraceeError};
use usi_target::DetachOutcome;

const PAGE: u64 = 4096;

extern "C" fn triple(value: u64) -> u64 {
    value * 3
}

extern "C" fn child_pid() -> u64 {
    std::process::id() as u64
}

/// シグナルを待ち続ける子プロセス
struct Child {
    pid: Pid,
}

impl Child {
    fn spawn() -> Self {
        match unsafe { fork() }.expect("Failed to fork") {
            ForkResult::Child => loop {
                pause();
            },
            ForkResult::Parent { child } => Self { pid: child },
        }
    }

    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}

#[test]
fn test_allocate_write_read_free_then_clean_detach() {
    let child = Child::spawn();
    let mut instrumenter = Instrumenter::attach(child.pid(), SessionConfig::default()).unwrap();

    let region = instrumenter.allocate(PAGE, Protection::READ_WRITE).unwrap();
    assert_eq!(instrumenter.live_regions().count(), 1);

    let data: Vec<u8> = (0..=255u8).cycle().take(PAGE as usize).collect();
    instrumenter.write(region.base, &data).unwrap();
    assert_eq!(instrumenter.read(region.base, data.len()).unwrap(), data);

    instrumenter.free(region.base).unwrap();
    assert_eq!(instrumenter.live_regions().count(), 0);

    // 解放済みの領域は追跡されていない
    match instrumenter.free(region.base) {
        Err(InstrumentError::UnknownRegion(base)) => assert_eq!(base, region.base),
        other => panic!("expected UnknownRegion, got {:?}", other),
    }

    let report = instrumenter.detach();
    assert_eq!(report.outcome, DetachOutcome::Detached { resumed: 1 });
    assert!(report.leaked.is_empty());
}

#[test]
fn test_detach_reports_leaked_regions() {
    let child = Child::spawn();
    let mut instrumenter = Instrumenter::attach(child.pid(), SessionConfig::default()).unwrap();

    let kept = instrumenter.allocate(PAGE, Protection::READ_WRITE).unwrap();
    let freed = instrumenter.allocate(2 * PAGE, Protection::READ_WRITE).unwrap();
    instrumenter.free(freed.base).unwrap();

    let report = instrumenter.detach();
    assert!(matches!(report.outcome, DetachOutcome::Detached { .. }));
    assert_eq!(report.leaked, vec![kept]);
}

#[test]
fn test_execute_named_functions() {
    let child = Child::spawn();
    let mut instrumenter = Instrumenter::attach(child.pid(), SessionConfig::default()).unwrap();

    instrumenter.functions_mut().register("triple", triple as usize as u64);
    instrumenter.functions_mut().register("child_pid", child_pid as usize as u64);

    assert_eq!(instrumenter.execute_named("triple", &[14]).unwrap(), 42);
    assert_eq!(instrumenter.execute_named("child_pid", &[]).unwrap(), child.pid() as u64);

    let tid = instrumenter.session().main_thread().unwrap();
    assert_eq!(instrumenter.execute(tid, triple as usize as u64, &[5]).unwrap(), 15);

    match instrumenter.execute_named("missing", &[]) {
        Err(InstrumentError::UnknownFunction(name)) => assert_eq!(name, "missing"),
        other => panic!("expected UnknownFunction, got {:?}", other),
    }

    // 呼び出し前後でセッションは使えるまま
    assert!(instrumenter.session().ensure_usable().is_ok());
    instrumenter.detach();
}

#[test]
fn test_calling_the_sentinel_is_rejected() {
    let child = Child::spawn();
    let mut instrumenter = Instrumenter::attach(child.pid(), SessionConfig::default()).unwrap();

    let err = instrumenter.execute_on_main(usi_target::RETURN_SENTINEL, &[]).unwrap_err();
    assert!(matches!(err, InstrumentError::Tracee(TraceeError::InvalidArgument(_))));
    assert!(!err.is_fatal());
}
