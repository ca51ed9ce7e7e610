//! スレッド管理機能
//!
//! `/proc/<pid>/task` によるスレッド列挙と、スレッド単位の停止待ちを提供します。

use crate::{Result, TraceeError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// スレッドID
pub type ThreadId = i32;

/// スレッドの停止状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// ptrace-stop 中
    Stopped,
    /// リモート呼び出しのために一時的に実行中
    Running,
}

/// デバッグ対象のスレッド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadState {
    tid: ThreadId,
    status: StopStatus,
    /// アタッチ停止より先に届いたシグナル（デタッチ時に再送する）
    pending_signal: Option<Signal>,
}

impl ThreadState {
    /// 停止済みスレッドを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            status: StopStatus::Stopped,
            pending_signal: None,
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn status(&self) -> StopStatus {
        self.status
    }

    pub fn is_stopped(&self) -> bool {
        self.status == StopStatus::Stopped
    }

    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending_signal
    }

    pub(crate) fn set_status(&mut self, status: StopStatus) {
        self.status = status;
    }

    pub(crate) fn set_pending_signal(&mut self, signal: Option<Signal>) {
        self.pending_signal = signal;
    }
}

/// 停止待ちの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// シグナルで停止した
    Stopped(Signal),
    /// スレッドが終了した
    Exited,
    /// タイムアウトした
    TimedOut,
}

/// プロセスの全スレッドIDを列挙する
pub fn list_threads(pid: i32) -> Result<BTreeSet<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let entries = match std::fs::read_dir(&task_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TraceeError::ProcessGone { pid });
        }
        Err(e) => return Err(e.into()),
    };

    let mut tids = BTreeSet::new();
    for entry in entries {
        // 列挙中に消えたスレッドはスキップする
        let Ok(entry) = entry else { continue };
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.insert(tid);
        }
    }
    Ok(tids)
}

/// スレッドがまだ存在するか
pub fn thread_exists(pid: i32, tid: ThreadId) -> bool {
    std::path::Path::new(&format!("/proc/{}/task/{}", pid, tid)).exists()
}

/// スレッドのトレーサーPIDを取得する（0 ならトレースされていない）
pub fn tracer_pid(pid: i32, tid: ThreadId) -> Result<i32> {
    let path = format!("/proc/{}/task/{}/status", pid, tid);
    let status = match std::fs::read_to_string(&path) {
        Ok(status) => status,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TraceeError::ProcessGone { pid });
        }
        Err(e) => return Err(e.into()),
    };
    Ok(parse_tracer_pid(&status).unwrap_or(0))
}

/// `/proc/<pid>/status` の内容から TracerPid を取り出す
fn parse_tracer_pid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// スレッドが停止（または終了）するまで待機する
///
/// `__WALL | WNOHANG` で `timeout` までポーリングします。
/// ptrace-stop 以外の状態変化（Continued など）は読み飛ばします。
///
/// ブロッキング待ちとタイマーの代わりにポーリングしていますが、結果はポーリング間隔に
/// 依存しません。カーネルは停止状態を回収されるまで保持するので、間隔が延びても
/// 停止を取りこぼすことはなく、遅れるのは検出だけです。期限は各ポーリングの後で確認するため、
/// `timeout` が 0 でも既に届いている停止は必ず返ります。
pub fn wait_for_stop(tid: ThreadId, timeout: Duration, poll_interval: Duration) -> Result<WaitOutcome> {
    let pid = Pid::from_raw(tid);
    let deadline = Instant::now() + timeout;

    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Stopped(_, signal)) => return Ok(WaitOutcome::Stopped(signal)),
            Ok(WaitStatus::PtraceEvent(_, signal, _)) => return Ok(WaitOutcome::Stopped(signal)),
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                return Ok(WaitOutcome::Exited);
            }
            Ok(status) => debug!(tid, ?status, "ignoring wait status"),
            // 既に回収済み、またはトレース対象でなくなった
            Err(Errno::ECHILD) => return Ok(WaitOutcome::Exited),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(TraceeError::os("waitpid", e)),
        }

        if Instant::now() >= deadline {
            return Ok(WaitOutcome::TimedOut);
        }
        std::thread::sleep(poll_interval);
    }
}

/// スレッドに SIGSTOP を送って停止させる（tgkill）
pub fn interrupt(pid: i32, tid: ThreadId) -> Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, libc::SIGSTOP) };
    Errno::result(ret)
        .map(drop)
        .map_err(|e| match e {
            Errno::ESRCH => TraceeError::ProcessGone { pid },
            e => TraceeError::os("tgkill", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_on_running_thread() {
        let child = crate::test_support::PausedChild::spawn();
        let started = Instant::now();
        let outcome = wait_for_stop(child.pid(), Duration::from_millis(50), Duration::from_millis(1)).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_reports_stop_regardless_of_poll_interval() {
        let child = crate::test_support::PausedChild::spawn();
        let pid = Pid::from_raw(child.pid());
        nix::sys::ptrace::attach(pid).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // 停止は回収されるまで残るので、期限切れでも粗いポーリングでも取りこぼさない
        let outcome = wait_for_stop(child.pid(), Duration::ZERO, Duration::from_secs(10)).unwrap();
        assert_eq!(outcome, WaitOutcome::Stopped(Signal::SIGSTOP));
        nix::sys::ptrace::detach(pid, None).unwrap();
    }

    #[test]
    fn test_parse_tracer_pid() {
        let status = "Name:\tsleep\nState:\tS (sleeping)\nTgid:\t42\nTracerPid:\t1234\nUid:\t0\n";
        assert_eq!(parse_tracer_pid(status), Some(1234));

        let untraced = "Name:\tsleep\nTracerPid:\t0\n";
        assert_eq!(parse_tracer_pid(untraced), Some(0));

        assert_eq!(parse_tracer_pid("Name:\tsleep\n"), None);
    }

    #[test]
    fn test_list_threads_of_self() {
        let tids = list_threads(std::process::id() as i32).unwrap();
        assert!(tids.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn test_list_threads_of_missing_process() {
        // pid_max を超える PID は存在しない
        let err = list_threads(i32::MAX).unwrap_err();
        assert!(matches!(err, TraceeError::ProcessGone { .. }));
    }

    #[test]
    fn test_new_thread_state_is_stopped() {
        let thread = ThreadState::new(7);
        assert_eq!(thread.tid(), 7);
        assert!(thread.is_stopped());
        assert_eq!(thread.pending_signal(), None);
    }
}
