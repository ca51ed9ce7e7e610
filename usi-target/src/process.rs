//! プロセス制御機能
//!
//! 実行中のプロセスの全スレッドにアタッチし、一つの単位として停止・再開します。
//! [`Session`] はトレーサーであることを表すハンドルで、デタッチ（またはドロップ）で解放されます。

use crate::config::SessionConfig;
use crate::thread::{self, StopStatus, ThreadId, ThreadState, WaitOutcome};
use crate::{Result, TraceeError};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info, warn};

/// アタッチを取り消すときに停止を待つ最短時間
const ROLLBACK_STOP_GRACE: Duration = Duration::from_secs(1);

/// セッションのアタッチ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// 全スレッドが停止している
    Stopped,
    /// デタッチ済み
    Detached,
    /// レジスタの書き戻しに失敗し、以降の操作は安全でない
    Poisoned,
}

/// デタッチの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// デタッチして実行を再開した
    Detached { resumed: usize },
    /// 既にデタッチ済みだった
    AlreadyDetached,
    /// 使用不能なセッションだったため、停止させたままデタッチした
    LeftStopped { threads: usize },
}

/// トレース対象プロセスのセッション
///
/// ptrace はアタッチしたOSスレッドにトレーサーを結び付けるため、
/// セッションは作成したスレッドからのみ操作できます（`Send` ではありません）。
pub struct Session {
    pid: Pid,
    threads: BTreeMap<ThreadId, ThreadState>,
    state: AttachState,
    config: SessionConfig,
    _not_send: PhantomData<*const ()>,
}

impl Session {
    /// プロセスの全スレッドにアタッチして停止させる
    ///
    /// スレッドの列挙とアタッチを、新しいスレッドも消えたスレッドも無いラウンドが
    /// 得られるまで繰り返します。`attach_retry_budget` ラウンドで安定しなければ
    /// `AttachTimeout` を返します。失敗時は既にアタッチしたスレッドをすべて再開します。
    pub fn attach_and_stop(pid: i32, config: SessionConfig) -> Result<Self> {
        let tracer = thread::tracer_pid(pid, pid)?;
        if tracer != 0 {
            return Err(TraceeError::AlreadyTraced { pid, tracer });
        }

        info!(pid, "attaching to process");
        let budget = config.attach_retry_budget.max(1);
        let mut session = Self {
            pid: Pid::from_raw(pid),
            threads: BTreeMap::new(),
            state: AttachState::Stopped,
            config,
            _not_send: PhantomData,
        };

        // エラーで抜けた場合は Drop がデタッチする
        for round in 0..budget {
            let listed = thread::list_threads(pid)?;
            if listed.is_empty() {
                return Err(TraceeError::ProcessGone { pid });
            }

            let vanished: Vec<ThreadId> = session
                .threads
                .keys()
                .filter(|tid| !listed.contains(tid))
                .copied()
                .collect();
            for tid in &vanished {
                warn!(pid, tid, "thread exited during attach");
                session.threads.remove(tid);
            }

            let mut changed = !vanished.is_empty();
            for tid in listed {
                if session.threads.contains_key(&tid) {
                    continue;
                }
                changed = true;
                if let Some(state) = session.attach_thread(tid, round + 1)? {
                    session.threads.insert(tid, state);
                }
            }

            if !changed {
                if !session.threads.contains_key(&pid) && !thread::thread_exists(pid, pid) {
                    return Err(TraceeError::ProcessGone { pid });
                }
                info!(pid, rounds = round + 1, threads = session.threads.len(), "process stopped");
                return Ok(session);
            }
            debug!(pid, round, threads = session.threads.len(), "thread set changed, listing again");
        }

        Err(TraceeError::AttachTimeout { pid, rounds: budget })
    }

    /// スレッド1つにアタッチし、アタッチ停止を待つ
    ///
    /// アタッチ前後にスレッドが消えた場合は `None` を返します。
    /// `stop_timeout` 内に停止しなければ、そのスレッドをデタッチしてから
    /// `AttachTimeout` を返します。
    fn attach_thread(&self, tid: ThreadId, rounds: usize) -> Result<Option<ThreadState>> {
        let pid = self.pid();
        match ptrace::attach(Pid::from_raw(tid)) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!(pid, tid, "thread vanished before attach");
                return Ok(None);
            }
            Err(Errno::EPERM) => {
                let tracer = thread::tracer_pid(pid, tid).unwrap_or(0);
                return Err(if tracer != 0 {
                    TraceeError::AlreadyTraced { pid, tracer }
                } else {
                    TraceeError::PermissionDenied { pid, tid }
                });
            }
            Err(e) => return Err(TraceeError::os("PTRACE_ATTACH", e)),
        }

        let mut state = ThreadState::new(tid);
        loop {
            let outcome = match thread::wait_for_stop(tid, self.config.stop_timeout, self.config.poll_interval) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release_thread(&state);
                    return Err(e);
                }
            };
            match outcome {
                WaitOutcome::Stopped(Signal::SIGSTOP) => {
                    debug!(pid, tid, "thread attached");
                    return Ok(Some(state));
                }
                WaitOutcome::Stopped(signal) => {
                    // アタッチ停止より先に届いたシグナルは保留し、デタッチ時に再送する
                    if let Some(previous) = state.pending_signal() {
                        warn!(pid, tid, ?previous, ?signal, "dropping earlier pending signal");
                    }
                    debug!(pid, tid, ?signal, "signal arrived before attach stop");
                    state.set_pending_signal(Some(signal));
                    match ptrace::cont(Pid::from_raw(tid), None) {
                        Ok(()) => {}
                        Err(Errno::ESRCH) => return Ok(None),
                        Err(e) => {
                            // まだ停止中なのでそのままデタッチできる
                            let _ = ptrace::detach(Pid::from_raw(tid), state.pending_signal());
                            return Err(TraceeError::os("PTRACE_CONT", e));
                        }
                    }
                }
                WaitOutcome::Exited => {
                    debug!(pid, tid, "thread exited while attaching");
                    return Ok(None);
                }
                WaitOutcome::TimedOut => {
                    warn!(pid, tid, timeout_ms = self.config.stop_timeout.as_millis(), "attach stop timed out");
                    self.release_thread(&state);
                    return Err(TraceeError::AttachTimeout { pid, rounds });
                }
            }
        }
    }

    /// 停止を確認できなかったスレッドのアタッチを取り消す
    ///
    /// アタッチの SIGSTOP は既に送られているので、停止を待ってからデタッチします。
    /// PTRACE_DETACH は停止中のスレッドにしか効かないため、それでも止まらなければ
    /// 警告だけ出します。
    fn release_thread(&self, state: &ThreadState) {
        let pid = self.pid();
        let tid = state.tid();
        let grace = self.config.stop_timeout.max(ROLLBACK_STOP_GRACE);
        let mut pending = state.pending_signal();

        loop {
            match thread::wait_for_stop(tid, grace, self.config.poll_interval) {
                Ok(WaitOutcome::Stopped(Signal::SIGSTOP)) => break,
                Ok(WaitOutcome::Stopped(signal)) => {
                    pending = Some(signal);
                    if ptrace::cont(Pid::from_raw(tid), None).is_err() {
                        return;
                    }
                }
                Ok(WaitOutcome::Exited) => return,
                Ok(WaitOutcome::TimedOut) | Err(_) => break,
            }
        }

        match ptrace::detach(Pid::from_raw(tid), pending) {
            Ok(()) => debug!(pid, tid, "released thread after failed attach"),
            Err(Errno::ESRCH) => warn!(pid, tid, "could not release thread that never stopped"),
            Err(e) => warn!(pid, tid, error = %e, "failed to release thread"),
        }
    }

    /// 全スレッドをデタッチして実行を再開する
    ///
    /// 既に終了したスレッドは無視します。2回目以降の呼び出しは何もせず
    /// `AlreadyDetached` を返します。使用不能になったセッションでは、
    /// 対象を停止させたままデタッチします。
    pub fn detach_and_continue(&mut self) -> DetachOutcome {
        let pid = self.pid();
        match self.state {
            AttachState::Detached => {
                debug!(pid, "session already detached");
                DetachOutcome::AlreadyDetached
            }
            AttachState::Poisoned => {
                let threads = self.detach_all(|_| Some(Signal::SIGSTOP));
                warn!(pid, threads, "detached poisoned session, process left stopped");
                DetachOutcome::LeftStopped { threads }
            }
            AttachState::Stopped => {
                let resumed = self.detach_all(ThreadState::pending_signal);
                info!(pid, resumed, "detached from process");
                DetachOutcome::Detached { resumed }
            }
        }
    }

    fn detach_all(&mut self, signal_for: impl Fn(&ThreadState) -> Option<Signal>) -> usize {
        let pid = self.pid();
        let mut detached = 0;
        for (tid, state) in std::mem::take(&mut self.threads) {
            if state.status() == StopStatus::Running {
                warn!(pid, tid, "detaching thread that is not stopped");
            }
            match ptrace::detach(Pid::from_raw(tid), signal_for(&state)) {
                Ok(()) => detached += 1,
                Err(Errno::ESRCH) => debug!(pid, tid, "thread already gone at detach"),
                Err(e) => warn!(pid, tid, error = %e, "failed to detach thread"),
            }
        }
        self.state = AttachState::Detached;
        detached
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.state != AttachState::Detached
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == AttachState::Poisoned
    }

    /// 停止させているスレッドIDの一覧
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.keys().copied().collect()
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&ThreadState> {
        self.threads.get(&tid)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadState> {
        self.threads.values()
    }

    /// リモート呼び出しに使うスレッド（メインスレッドが残っていればそれ）
    pub fn main_thread(&self) -> Option<ThreadId> {
        if self.threads.contains_key(&self.pid()) {
            Some(self.pid())
        } else {
            self.threads.keys().next().copied()
        }
    }

    /// セッションがまだ操作可能か確認する
    pub fn ensure_usable(&self) -> Result<()> {
        match self.state {
            AttachState::Stopped => Ok(()),
            AttachState::Detached => Err(TraceeError::NotAttached { pid: self.pid() }),
            AttachState::Poisoned => Err(TraceeError::SessionPoisoned { pid: self.pid() }),
        }
    }

    /// 指定スレッドが停止していることを確認する
    pub(crate) fn require_stopped(&self, tid: ThreadId) -> Result<&ThreadState> {
        self.ensure_usable()?;
        match self.threads.get(&tid) {
            Some(state) if state.is_stopped() => Ok(state),
            _ => Err(TraceeError::NotStopped { tid }),
        }
    }

    /// メモリやレジスタを書き換える前に、全スレッドが停止していることを確認する
    pub(crate) fn require_all_stopped(&self) -> Result<()> {
        self.ensure_usable()?;
        match self.threads.values().find(|t| !t.is_stopped()) {
            Some(running) => Err(TraceeError::NotStopped { tid: running.tid() }),
            None => Ok(()),
        }
    }

    pub(crate) fn set_thread_status(&mut self, tid: ThreadId, status: StopStatus) {
        if let Some(state) = self.threads.get_mut(&tid) {
            state.set_status(status);
        }
    }

    /// ESRCH を受けたスレッドを整理する
    ///
    /// プロセス全体が消えていればセッションを無効化します。
    pub(crate) fn forget_thread(&mut self, tid: ThreadId) -> TraceeError {
        let pid = self.pid();
        self.threads.remove(&tid);
        if !thread::thread_exists(pid, pid) || self.threads.is_empty() {
            warn!(pid, "process exited, invalidating session");
            self.threads.clear();
            self.state = AttachState::Detached;
        } else {
            warn!(pid, tid, "thread exited");
        }
        TraceeError::ProcessGone { pid }
    }

    pub(crate) fn poison(&mut self) {
        warn!(pid = self.pid(), "session poisoned");
        self.state = AttachState::Poisoned;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid())
            .field("threads", &self.threads.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_attached() {
            self.detach_and_continue();
        }
    }
}
