//! エラー型
//!
//! トレース対象の制御で発生するエラーを `thiserror` で定義します。
//! 各バリアントは致命度によって扱いが異なります（[`TraceeError::is_fatal`] を参照）。

use crate::thread::ThreadId;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// トレース対象制御のエラー
#[derive(Error, Debug)]
pub enum TraceeError {
    /// OSがアタッチを拒否した（ptrace_scope、権限不足など）
    #[error("Permission denied while attaching to thread {tid} of process {pid}")]
    PermissionDenied { pid: i32, tid: ThreadId },

    /// 別のトレーサーが既にプロセスを制御している
    #[error("Process {pid} is already traced by {tracer}")]
    AlreadyTraced { pid: i32, tracer: i32 },

    /// 対象プロセス（またはスレッド）が終了した
    #[error("Process {pid} is gone")]
    ProcessGone { pid: i32 },

    /// スレッド集合が再試行回数内に安定しなかった
    #[error("Thread set of process {pid} did not settle after {rounds} attach rounds")]
    AttachTimeout { pid: i32, rounds: usize },

    /// スレッドが停止していない、またはセッションが把握していない
    #[error("Thread {tid} is not stopped")]
    NotStopped { tid: ThreadId },

    /// 停止・トラップ待ちがタイムアウトした
    #[error("Thread {tid} did not stop within {timeout_ms} ms")]
    Hung { tid: ThreadId, timeout_ms: u128 },

    /// リモート呼び出しが期待したトラップ以外で停止した
    #[error("Remote call on thread {tid} stopped with unexpected signal {signal:?} at 0x{rip:x}")]
    CallFailed {
        tid: ThreadId,
        signal: Signal,
        rip: u64,
    },

    /// 途中まで読み取れた（読み取れたバイト列を保持する）
    #[error("Partial read at 0x{address:x}: only {} bytes readable", .bytes.len())]
    PartialRead { address: u64, bytes: Vec<u8> },

    /// 途中まで書き込めた（書き込み済みバイト数を保持する）
    #[error("Partial write at 0x{address:x}: only {written} bytes committed")]
    PartialWrite { address: u64, written: usize },

    /// 1バイトも転送できなかった
    #[error("Memory access at 0x{address:x} failed: {source}")]
    MemoryAccess {
        address: u64,
        #[source]
        source: Errno,
    },

    /// リモート mmap/munmap が失敗した
    #[error("Remote allocation failed: {errno}")]
    AllocationFailed { errno: Errno },

    /// レジスタの書き戻しに失敗した（セッションは使用不能になる）
    #[error("Failed to restore registers of thread {tid}: {source}")]
    RegisterRestoreFailed {
        tid: ThreadId,
        #[source]
        source: Errno,
    },

    /// セッションが RegisterRestoreFailed により使用不能
    #[error("Session for process {pid} is poisoned; re-attach required")]
    SessionPoisoned { pid: i32 },

    /// セッションは既にデタッチ済み
    #[error("Session for process {pid} is detached")]
    NotAttached { pid: i32 },

    /// 対象プロセス内で関数のエントリポイントが見つからない
    #[error("Entry point '{name}' not found in process {pid}")]
    EntryPointNotFound { name: &'static str, pid: i32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// その他のシステムコールエラー
    #[error("{operation} failed: {source}")]
    Os {
        operation: &'static str,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TraceeError {
    /// nix のエラーを操作名付きで包む
    pub fn os(operation: &'static str, source: Errno) -> Self {
        Self::Os { operation, source }
    }

    /// 現在の操作を中断して呼び出し側がデタッチすべきエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::AlreadyTraced { .. }
                | Self::AttachTimeout { .. }
                | Self::Hung { .. }
                | Self::RegisterRestoreFailed { .. }
                | Self::SessionPoisoned { .. }
        )
    }

    /// セッション自体が使用不能になるエラーか
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::RegisterRestoreFailed { .. } | Self::SessionPoisoned { .. }
        )
    }

    /// 部分的な転送で、呼び出し側が残りを再試行できるか
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialRead { .. } | Self::PartialWrite { .. })
    }
}
