//! usi ターゲットプロセス制御
//!
//! このクレートは、実行中のマルチスレッドプロセスに協力なしでアタッチし、
//! 全スレッドを一貫して停止させたうえでメモリとレジスタを読み書きする機能を提供します。
//! さらに停止中のスレッドに任意の関数を実行させる「リモート呼び出し」と、
//! それを使った対象プロセス内でのメモリ確保・解放を行います。
//!
//! 対象は Linux / x86_64 です。

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("usi-target supports Linux on x86_64 only");

pub mod allocator;
pub mod call;
pub mod config;
pub mod error;
pub mod memory;
pub mod process;
pub mod registers;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_support;

pub use allocator::{EntryPoints, MemoryRegion, TraceeAllocator};
pub use call::execute_in_tracee;
pub use config::SessionConfig;
pub use error::TraceeError;
pub use memory::{Memory, MemoryMapping, Protection};
pub use process::{AttachState, DetachOutcome, Session};
pub use registers::{build_call_registers, PreparedCall, RegisterSet, RETURN_SENTINEL};
pub use thread::{ThreadId, ThreadState};

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, TraceeError>;
