//! リモート呼び出し
//!
//! 停止中のスレッド1つにトレース対象内の関数を実行させ、戻り値を取得します。
//! 呼び出しの間も他のスレッドはすべて停止したままで、呼び出し後のレジスタは
//! 呼び出し前と完全に一致するように書き戻されます。

use crate::memory::Memory;
use crate::process::Session;
use crate::registers::{self, RegisterSet, RETURN_SENTINEL};
use crate::thread::{self, StopStatus, ThreadId, WaitOutcome};
use crate::{Result, TraceeError};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

/// `tid` に `function_address(args...)` を実行させ、戻り値（RAX）を返す
///
/// 呼び出し先が戻り先の [`RETURN_SENTINEL`] に `ret` して SIGSEGV で停止し、
/// スタックポインタが番兵スロットの直上にあるときだけ成功とします。
/// それ以外のシグナルは `CallFailed`、タイムアウトは `Hung`、終了は `ProcessGone` です。
/// いずれの場合もスレッドが停止していれば元のレジスタを書き戻します。
/// 成功後もスレッドは停止したままです。
pub fn execute_in_tracee(
    session: &mut Session,
    tid: ThreadId,
    function_address: u64,
    args: &[u64],
) -> Result<u64> {
    if function_address == RETURN_SENTINEL {
        return Err(TraceeError::InvalidArgument(format!(
            "Cannot call the return sentinel address 0x{:x}",
            function_address
        )));
    }
    session.require_all_stopped()?;

    let original = registers::capture(session, tid)?;
    let call = registers::build_call_registers(&original, function_address, args);
    Memory::new(session).write(call.stack_address, &call.stack_image)?;
    registers::apply(session, tid, &call.registers)?;

    debug!(
        tid,
        function = format_args!("0x{:x}", function_address),
        args = args.len(),
        "starting remote call"
    );

    // 呼び出し対象のスレッドだけを再開する
    if let Err(e) = ptrace::cont(Pid::from_raw(tid), None) {
        if e == Errno::ESRCH && !thread::thread_exists(session.pid(), tid) {
            return Err(session.forget_thread(tid));
        }
        registers::apply(session, tid, &original)?;
        return Err(TraceeError::os("PTRACE_CONT", e));
    }
    session.set_thread_status(tid, StopStatus::Running);

    let config = session.config().clone();
    let outcome = match thread::wait_for_stop(tid, config.call_timeout, config.poll_interval) {
        Ok(outcome) => outcome,
        Err(e) => {
            park(session, tid, &original)?;
            return Err(e);
        }
    };

    match outcome {
        WaitOutcome::Stopped(signal) => {
            session.set_thread_status(tid, StopStatus::Stopped);
            let result = registers::capture(session, tid)?;
            registers::apply(session, tid, &original)?;

            // `ret` で番兵スロットを取り出した直後の状態だけを正常な戻りとみなす
            // （NULL 関数ポインタ経由のクラッシュも rip == 0 で止まる）
            let rip = result.instruction_pointer();
            let returned = rip == RETURN_SENTINEL && result.stack_pointer() == call.stack_address + 8;
            if signal == Signal::SIGSEGV && returned {
                debug!(tid, result = format_args!("0x{:x}", result.return_value()), "remote call returned");
                Ok(result.return_value())
            } else {
                warn!(tid, ?signal, rip = format_args!("0x{:x}", rip), "remote call interrupted");
                Err(TraceeError::CallFailed { tid, signal, rip })
            }
        }
        WaitOutcome::Exited => Err(session.forget_thread(tid)),
        WaitOutcome::TimedOut => {
            warn!(tid, timeout_ms = config.call_timeout.as_millis(), "remote call hung");
            park(session, tid, &original)?;
            Err(TraceeError::Hung {
                tid,
                timeout_ms: config.call_timeout.as_millis(),
            })
        }
    }
}

/// 実行中のまま残ったスレッドを止め、元のレジスタに戻す
///
/// 止められなかった場合はセッションを使用不能にします。
fn park(session: &mut Session, tid: ThreadId, original: &RegisterSet) -> Result<()> {
    let config = session.config().clone();
    match thread::interrupt(session.pid(), tid) {
        Ok(()) => {}
        Err(TraceeError::ProcessGone { .. }) => return Err(session.forget_thread(tid)),
        Err(e) => {
            session.poison();
            return Err(e);
        }
    }

    match thread::wait_for_stop(tid, config.stop_timeout, config.poll_interval)? {
        WaitOutcome::Stopped(signal) => {
            debug!(tid, ?signal, "thread parked after aborted call");
            session.set_thread_status(tid, StopStatus::Stopped);
            registers::apply(session, tid, original)
        }
        WaitOutcome::Exited => Err(session.forget_thread(tid)),
        WaitOutcome::TimedOut => {
            session.poison();
            Err(TraceeError::Hung {
                tid,
                timeout_ms: config.stop_timeout.as_millis(),
            })
        }
    }
}
