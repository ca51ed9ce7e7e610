//! レジスタアクセス機能
//!
//! 停止中スレッドのレジスタファイル（汎用・FP/SSE・XSAVE領域）の取得と書き戻し、
//! およびリモート呼び出し用レジスタの組み立てを行います。x86_64 (System V AMD64) 専用です。

use crate::process::Session;
use crate::thread::{self, ThreadId};
use crate::{Result, TraceeError};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// リモート呼び出しの戻り先アドレス
///
/// ページ0は決してマップされないため、呼び出し先が `ret` すると即座にフォールトします。
pub const RETURN_SENTINEL: u64 = 0;

/// 整数引数を渡すレジスタの数（rdi, rsi, rdx, rcx, r8, r9）
pub const INTEGER_ARGUMENT_REGISTERS: usize = 6;

/// System V ABI のレッドゾーン
const RED_ZONE: u64 = 128;

/// EFLAGS の方向フラグ
const EFLAGS_DF: u64 = 1 << 10;

/// PTRACE_GETREGSET で XSAVE 領域を指定するノートタイプ
const NT_X86_XSTATE: usize = 0x202;

/// XSAVE 領域の読み取りバッファ（AMX タイルを含めても収まる大きさ）
const XSTATE_BUFFER_SIZE: usize = 16 * 1024;

/// XSAVE 領域内の YMM 上位128ビットの位置
const YMM_HI128_RANGE: std::ops::Range<usize> = 576..832;

/// あるスレッドのある時点でのレジスタファイル
#[derive(Clone)]
pub struct RegisterSet {
    gpr: libc::user_regs_struct,
    fpr: libc::user_fpregs_struct,
    /// カーネルが NT_X86_XSTATE を提供しない場合は `None`
    xstate: Option<Vec<u8>>,
}

impl RegisterSet {
    /// 生のレジスタ構造体から作成する
    pub fn from_raw(
        gpr: libc::user_regs_struct,
        fpr: libc::user_fpregs_struct,
        xstate: Option<Vec<u8>>,
    ) -> Self {
        Self { gpr, fpr, xstate }
    }

    /// 汎用レジスタ
    pub fn gpr(&self) -> &libc::user_regs_struct {
        &self.gpr
    }

    /// FP/SSE レジスタ
    pub fn fpr(&self) -> &libc::user_fpregs_struct {
        &self.fpr
    }

    /// XSAVE 領域の生バイト列
    pub fn xstate(&self) -> Option<&[u8]> {
        self.xstate.as_deref()
    }

    /// プログラムカウンタ（RIP）
    pub fn instruction_pointer(&self) -> u64 {
        self.gpr.rip
    }

    /// スタックポインタ（RSP）
    pub fn stack_pointer(&self) -> u64 {
        self.gpr.rsp
    }

    /// 戻り値レジスタ（RAX）
    pub fn return_value(&self) -> u64 {
        self.gpr.rax
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.gpr.rax = value;
    }

    fn ymm_upper_halves(&self) -> Option<&[u8]> {
        self.xstate.as_deref().and_then(|x| x.get(YMM_HI128_RANGE))
    }
}

impl PartialEq for RegisterSet {
    fn eq(&self, other: &Self) -> bool {
        // XSAVE ヘッダは使用状況に応じてカーネルが書き換えるため、
        // レジスタ内容（YMM 上位）のみ比較する
        self.gpr == other.gpr
            && self.fpr == other.fpr
            && self.ymm_upper_halves() == other.ymm_upper_halves()
    }
}

impl std::fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterSet")
            .field("rip", &format_args!("0x{:x}", self.gpr.rip))
            .field("rsp", &format_args!("0x{:x}", self.gpr.rsp))
            .field("rax", &format_args!("0x{:x}", self.gpr.rax))
            .field("xstate_len", &self.xstate.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// 停止中スレッドのレジスタを取得する
pub fn capture(session: &Session, tid: ThreadId) -> Result<RegisterSet> {
    session.require_stopped(tid)?;
    read_register_set(tid).map_err(|e| match e {
        Errno::ESRCH if !thread::thread_exists(session.pid(), tid) => {
            TraceeError::ProcessGone { pid: session.pid() }
        }
        Errno::ESRCH => TraceeError::NotStopped { tid },
        e => TraceeError::os("PTRACE_GETREGS", e),
    })
}

/// レジスタをすべて書き戻す
///
/// 途中で失敗するとレジスタは不定状態になるため、`RegisterRestoreFailed` を返して
/// セッションを使用不能にします。
pub fn apply(session: &mut Session, tid: ThreadId, set: &RegisterSet) -> Result<()> {
    // 書き換えは全スレッドが停止しているときだけ
    session.require_all_stopped()?;
    session.require_stopped(tid)?;
    let pid = Pid::from_raw(tid);

    // 何も書き込む前に消えていたなら、レジスタは壊れていない
    if let Err(e) = ptrace::setregs(pid, set.gpr) {
        if e == Errno::ESRCH && !thread::thread_exists(session.pid(), tid) {
            return Err(session.forget_thread(tid));
        }
        session.poison();
        return Err(TraceeError::RegisterRestoreFailed { tid, source: e });
    }

    let rest = set_fpregs(tid, &set.fpr).and_then(|()| match &set.xstate {
        Some(xstate) => set_xstate(tid, xstate),
        None => Ok(()),
    });
    if let Err(source) = rest {
        session.poison();
        return Err(TraceeError::RegisterRestoreFailed { tid, source });
    }
    Ok(())
}

/// 停止中スレッドのプログラムカウンタを取得する
pub fn pc(session: &Session, tid: ThreadId) -> Result<u64> {
    session.require_stopped(tid)?;
    let regs = ptrace::getregs(Pid::from_raw(tid)).map_err(|e| TraceeError::os("PTRACE_GETREGS", e))?;
    Ok(regs.rip)
}

fn read_register_set(tid: ThreadId) -> std::result::Result<RegisterSet, Errno> {
    let gpr = ptrace::getregs(Pid::from_raw(tid))?;
    let fpr = get_fpregs(tid)?;
    let xstate = get_xstate(tid)?;
    Ok(RegisterSet { gpr, fpr, xstate })
}

fn get_fpregs(tid: ThreadId) -> std::result::Result<libc::user_fpregs_struct, Errno> {
    let mut fpr: libc::user_fpregs_struct = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPREGS,
            tid,
            std::ptr::null_mut::<libc::c_void>(),
            &mut fpr as *mut libc::user_fpregs_struct,
        )
    };
    Errno::result(ret)?;
    Ok(fpr)
}

fn set_fpregs(tid: ThreadId, fpr: &libc::user_fpregs_struct) -> std::result::Result<(), Errno> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETFPREGS,
            tid,
            std::ptr::null_mut::<libc::c_void>(),
            fpr as *const libc::user_fpregs_struct,
        )
    };
    Errno::result(ret).map(drop)
}

fn get_xstate(tid: ThreadId) -> std::result::Result<Option<Vec<u8>>, Errno> {
    let mut buffer = vec![0u8; XSTATE_BUFFER_SIZE];
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid,
            NT_X86_XSTATE as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    match Errno::result(ret) {
        Ok(_) => {
            buffer.truncate(iov.iov_len);
            Ok(Some(buffer))
        }
        // XSAVE 非対応のカーネル/CPU
        Err(Errno::EINVAL) | Err(Errno::ENODEV) => Ok(None),
        Err(e) => Err(e),
    }
}

fn set_xstate(tid: ThreadId, xstate: &[u8]) -> std::result::Result<(), Errno> {
    // カーネルは iov を書き換えないが、API は可変ポインタを要求する
    let mut buffer = xstate.to_vec();
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            tid,
            NT_X86_XSTATE as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(ret).map(drop)
}

/// リモート呼び出しの準備結果
///
/// `stack_image` を `stack_address` に書き込んでから `registers` を適用すると、
/// スレッドは `function_address` を引数付きで呼び出し、[`RETURN_SENTINEL`] に戻ろうとして停止します。
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub function_address: u64,
    pub registers: RegisterSet,
    pub stack_address: u64,
    pub stack_image: Vec<u8>,
}

/// 関数呼び出し用のレジスタを組み立てる
///
/// 最初の6個の整数引数はレジスタ、残りは順にスタックへ積みます。
/// 関数の入口で `rsp % 16 == 8` となるように、レッドゾーンを避けて整列させます。
pub fn build_call_registers(base: &RegisterSet, function_address: u64, args: &[u64]) -> PreparedCall {
    let mut registers = base.clone();
    let gpr = &mut registers.gpr;

    let argument_registers: [&mut u64; INTEGER_ARGUMENT_REGISTERS] =
        [&mut gpr.rdi, &mut gpr.rsi, &mut gpr.rdx, &mut gpr.rcx, &mut gpr.r8, &mut gpr.r9];
    for (register, value) in argument_registers.into_iter().zip(args) {
        *register = *value;
    }
    let stack_args = args.get(INTEGER_ARGUMENT_REGISTERS..).unwrap_or(&[]);

    let mut sp = base.gpr.rsp.wrapping_sub(RED_ZONE) & !0xf;
    if stack_args.len() % 2 == 1 {
        sp = sp.wrapping_sub(8);
    }
    sp = sp.wrapping_sub(8 * (stack_args.len() as u64 + 1));

    let mut stack_image = Vec::with_capacity(8 * (stack_args.len() + 1));
    stack_image.extend_from_slice(&RETURN_SENTINEL.to_le_bytes());
    for arg in stack_args {
        stack_image.extend_from_slice(&arg.to_le_bytes());
    }

    gpr.rsp = sp;
    gpr.rip = function_address;
    // 可変長引数関数向け: ベクタレジスタ引数の数
    gpr.rax = 0;
    // 割り込まれたシステムコールの再実行を無効にする
    gpr.orig_rax = u64::MAX;
    gpr.eflags &= !EFLAGS_DF;

    PreparedCall {
        function_address,
        registers,
        stack_address: sp,
        stack_image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_registers(rsp: u64) -> RegisterSet {
        let mut gpr: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        gpr.rsp = rsp;
        gpr.rip = 0x5555_0000_1000;
        gpr.rax = 0xdead;
        gpr.orig_rax = 35;
        gpr.eflags = 0x246 | EFLAGS_DF;
        gpr.rbx = 0x1234;
        let fpr: libc::user_fpregs_struct = unsafe { std::mem::zeroed() };
        RegisterSet::from_raw(gpr, fpr, None)
    }

    #[test]
    fn test_register_arguments() {
        let base = base_registers(0x7ffe_0000_1008);
        let call = build_call_registers(&base, 0x4000, &[1, 2, 3]);
        let gpr = call.registers.gpr();

        assert_eq!(gpr.rip, 0x4000);
        assert_eq!((gpr.rdi, gpr.rsi, gpr.rdx), (1, 2, 3));
        assert_eq!(gpr.rax, 0);
        assert_eq!(gpr.orig_rax, u64::MAX);
        assert_eq!(gpr.eflags & EFLAGS_DF, 0);
        // 呼び出しに関係しないレジスタは保持される
        assert_eq!(gpr.rbx, 0x1234);
        assert_eq!(call.stack_image, RETURN_SENTINEL.to_le_bytes().to_vec());
    }

    #[test]
    fn test_stack_alignment_and_red_zone() {
        for rsp in [0x7ffe_0000_1000u64, 0x7ffe_0000_1008, 0x7ffe_0000_100c] {
            for n in 0..10usize {
                let args: Vec<u64> = (0..n as u64).collect();
                let call = build_call_registers(&base_registers(rsp), 0x4000, &args);
                let sp = call.registers.stack_pointer();

                assert_eq!(sp % 16, 8, "rsp=0x{:x} args={}", rsp, n);
                assert_eq!(sp, call.stack_address);
                // スタックイメージ全体がレッドゾーンより下にある
                assert!(sp + call.stack_image.len() as u64 <= rsp - RED_ZONE);
            }
        }
    }

    #[test]
    fn test_stack_arguments_in_order() {
        let args: Vec<u64> = (1..=9).collect();
        let call = build_call_registers(&base_registers(0x7ffe_0000_2000), 0x4000, &args);
        let gpr = call.registers.gpr();
        assert_eq!((gpr.rcx, gpr.r8, gpr.r9), (4, 5, 6));

        let words: Vec<u64> = call
            .stack_image
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![RETURN_SENTINEL, 7, 8, 9]);
    }

    #[test]
    fn test_base_is_untouched() {
        let base = base_registers(0x7ffe_0000_1000);
        let snapshot = base.clone();
        let call = build_call_registers(&base, 0x4000, &[42]);
        assert_eq!(base, snapshot);
        assert_ne!(call.registers, base);
    }

    #[test]
    fn test_set_return_value() {
        let mut set = base_registers(0x7ffe_0000_1000);
        set.set_return_value(7);
        assert_eq!(set.return_value(), 7);
        assert_eq!(set.gpr().rax, 7);
    }
}
