//! 統合テスト用のトレース対象プログラム
//!
//! 起動すると `ready pid=<pid> answer=<addr> ...` の形式で関数アドレスを1行出力し、
//! 標準入力が閉じられるまで動き続けてから終了コード0で終了します。
//!
//! * `idle`  - メインスレッドと2つのワーカースレッド（合計3スレッド）
//! * `churn` - 短命なスレッドを生成し続ける

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// `usi_fixture_answer` が返す定数
const ANSWER: u64 = 0x5EED_F00D_CAFE_0042;

#[no_mangle]
pub extern "C" fn usi_fixture_answer() -> u64 {
    ANSWER
}

/// 引数の順序を確認するための重み付き和（7番目以降はスタック渡し）
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn usi_fixture_sum(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64, g: u64, h: u64) -> u64 {
    a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h
}

/// 戻らない関数（タイムアウトの確認用）
#[no_mangle]
pub extern "C" fn usi_fixture_spin() -> u64 {
    loop {
        std::hint::spin_loop();
    }
}

/// 自スレッドに SIGUSR2 を送る（予期しないシグナルの確認用）
#[no_mangle]
pub extern "C" fn usi_fixture_raise() -> u64 {
    unsafe { libc::raise(libc::SIGUSR2) };
    0
}

/// NULL 関数ポインタを呼び出す（rip == 0 でのクラッシュの確認用）
#[no_mangle]
pub extern "C" fn usi_fixture_null_call() -> u64 {
    let result: u64;
    unsafe {
        std::arch::asm!("xor eax, eax", "call rax", out("rax") result, clobber_abi("C"));
    }
    result
}

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "idle".to_string());
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();

    for _ in 0..2 {
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        }));
    }

    if mode == "churn" {
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let short_lived = thread::spawn(|| thread::sleep(Duration::from_micros(200)));
                let _ = short_lived.join();
            }
        }));
    }

    let answer: extern "C" fn() -> u64 = usi_fixture_answer;
    let sum: extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64) -> u64 = usi_fixture_sum;
    let spin: extern "C" fn() -> u64 = usi_fixture_spin;
    let raise: extern "C" fn() -> u64 = usi_fixture_raise;
    let null_call: extern "C" fn() -> u64 = usi_fixture_null_call;
    let mut stdout = std::io::stdout();
    let _ = writeln!(
        stdout,
        "ready pid={} answer=0x{:x} sum=0x{:x} spin=0x{:x} raise=0x{:x} null=0x{:x}",
        std::process::id(),
        answer as usize,
        sum as usize,
        spin as usize,
        raise as usize,
        null_call as usize
    );
    let _ = stdout.flush();

    // 標準入力が閉じられるまで待つ
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.join();
    }
    std::process::exit(0);
}
