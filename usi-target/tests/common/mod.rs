//! 統合テスト共通: usi-fixture の起動と後始末

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};

/// `usi_fixture_answer` が返す定数
pub const ANSWER: u64 = 0x5EED_F00D_CAFE_0042;

/// 起動済みのテスト対象プロセス
pub struct Fixture {
    child: Child,
    stdin: Option<ChildStdin>,
    symbols: HashMap<String, u64>,
}

impl Fixture {
    /// 3スレッドの待機プロセスを起動する
    pub fn idle() -> Self {
        Self::spawn("idle")
    }

    /// スレッドを生成し続けるプロセスを起動する
    pub fn churn() -> Self {
        Self::spawn("churn")
    }

    fn spawn(mode: &str) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_usi-fixture"))
            .arg(mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn usi-fixture");

        let stdout = child.stdout.take().expect("fixture stdout");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("Failed to read fixture banner");
        assert!(line.starts_with("ready "), "unexpected banner: {}", line);

        let symbols = line
            .split_whitespace()
            .skip(1)
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| {
                let value = match value.strip_prefix("0x") {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => value.parse(),
                };
                (key.to_string(), value.expect("fixture banner value"))
            })
            .collect();

        let stdin = child.stdin.take();
        Self { child, stdin, symbols }
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// バナーに出力された関数アドレス
    pub fn symbol(&self, name: &str) -> u64 {
        self.symbols[name]
    }

    /// 標準入力を閉じて終了を待つ
    pub fn finish(mut self) -> ExitStatus {
        drop(self.stdin.take());
        self.child.wait().expect("Failed to wait for fixture")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// `/proc/<pid>/task/<tid>/stat` のプロセス状態文字
pub fn thread_state(pid: i32, tid: i32) -> char {
    let stat = std::fs::read_to_string(format!("/proc/{}/task/{}/stat", pid, tid))
        .expect("Failed to read thread stat");
    // "tid (comm) S ..." の comm は空白を含み得るので最後の ')' の後を見る
    let rest = &stat[stat.rfind(')').expect("stat comm") + 1..];
    rest.trim_start().chars().next().expect("stat state")
}
