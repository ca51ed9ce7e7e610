//! セッション設定

use std::time::Duration;

/// アタッチとリモート呼び出しの待機・再試行パラメータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// スレッド集合が安定するまでのアタッチ再試行ラウンド数の上限
    pub attach_retry_budget: usize,
    /// スレッド1つの停止を待つ上限時間
    pub stop_timeout: Duration,
    /// リモート呼び出しの復帰トラップを待つ上限時間
    pub call_timeout: Duration,
    /// 停止待ちのポーリング間隔
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attach_retry_budget: 16,
            stop_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl SessionConfig {
    /// 環境変数で既定値を上書きした設定を作成する
    ///
    /// * `USI_ATTACH_RETRIES` - アタッチ再試行ラウンド数
    /// * `USI_STOP_TIMEOUT_MS` - 停止待ちタイムアウト（ミリ秒）
    /// * `USI_CALL_TIMEOUT_MS` - リモート呼び出しタイムアウト（ミリ秒）
    ///
    /// 解析できない値は無視されます。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(rounds) = lookup("USI_ATTACH_RETRIES").and_then(|v| v.parse().ok()) {
            config.attach_retry_budget = rounds;
        }
        if let Some(ms) = lookup("USI_STOP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("USI_CALL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.call_timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_attach_retry_budget(mut self, rounds: usize) -> Self {
        self.attach_retry_budget = rounds.max(1);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
