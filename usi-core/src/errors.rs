//! エラー型

use thiserror::Error;
use usi_target::TraceeError;

/// セッション操作のエラー
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// 関数表に登録されていない名前
    #[error("Function '{0}' is not registered in this session")]
    UnknownFunction(String),

    /// このセッションで確保していない領域の解放
    #[error("No live region at 0x{0:x}")]
    UnknownRegion(u64),

    #[error(transparent)]
    Tracee(#[from] TraceeError),
}

impl InstrumentError {
    /// 呼び出し側がデタッチすべきエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Tracee(e) if e.is_fatal())
    }
}
