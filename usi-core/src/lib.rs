//! usi のコア機能
//!
//! このクレートは、フック導入などの上位レイヤーが使うセッション単位の操作をまとめます。
//! ターゲットプロセスの制御、確保したメモリ領域の管理、関数アドレス表を統合します。

pub mod errors;
pub mod functions;
pub mod instrumenter;

pub use errors::InstrumentError;
pub use functions::FunctionTable;
pub use instrumenter::{DetachReport, Instrumenter};

// 他のクレートから使用するために再エクスポート
pub use usi_target::{MemoryRegion, Protection, SessionConfig, ThreadId, TraceeError};

/// コア操作の結果型
pub type Result<T> = std::result::Result<T, InstrumentError>;
