//! セッション単位の関数アドレス表
//!
//! シンボル解決は外部の仕事なので、解決済みのアドレスを名前で登録しておき、
//! リモート呼び出しの際に引きます。プロセス全体で共有するキャッシュは持ちません。

use std::collections::HashMap;

/// 関数名からアドレスへの表
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, u64>,
}

impl FunctionTable {
    /// 空の表を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 関数を登録する（既存の登録は上書きし、古いアドレスを返す）
    pub fn register(&mut self, name: impl Into<String>, address: u64) -> Option<u64> {
        self.functions.insert(name.into(), address)
    }

    /// 登録を削除する
    pub fn unregister(&mut self, name: &str) -> Option<u64> {
        self.functions.remove(name)
    }

    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.functions.get(name).copied()
    }

    /// アドレスから名前を逆引きする
    pub fn reverse_resolve(&self, address: u64) -> Option<&str> {
        self.functions
            .iter()
            .find(|(_, &addr)| addr == address)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
