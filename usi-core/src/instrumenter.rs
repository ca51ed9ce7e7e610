//! セッション単位の操作

use crate::{FunctionTable, InstrumentError, Result};
use std::collections::BTreeMap;
use tracing::{info, warn};
use usi_target::{
    execute_in_tracee, DetachOutcome, Memory, MemoryRegion, Protection, Session, SessionConfig, ThreadId,
    TraceeAllocator, TraceeError,
};

/// デタッチの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachReport {
    pub outcome: DetachOutcome,
    /// 解放されないまま残った領域（論理的なリーク）
    pub leaked: Vec<MemoryRegion>,
}

/// 1つのトレース対象プロセスに対する計装セッション
pub struct Instrumenter {
    /// トレース対象のセッション
    session: Session,
    /// 初回のメモリ確保時にエントリポイントを探す
    allocator: Option<TraceeAllocator>,
    /// 確保済みで未解放の領域（ベースアドレス順）
    regions: BTreeMap<u64, MemoryRegion>,
    /// 関数アドレス表
    functions: FunctionTable,
}

impl Instrumenter {
    /// プロセスにアタッチして全スレッドを停止させる
    pub fn attach(pid: i32, config: SessionConfig) -> Result<Self> {
        let session = Session::attach_and_stop(pid, config)?;
        Ok(Self {
            session,
            allocator: None,
            regions: BTreeMap::new(),
            functions: FunctionTable::new(),
        })
    }

    /// アロケータ（エントリポイント）を明示する
    pub fn with_allocator(mut self, allocator: TraceeAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pid(&self) -> i32 {
        self.session.pid()
    }

    /// 関数アドレス表を取得する
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// 関数アドレス表を可変参照で取得する
    pub fn functions_mut(&mut self) -> &mut FunctionTable {
        &mut self.functions
    }

    fn allocator(&mut self) -> Result<TraceeAllocator> {
        if let Some(allocator) = &self.allocator {
            return Ok(allocator.clone());
        }
        let allocator = TraceeAllocator::new(&self.session)?;
        self.allocator = Some(allocator.clone());
        Ok(allocator)
    }

    /// 対象プロセス内にメモリを確保し、解放されるまで追跡する
    pub fn allocate(&mut self, size: u64, protection: Protection) -> Result<MemoryRegion> {
        let allocator = self.allocator()?;
        let region = allocator.allocate(&mut self.session, size, protection)?;
        self.regions.insert(region.base, region);
        Ok(region)
    }

    /// `allocate` で確保した領域を解放する
    pub fn free(&mut self, base: u64) -> Result<()> {
        let region = *self
            .regions
            .get(&base)
            .ok_or(InstrumentError::UnknownRegion(base))?;
        let allocator = self.allocator()?;
        allocator.free(&mut self.session, &region)?;
        self.regions.remove(&base);
        Ok(())
    }

    /// 未解放の領域
    pub fn live_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// メモリからデータを読み取る
    pub fn read(&self, address: u64, length: usize) -> Result<Vec<u8>> {
        Ok(Memory::new(&self.session).read(address, length)?)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        Ok(Memory::new(&self.session).write(address, bytes)?)
    }

    /// 指定スレッドで関数を実行する
    pub fn execute(&mut self, tid: ThreadId, function_address: u64, args: &[u64]) -> Result<u64> {
        Ok(execute_in_tracee(&mut self.session, tid, function_address, args)?)
    }

    /// メインスレッドで関数を実行する
    pub fn execute_on_main(&mut self, function_address: u64, args: &[u64]) -> Result<u64> {
        let tid = self
            .session
            .main_thread()
            .ok_or(TraceeError::NotAttached { pid: self.pid() })?;
        self.execute(tid, function_address, args)
    }

    /// 関数表に登録した名前で関数を実行する
    pub fn execute_named(&mut self, name: &str, args: &[u64]) -> Result<u64> {
        let address = self
            .functions
            .resolve(name)
            .ok_or_else(|| InstrumentError::UnknownFunction(name.to_string()))?;
        self.execute_on_main(address, args)
    }

    /// デタッチする
    ///
    /// 未解放の領域は自動では解放せず、リークとして報告します。
    pub fn detach(mut self) -> DetachReport {
        let leaked: Vec<MemoryRegion> = std::mem::take(&mut self.regions).into_values().collect();
        for region in &leaked {
            warn!(
                pid = self.pid(),
                base = format_args!("0x{:x}", region.base),
                len = region.len,
                "region still allocated at detach"
            );
        }
        let outcome = self.session.detach_and_continue();
        info!(pid = self.pid(), ?outcome, leaked = leaked.len(), "instrumentation session closed");
        DetachReport { outcome, leaked }
    }
}
