//! トレース対象内でのメモリ確保・解放
//!
//! 対象プロセスにロードされている libc の `mmap`/`munmap` をリモート呼び出しして、
//! 対象のアドレス空間にメモリを確保します。確保した領域は呼び出し側が明示的に解放するまで
//! 残り、デタッチしても自動では解放されません。

use crate::call::execute_in_tracee;
use crate::memory::{read_mappings, Memory, MemoryMapping, Protection};
use crate::process::Session;
use crate::{Result, TraceeError};
use nix::errno::Errno;
use tracing::{debug, info};

/// 対象プロセス内の libc 関数のアドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints {
    pub mmap: u64,
    pub munmap: u64,
    /// `__errno_location`（失敗時のエラーコード取得用、無くてもよい）
    pub errno_location: Option<u64>,
}

impl EntryPoints {
    /// 自プロセスの libc 関数アドレスを、対象プロセスの同じ共有オブジェクトへ写像して求める
    pub fn locate(pid: i32) -> Result<Self> {
        let own = read_mappings("/proc/self/maps")?;
        let theirs = match read_mappings(format!("/proc/{}/maps", pid)) {
            Err(TraceeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TraceeError::ProcessGone { pid });
            }
            other => other?,
        };

        let find = |name: &'static str, local: u64| {
            translate_address(local, &own, &theirs).ok_or(TraceeError::EntryPointNotFound { name, pid })
        };
        let entry_points = Self {
            mmap: find("mmap", libc::mmap as usize as u64)?,
            munmap: find("munmap", libc::munmap as usize as u64)?,
            errno_location: find("__errno_location", libc::__errno_location as usize as u64).ok(),
        };
        debug!(pid, ?entry_points, "located allocator entry points");
        Ok(entry_points)
    }
}

/// あるプロセスのアドレスを、同じファイルをマップしている別プロセスのアドレスへ変換する
fn translate_address(local: u64, own: &[MemoryMapping], theirs: &[MemoryMapping]) -> Option<u64> {
    let source = own.iter().find(|m| m.contains(local))?;
    let path = source.path.as_ref()?;
    let file_offset = local - source.start + source.offset;

    theirs
        .iter()
        .filter(|m| m.path.as_ref() == Some(path) && m.protection.exec)
        .find(|m| file_offset >= m.offset && file_offset < m.offset + (m.end - m.start))
        .map(|m| m.start + (file_offset - m.offset))
}

/// 対象プロセス内に確保したメモリ領域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub len: u64,
    pub protection: Protection,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// リモート mmap/munmap によるアロケータ
#[derive(Debug, Clone)]
pub struct TraceeAllocator {
    entry_points: EntryPoints,
}

impl TraceeAllocator {
    /// 対象プロセスの libc からエントリポイントを探してアロケータを作成する
    pub fn new(session: &Session) -> Result<Self> {
        session.ensure_usable()?;
        Ok(Self {
            entry_points: EntryPoints::locate(session.pid())?,
        })
    }

    /// エントリポイントを明示してアロケータを作成する
    pub fn with_entry_points(entry_points: EntryPoints) -> Self {
        Self { entry_points }
    }

    pub fn entry_points(&self) -> EntryPoints {
        self.entry_points
    }

    /// `size` バイトの匿名メモリを確保する
    pub fn allocate(&self, session: &mut Session, size: u64, protection: Protection) -> Result<MemoryRegion> {
        if size == 0 {
            return Err(TraceeError::InvalidArgument("Cannot allocate 0 bytes".to_string()));
        }
        let tid = session
            .main_thread()
            .ok_or(TraceeError::NotAttached { pid: session.pid() })?;

        let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let args = [0, size, protection.to_prot() as u64, flags, (-1i64) as u64, 0];
        let ret = execute_in_tracee(session, tid, self.entry_points.mmap, &args)?;

        if ret == libc::MAP_FAILED as u64 {
            let errno = self.remote_errno(session, tid);
            return Err(TraceeError::AllocationFailed { errno });
        }
        // 生のシステムコール値（-4095..-1）が返る実装にも対応する
        if (ret as i64) < 0 && (ret as i64) >= -4095 {
            return Err(TraceeError::AllocationFailed {
                errno: Errno::from_raw(-(ret as i64) as i32),
            });
        }

        let region = MemoryRegion {
            base: ret,
            len: size,
            protection,
        };
        info!(pid = session.pid(), base = format_args!("0x{:x}", region.base), size, "allocated memory in tracee");
        Ok(region)
    }

    /// `allocate` で確保した領域を解放する
    pub fn free(&self, session: &mut Session, region: &MemoryRegion) -> Result<()> {
        self.free_raw(session, region.base, region.len)
    }

    /// アドレスとサイズを指定して解放する
    pub fn free_raw(&self, session: &mut Session, address: u64, size: u64) -> Result<()> {
        let tid = session
            .main_thread()
            .ok_or(TraceeError::NotAttached { pid: session.pid() })?;
        let ret = execute_in_tracee(session, tid, self.entry_points.munmap, &[address, size])?;

        // munmap は int を返すので下位32ビットだけを見る
        if ret as i32 != 0 {
            let errno = self.remote_errno(session, tid);
            return Err(TraceeError::AllocationFailed { errno });
        }
        info!(pid = session.pid(), base = format_args!("0x{:x}", address), size, "freed memory in tracee");
        Ok(())
    }

    /// 対象スレッドの errno を読み取る（取得できなければ UnknownErrno）
    fn remote_errno(&self, session: &mut Session, tid: i32) -> Errno {
        let Some(errno_location) = self.entry_points.errno_location else {
            return Errno::UnknownErrno;
        };
        execute_in_tracee(session, tid, errno_location, &[])
            .and_then(|address| Memory::new(session).read_u32(address))
            .map(|value| Errno::from_raw(value as i32))
            .unwrap_or(Errno::UnknownErrno)
    }
}
