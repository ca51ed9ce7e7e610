//! メモリアクセス機能

use crate::process::Session;
use crate::{Result, TraceeError};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// ptrace の転送単位（1ワード）
const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

/// メモリから読み取り可能な型
pub trait MemoryReadable: Sized {
    /// リトルエンディアンのバイト配列から値を構築
    fn from_le_slice(bytes: &[u8]) -> Result<Self>;

    /// リトルエンディアンバイト配列に変換
    fn to_le_vec(&self) -> Vec<u8>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! impl_memory_readable {
    ($($ty:ty),*) => {
        $(
            impl MemoryReadable for $ty {
                fn from_le_slice(bytes: &[u8]) -> Result<Self> {
                    let array = bytes.try_into().map_err(|_| {
                        TraceeError::InvalidArgument(format!(
                            "Failed to convert {} bytes to {} (expected {} bytes)",
                            bytes.len(),
                            stringify!($ty),
                            std::mem::size_of::<$ty>()
                        ))
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }

                fn to_le_vec(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn size() -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

impl_memory_readable!(u8, u16, u32, u64);

/// メモリ保護属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub const READ_WRITE: Self = Self { read: true, write: true, exec: false };
    pub const READ_EXEC: Self = Self { read: true, write: false, exec: true };
    pub const READ_WRITE_EXEC: Self = Self { read: true, write: true, exec: true };

    /// mmap の `prot` 引数に変換する
    pub fn to_prot(self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.exec {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub protection: Protection,
    pub offset: u64,
    /// 匿名マッピングの場合は `None`
    pub path: Option<PathBuf>,
}

impl MemoryMapping {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// `/proc/<pid>/maps` の1行を解析する
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.splitn(6, char::is_whitespace);
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().map(str::trim).filter(|p| p.starts_with('/'));

    let (start, end) = range.split_once('-')?;
    let perms = perms.as_bytes();
    Some(MemoryMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        protection: Protection {
            read: perms.first() == Some(&b'r'),
            write: perms.get(1) == Some(&b'w'),
            exec: perms.get(2) == Some(&b'x'),
        },
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: path.map(PathBuf::from),
    })
}

/// maps ファイルを解析してメモリマッピング情報を取得する
pub fn read_mappings(maps_path: impl AsRef<Path>) -> Result<Vec<MemoryMapping>> {
    let file = File::open(maps_path.as_ref())?;
    let mut mappings = Vec::new();
    for line in BufReader::new(file).lines() {
        if let Some(mapping) = parse_maps_line(&line?) {
            mappings.push(mapping);
        }
    }
    Ok(mappings)
}

/// 1ワードの一部を上書きする
fn overlay_word(existing: libc::c_long, offset: usize, bytes: &[u8]) -> libc::c_long {
    let mut word = existing.to_ne_bytes();
    word[offset..offset + bytes.len()].copy_from_slice(bytes);
    libc::c_long::from_ne_bytes(word)
}

fn errno_of(err: &std::io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

/// トレース対象のメモリアクセス
pub struct Memory<'a> {
    session: &'a Session,
    pid: Pid,
}

impl<'a> Memory<'a> {
    /// メモリアクセスを作成する
    pub fn new(session: &'a Session) -> Self {
        Self {
            session,
            pid: Pid::from_raw(session.pid()),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/mem を使用して読み取ります。開けない場合は PTRACE_PEEKDATA にフォールバックします。
    /// 途中で読めなくなった場合は、それまでに読めたバイト列を `PartialRead` として返します。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.session.ensure_usable()?;
        if size == 0 {
            return Ok(Vec::new());
        }
        if addr.checked_add(size as u64).is_none() {
            return Err(TraceeError::InvalidArgument(format!(
                "Read of {} bytes at 0x{:x} wraps around the address space",
                size, addr
            )));
        }

        match File::open(self.mem_path()) {
            Ok(file) => self.read_via_proc_mem(&file, addr, size),
            Err(e) => {
                debug!(pid = %self.pid, error = %e, "/proc/pid/mem unavailable, using ptrace");
                self.read_via_ptrace(addr, size)
            }
        }
    }

    /// /proc/pid/mem 経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, file: &File, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        let mut done = 0;
        let mut failure = None;

        while done < size {
            match file.read_at(&mut buffer[done..], addr + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(errno_of(&e));
                    break;
                }
            }
        }

        if done == size {
            return Ok(buffer);
        }
        buffer.truncate(done);
        Err(self.read_failure(addr, buffer, failure.unwrap_or(Errno::EIO)))
    }

    /// PTRACE_PEEKDATA を使用してメモリからデータを読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size);

        // word単位で読み取り
        for offset in (0..size).step_by(WORD_SIZE) {
            let word_addr = addr + offset as u64;
            let word = match ptrace::read(self.pid, word_addr as ptrace::AddressType) {
                Ok(word) => word,
                Err(e) => return Err(self.read_failure(addr, data, e)),
            };

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(WORD_SIZE);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    fn read_failure(&self, addr: u64, bytes: Vec<u8>, errno: Errno) -> TraceeError {
        if errno == Errno::ESRCH {
            return TraceeError::ProcessGone { pid: self.session.pid() };
        }
        if bytes.is_empty() {
            TraceeError::MemoryAccess { address: addr, source: errno }
        } else {
            TraceeError::PartialRead { address: addr, bytes }
        }
    }

    /// メモリにデータを書き込む
    ///
    /// PTRACE_POKEDATA によるワード単位の書き込みです。末尾の端数ワードは既存の内容を読み取り、
    /// 指定されたバイトだけを重ねて書き戻します。途中で失敗した場合は、書き込み済みの
    /// バイト数を `PartialWrite` として返します。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.session.require_all_stopped()?;
        if data.is_empty() {
            return Ok(());
        }
        if addr.checked_add(data.len() as u64).is_none() {
            return Err(TraceeError::InvalidArgument(format!(
                "Write of {} bytes at 0x{:x} wraps around the address space",
                data.len(),
                addr
            )));
        }

        let mut written = 0;
        for chunk in data.chunks(WORD_SIZE) {
            let target = addr + written as u64;
            let result = match <[u8; WORD_SIZE]>::try_from(chunk) {
                Ok(word) => self.poke(target, libc::c_long::from_ne_bytes(word)),
                Err(_) => self.write_tail(target, chunk),
            };
            if let Err(e) = result {
                return Err(self.write_failure(addr, written, e));
            }
            written += chunk.len();
        }
        Ok(())
    }

    /// 端数ワードを書き込む
    fn write_tail(&self, addr: u64, tail: &[u8]) -> std::result::Result<(), Errno> {
        match ptrace::read(self.pid, addr as ptrace::AddressType) {
            Ok(existing) => self.poke(addr, overlay_word(existing, 0, tail)),
            // ワードがマッピング末尾をはみ出す場合は、末尾を揃えたワードで書き直す
            Err(Errno::EIO) | Err(Errno::EFAULT) if addr >= (WORD_SIZE - tail.len()) as u64 => {
                let start = addr - (WORD_SIZE - tail.len()) as u64;
                let existing = ptrace::read(self.pid, start as ptrace::AddressType)?;
                self.poke(start, overlay_word(existing, WORD_SIZE - tail.len(), tail))
            }
            Err(e) => Err(e),
        }
    }

    fn poke(&self, addr: u64, word: libc::c_long) -> std::result::Result<(), Errno> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.pid.as_raw(),
                addr as *mut libc::c_void,
                word as *mut libc::c_void,
            )
        };
        Errno::result(ret).map(drop)
    }

    fn write_failure(&self, addr: u64, written: usize, errno: Errno) -> TraceeError {
        if errno == Errno::ESRCH {
            return TraceeError::ProcessGone { pid: self.session.pid() };
        }
        if written == 0 {
            TraceeError::MemoryAccess { address: addr, source: errno }
        } else {
            TraceeError::PartialWrite { address: addr, written }
        }
    }

    /// 型付き値を読み取る（ジェネリック版）
    ///
    /// # Examples
    /// ```ignore
    /// let value: u64 = memory.read_typed(addr)?;
    /// let value: u32 = memory.read_typed(addr)?;
    /// ```
    pub fn read_typed<T: MemoryReadable>(&self, addr: u64) -> Result<T> {
        let bytes = self.read(addr, T::size())?;
        T::from_le_slice(&bytes)
    }

    /// 型付き値を書き込む（ジェネリック版）
    pub fn write_typed<T: MemoryReadable>(&self, addr: u64, value: &T) -> Result<()> {
        self.write(addr, &value.to_le_vec())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.read_typed(addr)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.read_typed(addr)
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write_typed(addr, &value)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        match read_mappings(format!("/proc/{}/maps", self.pid)) {
            Err(TraceeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TraceeError::ProcessGone { pid: self.session.pid() })
            }
            other => other,
        }
    }

    /// 指定されたアドレスが有効なメモリマッピング内にあるかチェックする
    pub fn is_mapped(&self, addr: u64) -> Result<bool> {
        Ok(self.mappings()?.iter().any(|m| m.contains(addr)))
    }

    /// 指定したファイルをマップしている実行可能なマッピングを探す
    pub fn find_mapping_for(&self, path: impl AsRef<Path>) -> Result<Option<MemoryMapping>> {
        let path = path.as_ref();
        Ok(self
            .mappings()?
            .into_iter()
            .find(|m| m.protection.exec && m.path.as_deref() == Some(path)))
    }

    /// 最初の実行可能なマッピングの範囲 `(start, end)` を取得する
    pub fn first_executable_region(&self) -> Result<(u64, u64)> {
        self.mappings()?
            .into_iter()
            .find(|m| m.protection.exec)
            .map(|m| (m.start, m.end))
            .ok_or_else(|| {
                TraceeError::InvalidArgument(format!(
                    "No executable mapping in process {}",
                    self.pid
                ))
            })
    }
}
