// src/kernel/driver/mod.rs
//! デバイスドライバ基盤
//!
//! 名前とメジャー番号で引けるドライバレジストリと、固定プールの
//! デバイスハンドルを提供します。デバイス名は `/dev/<name><minor>` 形式で、
//! 末尾の 10 進数がマイナー番号になります。ハンドルはオープン位置を持ち、
//! read/write は返ったバイト数だけ位置を進めます。位置は open で 0 に
//! リセットされます。

pub mod console;
pub mod keyboard;
pub mod pit;
pub mod serial;

use crate::debug_println;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

/// コンソールへフォーマット済み出力を書く (`console_print!` の実体)
pub fn write_console(args: fmt::Arguments<'_>) {
    use core::fmt::Write;
    if let Some(mut console) = console::CONSOLE.try_lock() {
        let _ = console.write_fmt(args);
    }
}

/// シリアルデバッグ出力を書く (`debug_print!` の実体)
pub fn write_debug(args: fmt::Arguments<'_>) {
    use core::fmt::Write;
    if let Some(mut serial) = serial::SERIAL1.try_lock() {
        let _ = serial.write_fmt(args);
    }
}

/// ドライバ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// キャラクタデバイス
    Char,
    /// ブロックデバイス
    Block,
}

/// ドライバ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// 未ロード
    Unloaded,
    /// ロード済み
    Loaded,
    /// 初期化失敗
    Error,
}

/// ドライバ操作
///
/// 実装されない操作は `Unsupported` で失敗する。`open` を実装しない
/// ドライバはデバイスとして開けない。
pub trait DriverOps: Send + Sync {
    /// 登録時の初期化
    fn init(&self) -> KernelResult<()> {
        Ok(())
    }

    /// 登録解除時の後始末
    fn cleanup(&self) {}

    /// マイナー番号のデバイスを開く
    fn open(&self, minor: u32) -> KernelResult<()> {
        let _ = minor;
        Err(KernelError::new(ErrorKind::Unsupported))
    }

    /// デバイスを閉じる
    fn close(&self, minor: u32) {
        let _ = minor;
    }

    /// 位置 `pos` から読む
    fn read(&self, minor: u32, pos: u32, buf: &mut [u8]) -> KernelResult<usize> {
        let (_, _, _) = (minor, pos, buf);
        Err(KernelError::new(ErrorKind::Unsupported))
    }

    /// 位置 `pos` へ書く
    fn write(&self, minor: u32, pos: u32, buf: &[u8]) -> KernelResult<usize> {
        let (_, _, _) = (minor, pos, buf);
        Err(KernelError::new(ErrorKind::Unsupported))
    }

    /// デバイス固有制御
    fn ioctl(&self, minor: u32, cmd: u32, arg: u32) -> KernelResult<i32> {
        let (_, _, _) = (minor, cmd, arg);
        Err(KernelError::new(ErrorKind::Unsupported))
    }
}

/// 登録済みドライバのレコード
pub struct Driver {
    /// ドライバ名（デバイス名の接頭辞になる）
    pub name: &'static str,
    /// バージョン
    pub version: u32,
    /// 種別
    pub kind: DriverKind,
    /// 状態
    pub state: DriverState,
    /// メジャー番号（登録時 0 なら自動採番）
    pub major: u32,
    /// 操作
    pub ops: Arc<dyn DriverOps>,
}

struct DriverRegistry {
    drivers: Vec<Driver>,
    next_major: u32,
}

impl DriverRegistry {
    const fn new() -> Self {
        Self {
            drivers: Vec::new(),
            next_major: 1,
        }
    }
}

static DRIVERS: Mutex<DriverRegistry> = Mutex::new(DriverRegistry::new());

/// ドライバを登録する
///
/// メジャー番号が 0 なら採番し、`ops.init` を呼んでからレジストリに
/// 追加する。初期化に失敗したドライバは登録されない。
pub fn driver_register(mut driver: Driver) -> KernelResult<u32> {
    let mut registry = DRIVERS.lock();

    if driver.major == 0 {
        driver.major = registry.next_major;
        registry.next_major += 1;
    }

    if let Err(e) = driver.ops.init() {
        driver.state = DriverState::Error;
        debug_println!("[DRV] init failed for driver '{}'", driver.name);
        return Err(e);
    }
    driver.state = DriverState::Loaded;

    debug_println!(
        "[DRV] registered driver '{}' (major {})",
        driver.name,
        driver.major
    );
    let major = driver.major;
    registry.drivers.push(driver);
    Ok(major)
}

/// ドライバを登録解除する
///
/// レジストリから外してから `ops.cleanup` を呼ぶ。
pub fn driver_unregister(name: &str) -> KernelResult<()> {
    let driver = {
        let mut registry = DRIVERS.lock();
        let index = registry
            .drivers
            .iter()
            .position(|d| d.name == name)
            .ok_or(KernelError::new(ErrorKind::NotFound))?;
        registry.drivers.remove(index)
    };
    driver.ops.cleanup();
    debug_println!("[DRV] unregistered driver '{}'", driver.name);
    Ok(())
}

/// 名前でドライバを探す
#[must_use]
pub fn driver_find(name: &str) -> Option<(u32, Arc<dyn DriverOps>)> {
    DRIVERS
        .lock()
        .drivers
        .iter()
        .find(|d| d.name == name)
        .map(|d| (d.major, d.ops.clone()))
}

/// メジャー番号でドライバを探す
#[must_use]
pub fn driver_find_by_major(major: u32) -> Option<(&'static str, Arc<dyn DriverOps>)> {
    DRIVERS
        .lock()
        .drivers
        .iter()
        .find(|d| d.major == major)
        .map(|d| (d.name, d.ops.clone()))
}

/// 動的ドライバロード（このカーネル世代では未実装）
pub fn driver_load_from_file(path: &str) -> KernelResult<()> {
    debug_println!("[DRV] dynamic driver loading not implemented ({})", path);
    Err(KernelError::new(ErrorKind::Unsupported))
}

/// デバイス名 `/dev/<name><minor>` をドライバ名とマイナー番号に分解する
pub fn parse_device_name(device: &str) -> KernelResult<(&str, u32)> {
    let device = device.strip_prefix("/dev/").unwrap_or(device);
    if device.is_empty() {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }
    let split = device
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(device.len());
    let (name, digits) = device.split_at(split);
    if name.is_empty() {
        return Err(KernelError::new(ErrorKind::InvalidArgument));
    }
    let minor = if digits.is_empty() {
        0
    } else {
        digits
            .parse::<u32>()
            .map_err(|_| KernelError::new(ErrorKind::InvalidArgument))?
    };
    Ok((name, minor))
}

/// デバイスハンドルプールの大きさ
pub const MAX_DEVICE_HANDLES: usize = 64;

struct DeviceHandle {
    ops: Arc<dyn DriverOps>,
    minor: u32,
    #[allow(dead_code)]
    flags: u32,
    pos: u32,
}

lazy_static! {
    static ref DEVICE_HANDLES: Mutex<Vec<Option<DeviceHandle>>> =
        Mutex::new((0..MAX_DEVICE_HANDLES).map(|_| None).collect());
}

/// デバイスを開いてハンドル番号を返す
///
/// ハンドルの位置は 0 から始まる。
pub fn dev_open(device: &str, flags: u32) -> KernelResult<usize> {
    let (name, minor) = parse_device_name(device)?;
    let (_, ops) = driver_find(name).ok_or(KernelError::with_context(
        ErrorKind::NotFound,
        "no such driver",
    ))?;

    ops.open(minor)?;

    let mut handles = DEVICE_HANDLES.lock();
    let Some(slot) = handles.iter().position(|h| h.is_none()) else {
        ops.close(minor);
        return Err(KernelError::with_context(
            ErrorKind::Exhausted,
            "device handle pool",
        ));
    };
    handles[slot] = Some(DeviceHandle {
        ops,
        minor,
        flags,
        pos: 0,
    });
    Ok(slot)
}

/// デバイスハンドルを閉じる
pub fn dev_close(handle: usize) -> KernelResult<()> {
    let entry = DEVICE_HANDLES
        .lock()
        .get_mut(handle)
        .and_then(|h| h.take())
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    entry.ops.close(entry.minor);
    Ok(())
}

fn with_handle<T>(
    handle: usize,
    f: impl FnOnce(&mut DeviceHandle) -> KernelResult<T>,
) -> KernelResult<T> {
    let mut handles = DEVICE_HANDLES.lock();
    let entry = handles
        .get_mut(handle)
        .and_then(|h| h.as_mut())
        .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
    f(entry)
}

/// デバイスから読む（位置は読めた分だけ進む）
pub fn dev_read(handle: usize, buf: &mut [u8]) -> KernelResult<usize> {
    with_handle(handle, |entry| {
        let n = entry.ops.read(entry.minor, entry.pos, buf)?;
        entry.pos += n as u32;
        Ok(n)
    })
}

/// デバイスへ書く（位置は書けた分だけ進む）
pub fn dev_write(handle: usize, buf: &[u8]) -> KernelResult<usize> {
    with_handle(handle, |entry| {
        let n = entry.ops.write(entry.minor, entry.pos, buf)?;
        entry.pos += n as u32;
        Ok(n)
    })
}

/// デバイスハンドルの位置を変更する（デバイスにはサイズが無いので
/// SEEK_END は使えない）
pub fn dev_seek(handle: usize, offset: i32, whence: u32) -> KernelResult<u32> {
    use crate::kernel::fs::{SEEK_CUR, SEEK_SET};
    with_handle(handle, |entry| {
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => i64::from(entry.pos),
            _ => return Err(KernelError::new(ErrorKind::InvalidArgument)),
        };
        let new_pos = base + i64::from(offset);
        if new_pos < 0 {
            return Err(KernelError::new(ErrorKind::InvalidArgument));
        }
        entry.pos = new_pos as u32;
        Ok(entry.pos)
    })
}

/// ioctl パススルー
pub fn dev_ioctl(handle: usize, cmd: u32, arg: u32) -> KernelResult<i32> {
    with_handle(handle, |entry| entry.ops.ioctl(entry.minor, cmd, arg))
}
