// src/kernel/driver/console.rs
//! テキストコンソール
//!
//! 実機では VGA テキストバッファ (0xB8000) に書き、ハードウェアカーソルを
//! ポート経由で追従させます。非 x86 ビルドではキャプチャシンクに落ち、
//! テストがエコー内容を観測できます。

use crate::kernel::core::KernelResult;
use crate::kernel::driver::DriverOps;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

/// コンソールの出力先
pub trait ConsoleSink: Send {
    /// 1 バイト出力
    fn put_byte(&mut self, byte: u8);
}

/// VGA テキストモードシンク (80x25)
#[cfg(target_arch = "x86")]
pub struct VgaTextSink {
    column: usize,
    row: usize,
    color: u8,
}

#[cfg(target_arch = "x86")]
impl VgaTextSink {
    const WIDTH: usize = 80;
    const HEIGHT: usize = 25;
    const BUFFER: *mut u16 = 0xB8000 as *mut u16;

    /// ライトグレー on ブラックのシンクを作成
    #[must_use]
    pub const fn new() -> Self {
        Self {
            column: 0,
            row: 0,
            color: 0x07,
        }
    }

    fn write_cell(&mut self, column: usize, row: usize, byte: u8) {
        let value = u16::from(byte) | (u16::from(self.color) << 8);
        // SAFETY: column/row は 80x25 の範囲内、バッファはアイデンティティ
        // マップ済みの VGA テキスト領域
        unsafe {
            Self::BUFFER.add(row * Self::WIDTH + column).write_volatile(value);
        }
    }

    fn scroll(&mut self) {
        for row in 1..Self::HEIGHT {
            for column in 0..Self::WIDTH {
                // SAFETY: 範囲内のセルコピー
                unsafe {
                    let value = Self::BUFFER.add(row * Self::WIDTH + column).read_volatile();
                    Self::BUFFER
                        .add((row - 1) * Self::WIDTH + column)
                        .write_volatile(value);
                }
            }
        }
        for column in 0..Self::WIDTH {
            self.write_cell(column, Self::HEIGHT - 1, b' ');
        }
        self.row = Self::HEIGHT - 1;
    }

    fn update_cursor(&mut self) {
        use crate::arch::x86::port::PortWriteOnly;
        let position = (self.row * Self::WIDTH + self.column) as u16;
        let mut index: PortWriteOnly<u8> = PortWriteOnly::new(0x3D4);
        let mut data: PortWriteOnly<u8> = PortWriteOnly::new(0x3D5);
        // SAFETY: VGA CRTC の標準的なカーソル設定手順
        unsafe {
            index.write(0x0F);
            data.write((position & 0xFF) as u8);
            index.write(0x0E);
            data.write((position >> 8) as u8);
        }
    }
}

#[cfg(target_arch = "x86")]
impl ConsoleSink for VgaTextSink {
    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.column = 0;
                self.row += 1;
            }
            0x08 => {
                // バックスペースは 1 セル戻して消す
                if self.column > 0 {
                    self.column -= 1;
                    self.write_cell(self.column, self.row, b' ');
                }
            }
            byte => {
                self.write_cell(self.column, self.row, byte);
                self.column += 1;
                if self.column >= Self::WIDTH {
                    self.column = 0;
                    self.row += 1;
                }
            }
        }
        if self.row >= Self::HEIGHT {
            self.scroll();
        }
        self.update_cursor();
    }
}

/// 出力を溜め込むだけのシンク（ホストテスト用）
#[cfg(not(target_arch = "x86"))]
pub struct CaptureSink {
    buffer: alloc::vec::Vec<u8>,
}

#[cfg(not(target_arch = "x86"))]
impl CaptureSink {
    /// 空のシンクを作成
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: alloc::vec::Vec::new(),
        }
    }
}

#[cfg(not(target_arch = "x86"))]
impl ConsoleSink for CaptureSink {
    fn put_byte(&mut self, byte: u8) {
        self.buffer.push(byte);
    }
}

/// ラインコンソール
pub struct Console {
    #[cfg(target_arch = "x86")]
    sink: VgaTextSink,
    #[cfg(not(target_arch = "x86"))]
    sink: CaptureSink,
}

impl Console {
    /// 既定のシンクでコンソールを作成
    #[must_use]
    pub const fn new() -> Self {
        #[cfg(target_arch = "x86")]
        {
            Self {
                sink: VgaTextSink::new(),
            }
        }
        #[cfg(not(target_arch = "x86"))]
        {
            Self {
                sink: CaptureSink::new(),
            }
        }
    }

    /// 1 バイト出力
    pub fn put_byte(&mut self, byte: u8) {
        self.sink.put_byte(byte);
    }

    /// 文字列出力
    pub fn put_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
    }

    /// 溜まった出力を取り出す（ホストテスト用）
    #[cfg(not(target_arch = "x86"))]
    pub fn take_output(&mut self) -> alloc::vec::Vec<u8> {
        core::mem::take(&mut self.sink.buffer)
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.put_str(s);
        Ok(())
    }
}

lazy_static! {
    /// グローバルコンソール
    pub static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

/// コンソールをキャラクタドライバとして公開するためのアダプタ
pub struct ConsoleDriver;

impl DriverOps for ConsoleDriver {
    fn open(&self, _minor: u32) -> KernelResult<()> {
        Ok(())
    }

    fn write(&self, _minor: u32, _pos: u32, buf: &[u8]) -> KernelResult<usize> {
        let mut console = CONSOLE.lock();
        for &byte in buf {
            console.put_byte(byte);
        }
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_sink_records_bytes() {
        let mut console = Console::new();
        console.put_str("ok\n");
        assert_eq!(console.take_output(), b"ok\n");
        assert!(console.take_output().is_empty());
    }
}
