// src/kernel/driver/serial.rs
//! シリアルポート (COM1)
//!
//! デバッグ専用の出力チャネル。`debug_print!` はここに出る。

use crate::arch::x86::port::Port;
use core::fmt;
use spin::Mutex;

/// COM1 のベースポート
const COM1_BASE: u16 = 0x3F8;

/// 16550 互換 UART
pub struct SerialPort {
    data: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    /// COM1 のドライバを作成
    #[must_use]
    pub const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            line_status: Port::new(base + 5),
        }
    }

    /// ボーレート 38400, 8N1 で初期化
    pub fn init(&mut self) {
        let mut int_enable: Port<u8> = Port::new(COM1_BASE + 1);
        let mut fifo: Port<u8> = Port::new(COM1_BASE + 2);
        let mut line_ctrl: Port<u8> = Port::new(COM1_BASE + 3);
        let mut modem_ctrl: Port<u8> = Port::new(COM1_BASE + 4);
        // SAFETY: COM1 の標準初期化手順
        unsafe {
            int_enable.write(0x00);
            line_ctrl.write(0x80); // DLAB
            self.data.write(0x03); // divisor low (38400)
            int_enable.write(0x00); // divisor high
            line_ctrl.write(0x03); // 8N1
            fifo.write(0xC7);
            modem_ctrl.write(0x0B);
        }
    }

    fn transmit_ready(&self) -> bool {
        // SAFETY: ライン状態レジスタの読み取り
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    /// 1 バイト送信
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(target_arch = "x86")]
        {
            let mut spins = 0u32;
            while !self.transmit_ready() {
                spins += 1;
                if spins > 100_000 {
                    return;
                }
            }
        }
        // SAFETY: データレジスタへの書き込み
        unsafe {
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// グローバル COM1 インスタンス
pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));
