// src/arch/x86/pic.rs
//! Programmable Interrupt Controller (8259 PIC)
//!
//! 割り込みコントローラの初期化と管理を行います。
//! 標準的なデュアル PIC 構成（Master/Slave）をサポートします。

use crate::arch::x86::port::{Port, PortWriteOnly};
use spin::Mutex;

/// Master PIC のコマンドポート
const PIC1_COMMAND: u16 = 0x20;
/// Master PIC のデータポート
const PIC1_DATA: u16 = 0x21;
/// Slave PIC のコマンドポート
const PIC2_COMMAND: u16 = 0xA0;
/// Slave PIC のデータポート
const PIC2_DATA: u16 = 0xA1;

/// 初期化コマンド (ICW1)
const ICW1_INIT: u8 = 0x11;
/// 8086/88 モード (ICW4)
const ICW4_8086: u8 = 0x01;
/// End of Interrupt (EOI) コマンド
const PIC_EOI: u8 = 0x20;

/// IRQ がリマップされるベクタオフセット（Master 側）
pub const IRQ_OFFSET: u8 = 32;
/// Slave 側のベクタオフセット
pub const IRQ_SLAVE_OFFSET: u8 = 40;

/// チェーン接続された PIC
pub struct ChainedPics {
    pics: [Pic; 2],
}

impl ChainedPics {
    /// 指定されたオフセットで新しい PIC チェーンを作成
    #[must_use]
    pub const fn new(offset1: u8, offset2: u8) -> Self {
        Self {
            pics: [
                Pic {
                    offset: offset1,
                    command: PortWriteOnly::new(PIC1_COMMAND),
                    data: PortWriteOnly::new(PIC1_DATA),
                },
                Pic {
                    offset: offset2,
                    command: PortWriteOnly::new(PIC2_COMMAND),
                    data: PortWriteOnly::new(PIC2_DATA),
                },
            ],
        }
    }

    /// PIC をリマップして初期化
    ///
    /// # Safety
    ///
    /// 一度だけ、他の PIC 操作より前に呼ぶこと。
    pub unsafe fn initialize(&mut self) {
        // SAFETY: 呼び出し元が PIC 初期化のタイミングを保証している
        unsafe {
            // 現在のマスクを保存
            let mask1_port: Port<u8> = Port::new(PIC1_DATA);
            let mask2_port: Port<u8> = Port::new(PIC2_DATA);
            let mask1 = mask1_port.read();
            let mask2 = mask2_port.read();

            // ICW1: 初期化開始
            self.pics[0].command.write(ICW1_INIT);
            self.pics[1].command.write(ICW1_INIT);

            // ICW2: ベクタオフセット設定 (IRQ 0-7 -> 32-39, IRQ 8-15 -> 40-47)
            self.pics[0].data.write(self.pics[0].offset);
            self.pics[1].data.write(self.pics[1].offset);

            // ICW3: Master/Slave 接続設定
            self.pics[0].data.write(4); // Master: Slave は IRQ2 に接続
            self.pics[1].data.write(2); // Slave: 自身のカスケード ID

            // ICW4: モード設定 (8086)
            self.pics[0].data.write(ICW4_8086);
            self.pics[1].data.write(ICW4_8086);

            // マスクを復元
            self.pics[0].data.write(mask1);
            self.pics[1].data.write(mask2);
        }
    }

    /// 割り込み終了を通知 (EOI)
    ///
    /// Slave 由来の割り込み（ベクタ >= 40）なら Slave へ先に送り、
    /// Master へは常に送る。
    ///
    /// # Safety
    ///
    /// 有効な割り込みコンテキスト内で、対応するベクタ番号で呼ぶこと。
    pub unsafe fn notify_end_of_interrupt(&mut self, vector: u8) {
        // SAFETY: 呼び出し元が適切な割り込みコンテキストであることを保証している
        unsafe {
            if self.pics[1].handles_interrupt(vector) {
                self.pics[1].end_of_interrupt();
            }
            self.pics[0].end_of_interrupt();
        }
    }

    /// 特定の IRQ のマスクを解除
    ///
    /// # Safety
    ///
    /// PIC が初期化された後に呼ぶこと。
    pub unsafe fn unmask_irq(&mut self, irq: u8) {
        // SAFETY: 呼び出し元が PIC マスク操作の安全性を保証している
        unsafe {
            let mut port: Port<u8>;
            if irq < 8 {
                port = Port::new(PIC1_DATA);
                let value = port.read();
                port.write(value & !(1 << irq));
            } else {
                port = Port::new(PIC2_DATA);
                let value = port.read();
                port.write(value & !(1 << (irq - 8)));
            }
        }
    }
}

struct Pic {
    offset: u8,
    command: PortWriteOnly<u8>,
    data: PortWriteOnly<u8>,
}

impl Pic {
    const fn handles_interrupt(&self, vector: u8) -> bool {
        self.offset <= vector && vector < self.offset + 8
    }

    unsafe fn end_of_interrupt(&mut self) {
        // SAFETY: 呼び出し元が EOI 送信の安全性を保証している
        unsafe {
            self.command.write(PIC_EOI);
        }
    }
}

// グローバル PIC インスタンス
// Master: 32 (0x20), Slave: 40 (0x28)
pub static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new(IRQ_OFFSET, IRQ_SLAVE_OFFSET));
