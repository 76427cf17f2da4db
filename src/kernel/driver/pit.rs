// src/kernel/driver/pit.rs
//! Programmable Interval Timer
//!
//! PIT を 100 Hz に設定し、IRQ 0 でティックカウンタを進めます。
//! 一定ティックごとにトラップ出口での再スケジュールを要求します。

use crate::kernel::trap::{RegisterFrame, NEED_RESCHED};
use core::sync::atomic::{AtomicU32, Ordering};

/// PIT のベース周波数 (Hz)
#[cfg(target_arch = "x86")]
const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// タイマ周波数 (100 Hz = 10ms/tick)
pub const TIMER_HZ: u32 = 100;

/// タイムスライス長（ティック数）
const TIME_SLICE_TICKS: u32 = 5;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// 起動からのティック数
#[must_use]
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// 起動からのミリ秒
#[must_use]
pub fn uptime_ms() -> u32 {
    ticks().wrapping_mul(1000 / TIMER_HZ)
}

/// 起動からの秒
#[must_use]
pub fn uptime_seconds() -> u32 {
    uptime_ms() / 1000
}

/// IRQ 0 ハンドラ
pub fn irq_handler(_frame: &mut RegisterFrame) {
    let tick = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if tick % TIME_SLICE_TICKS == 0 {
        NEED_RESCHED.store(true, Ordering::Release);
    }
}

/// テストからティックを進める
#[cfg(not(target_arch = "x86"))]
pub fn advance_ticks(count: u32) {
    TICKS.fetch_add(count, Ordering::Relaxed);
}

/// PIT をレートジェネレータモードで設定する
#[cfg(target_arch = "x86")]
pub fn init() {
    use crate::arch::x86::port::PortWriteOnly;

    let divisor = PIT_BASE_FREQUENCY / TIMER_HZ;
    let mut command: PortWriteOnly<u8> = PortWriteOnly::new(0x43);
    let mut channel0: PortWriteOnly<u8> = PortWriteOnly::new(0x40);
    // SAFETY: PC/AT 互換機の標準タイマー設定手順。
    // Channel 0, lo/hi アクセス, モード 3 (矩形波) = 0x36
    unsafe {
        command.write(0x36);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    crate::debug_println!("[PIT] timer at {} Hz", TIMER_HZ);
}

/// 指定ミリ秒だけ停止する
///
/// 終了ティックを先に計算し、早すぎる起床はループで再チェックする。
pub fn sleep_ms(ms: u32) {
    let end = ticks().wrapping_add(ms.div_ceil(1000 / TIMER_HZ));
    while (ticks() as i32).wrapping_sub(end as i32) < 0 {
        #[cfg(target_arch = "x86")]
        {
            use crate::arch::{ArchCpu, Cpu};
            // 割り込み休止はここが中断点 (sti; hlt)
            ArchCpu::enable_interrupts();
            ArchCpu::halt();
        }
        #[cfg(not(target_arch = "x86"))]
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_accounting() {
        let start = ticks();
        let mut frame = RegisterFrame::zeroed();
        for _ in 0..10 {
            irq_handler(&mut frame);
        }
        assert_eq!(ticks() - start, 10);
        assert!(uptime_ms() >= (ticks() - 10) * 10);
    }
}
