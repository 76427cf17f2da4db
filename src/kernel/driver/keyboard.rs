// src/kernel/driver/keyboard.rs
//! PS/2 キーボード
//!
//! IRQ 1 でスキャンコードを読み、デコードした文字をリングバッファに
//! 積みます。バッファからの取り出しは FIFO。`read_line` は改行まで
//! ブロックし、入力をコンソールへエコーします。

#[cfg(target_arch = "x86")]
use crate::arch::{ArchCpu, Cpu};
use crate::kernel::core::KernelResult;
use crate::kernel::driver::console::CONSOLE;
use crate::kernel::driver::DriverOps;
use crate::kernel::trap::RegisterFrame;
use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

/// キーボードデータポート
#[cfg(target_arch = "x86")]
const KEYBOARD_DATA_PORT: u16 = 0x60;

/// 入力リングバッファの容量
const BUFFER_SIZE: usize = 256;

/// 固定長リングバッファ
///
/// IRQ 側が push、プロセス側が pop する。満杯時は入力を捨てる。
pub struct InputBuffer {
    buffer: [u8; BUFFER_SIZE],
    read_pos: usize,
    write_pos: usize,
}

impl InputBuffer {
    const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        let next = (self.write_pos + 1) % BUFFER_SIZE;
        if next == self.read_pos {
            // バッファ満杯
            return;
        }
        self.buffer[self.write_pos] = byte;
        self.write_pos = next;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.read_pos == self.write_pos {
            return None;
        }
        let byte = self.buffer[self.read_pos];
        self.read_pos = (self.read_pos + 1) % BUFFER_SIZE;
        Some(byte)
    }
}

static INPUT: Mutex<InputBuffer> = Mutex::new(InputBuffer::new());

lazy_static! {
    static ref DECODER: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(
        Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore)
    );
}

/// スキャンコードを 1 つ処理してバッファに積む
pub fn push_scancode(scancode: u8) {
    let mut decoder = DECODER.lock();
    if let Ok(Some(event)) = decoder.add_byte(scancode) {
        if let Some(DecodedKey::Unicode(character)) = decoder.process_keyevent(event) {
            if character.is_ascii() {
                INPUT.lock().push(character as u8);
            }
        }
    }
}

/// バッファから 1 文字取り出す（ノンブロッキング）
pub fn pop_char() -> Option<u8> {
    INPUT.lock().pop()
}

/// テスト・コンソール統合用に文字列を直接積む
#[cfg(not(target_arch = "x86"))]
pub fn feed_input(text: &str) {
    let mut input = INPUT.lock();
    for byte in text.bytes() {
        input.push(byte);
    }
}

/// 改行まで 1 行読む
///
/// 読めた文字はコンソールにエコーされ、バックスペースは行内編集として
/// 扱う。改行を含むバイト数を返す。入力が尽きている間は割り込みを
/// 待って停止する。
pub fn read_line(buf: &mut [u8]) -> usize {
    let mut len = 0usize;
    loop {
        let byte = match pop_char() {
            Some(byte) => byte,
            None => {
                // 実機では割り込みを待つ。ホストテストでは入力が尽きたら
                // その時点の行を返す。
                #[cfg(target_arch = "x86")]
                {
                    ArchCpu::enable_interrupts();
                    ArchCpu::halt();
                    continue;
                }
                #[cfg(not(target_arch = "x86"))]
                return len;
            }
        };

        match byte {
            0x08 | 0x7F => {
                if len > 0 {
                    len -= 1;
                    let mut console = CONSOLE.lock();
                    console.put_byte(0x08);
                }
            }
            b'\n' => {
                CONSOLE.lock().put_byte(b'\n');
                if len < buf.len() {
                    buf[len] = b'\n';
                    len += 1;
                }
                return len;
            }
            byte => {
                if len + 1 < buf.len() {
                    buf[len] = byte;
                    len += 1;
                    CONSOLE.lock().put_byte(byte);
                }
            }
        }
    }
}

/// IRQ 1 ハンドラ
pub fn irq_handler(_frame: &mut RegisterFrame) {
    #[cfg(target_arch = "x86")]
    {
        use crate::arch::x86::port::PortReadOnly;
        let data: PortReadOnly<u8> = PortReadOnly::new(KEYBOARD_DATA_PORT);
        // SAFETY: キーボードデータポートの読み取り
        let scancode = unsafe { data.read() };
        push_scancode(scancode);
    }
}

/// キーボードをキャラクタドライバとして公開するためのアダプタ
///
/// read は 1 行単位で返す。
pub struct KeyboardDriver;

impl DriverOps for KeyboardDriver {
    fn open(&self, _minor: u32) -> KernelResult<()> {
        Ok(())
    }

    fn read(&self, _minor: u32, _pos: u32, buf: &mut [u8]) -> KernelResult<usize> {
        Ok(read_line(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_fifo() {
        let mut ring = InputBuffer::new();
        ring.push(b'a');
        ring.push(b'b');
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.pop(), Some(b'b'));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_buffer_drops_when_full() {
        let mut ring = InputBuffer::new();
        for i in 0..(BUFFER_SIZE + 10) {
            ring.push((i % 256) as u8);
        }
        let mut count = 0;
        while ring.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, BUFFER_SIZE - 1);
    }

    // グローバルの入力バッファとコンソールを使うので 1 テストにまとめる
    #[test]
    fn decode_then_line_read_with_echo() {
        // ScancodeSet1: 0x1E = 'a' press, 0x9E = release
        push_scancode(0x1E);
        push_scancode(0x9E);
        assert_eq!(pop_char(), Some(b'a'));
        assert_eq!(pop_char(), None);

        // 行読み: 改行込みのバイト数が返り、コンソールにエコーされる
        CONSOLE.lock().take_output();
        feed_input("hi\n");
        let mut buf = [0u8; 16];
        let n = read_line(&mut buf);
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"hi\n");
        assert_eq!(CONSOLE.lock().take_output(), b"hi\n");

        // バックスペースは行内編集
        feed_input("ab\x08c\n");
        let n = read_line(&mut buf);
        assert_eq!(&buf[..n], b"ac\n");
    }
}
