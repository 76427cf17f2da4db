// src/kernel/loader.rs
//! Executable loader (ELF32)
//!
//! ヘッダ検証と LOAD セグメント収集は純粋関数 [`parse`] で行い、
//! アドレス空間への展開は [`load_image`] が別段で行います。
//! 検証項目: マジック、32-bit クラス、リトルエンディアン、実行形式、
//! x86 アーキテクチャ。

use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::{
    AddressSpace, FrameAllocator, PageFlags, VirtAddr, PAGE_SIZE, USER_BASE, USER_LOAD_BASE,
};
use alloc::vec::Vec;

/// ELF マジック
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// 32-bit クラス
const ELFCLASS32: u8 = 1;
/// リトルエンディアン
const ELFDATA2LSB: u8 = 1;
/// 実行形式
const ET_EXEC: u16 = 2;
/// x86
const EM_386: u16 = 3;
/// ロード対象セグメント
const PT_LOAD: u32 = 1;

/// ELF ヘッダ長
const EHDR_LEN: usize = 52;
/// プログラムヘッダ長
const PHDR_LEN: usize = 32;

/// LOAD セグメント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// ロード先仮想アドレス
    pub vaddr: u32,
    /// ファイル内オフセット
    pub offset: u32,
    /// ファイル上のバイト数
    pub filesz: u32,
    /// メモリ上のバイト数 (超過分は BSS としてゼロ)
    pub memsz: u32,
    /// セグメントフラグ
    pub flags: u32,
}

/// 検証済み実行イメージ
#[derive(Debug, Clone)]
pub struct Image {
    /// エントリポイント
    pub entry: u32,
    /// LOAD セグメント列
    pub segments: Vec<Segment>,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Validate the bytes and extract the entry point and LOAD segments
pub fn parse(bytes: &[u8]) -> KernelResult<Image> {
    if bytes.len() < EHDR_LEN {
        return Err(KernelError::with_context(ErrorKind::Corrupt, "short header"));
    }
    if bytes[..4] != ELF_MAGIC {
        return Err(KernelError::with_context(ErrorKind::Corrupt, "bad magic"));
    }
    if bytes[4] != ELFCLASS32 {
        return Err(KernelError::with_context(ErrorKind::Corrupt, "not 32-bit"));
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(KernelError::with_context(
            ErrorKind::Corrupt,
            "not little-endian",
        ));
    }
    if read_u16(bytes, 16) != ET_EXEC {
        return Err(KernelError::with_context(
            ErrorKind::Corrupt,
            "not an executable",
        ));
    }
    if read_u16(bytes, 18) != EM_386 {
        return Err(KernelError::with_context(ErrorKind::Corrupt, "not x86"));
    }

    let entry = read_u32(bytes, 24);
    let phoff = read_u32(bytes, 28) as usize;
    let phentsize = read_u16(bytes, 42) as usize;
    let phnum = read_u16(bytes, 44) as usize;

    if phentsize < PHDR_LEN {
        return Err(KernelError::with_context(
            ErrorKind::Corrupt,
            "bad phentsize",
        ));
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        if base + PHDR_LEN > bytes.len() {
            return Err(KernelError::with_context(
                ErrorKind::Corrupt,
                "program header out of range",
            ));
        }
        if read_u32(bytes, base) != PT_LOAD {
            continue;
        }
        let segment = Segment {
            offset: read_u32(bytes, base + 4),
            vaddr: read_u32(bytes, base + 8),
            filesz: read_u32(bytes, base + 16),
            memsz: read_u32(bytes, base + 20),
            flags: read_u32(bytes, base + 24),
        };
        if segment.memsz < segment.filesz {
            return Err(KernelError::with_context(ErrorKind::Corrupt, "memsz < filesz"));
        }
        let end = segment.offset as usize + segment.filesz as usize;
        if end > bytes.len() {
            return Err(KernelError::with_context(
                ErrorKind::Corrupt,
                "segment data out of range",
            ));
        }
        segments.push(segment);
    }

    Ok(Image { entry, segments })
}

/// Map the image into an address space and return its entry point
///
/// Images whose declared addresses fall outside the user range are
/// shifted wholesale to the default user load base. Every page is
/// zeroed when it is first mapped and the file contents are written on
/// top, so the `memsz - filesz` BSS tail ends up zero.
pub fn load_image(
    bytes: &[u8],
    space: &mut AddressSpace,
    frames: &mut FrameAllocator,
) -> KernelResult<u32> {
    let image = parse(bytes)?;
    if image.segments.is_empty() {
        return Err(KernelError::with_context(ErrorKind::Corrupt, "no segments"));
    }

    let min_vaddr = image
        .segments
        .iter()
        .map(|s| s.vaddr)
        .min()
        .unwrap_or(USER_LOAD_BASE);
    let delta = if min_vaddr < USER_BASE {
        USER_LOAD_BASE.wrapping_sub(min_vaddr)
    } else {
        0
    };

    for segment in &image.segments {
        let start = segment.vaddr.wrapping_add(delta);
        let end = start
            .checked_add(segment.memsz)
            .ok_or(KernelError::with_context(
                ErrorKind::Corrupt,
                "segment wraps address space",
            ))?;

        let mut page = start & !(PAGE_SIZE as u32 - 1);
        while page < end {
            if space.translate(VirtAddr::new(page)).is_null() {
                let frame = frames.alloc();
                if frame.is_null() {
                    return Err(KernelError::with_context(ErrorKind::Exhausted, "load frame"));
                }
                space.map(
                    frames,
                    VirtAddr::new(page),
                    frame,
                    PageFlags::WRITABLE | PageFlags::USER,
                )?;
                space.zero_range(VirtAddr::new(page), PAGE_SIZE)?;
            }
            page = page.wrapping_add(PAGE_SIZE as u32);
            if page == 0 {
                break;
            }
        }

        let data = &bytes[segment.offset as usize..(segment.offset + segment.filesz) as usize];
        space.write_bytes(VirtAddr::new(start), data)?;
    }

    Ok(image.entry.wrapping_add(delta))
}

/// Assembles minimal ELF images for tests
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a single-segment executable image
    pub fn build_elf(entry: u32, vaddr: u32, code: &[u8], memsz: u32) -> Vec<u8> {
        let mut out = alloc::vec![0u8; EHDR_LEN + PHDR_LEN];
        out[..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_386.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        out[24..28].copy_from_slice(&entry.to_le_bytes());
        out[28..32].copy_from_slice(&(EHDR_LEN as u32).to_le_bytes()); // e_phoff
        out[42..44].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes());
        out[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let data_offset = out.len() as u32;
        let ph = EHDR_LEN;
        out[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        out[ph + 4..ph + 8].copy_from_slice(&data_offset.to_le_bytes());
        out[ph + 8..ph + 12].copy_from_slice(&vaddr.to_le_bytes());
        out[ph + 16..ph + 20].copy_from_slice(&(code.len() as u32).to_le_bytes());
        out[ph + 20..ph + 24].copy_from_slice(&memsz.to_le_bytes());
        out[ph + 24..ph + 28].copy_from_slice(&5u32.to_le_bytes()); // R+X

        out.extend_from_slice(code);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_elf;
    use super::*;
    use crate::kernel::mm::test_support::phys_arena;
    use crate::kernel::mm::types::phys_to_ptr;

    #[test]
    fn parse_accepts_minimal_image() {
        let elf = build_elf(0x8004_8000, 0x8004_8000, b"\xCC\xCC", 2);
        let image = parse(&elf).unwrap();
        assert_eq!(image.entry, 0x8004_8000);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].filesz, 2);
    }

    #[test]
    fn parse_rejects_bad_headers() {
        let good = build_elf(0x8004_8000, 0x8004_8000, b"x", 1);

        let mut bad = good.clone();
        bad[0] = 0;
        assert!(parse(&bad).is_err());

        let mut bad = good.clone();
        bad[4] = 2; // 64-bit
        assert!(parse(&bad).is_err());

        let mut bad = good.clone();
        bad[5] = 2; // big endian
        assert!(parse(&bad).is_err());

        let mut bad = good.clone();
        bad[16] = 1; // ET_REL
        assert!(parse(&bad).is_err());

        let mut bad = good.clone();
        bad[18] = 0x3E; // x86-64
        assert!(parse(&bad).is_err());

        assert!(parse(&good[..20]).is_err());
    }

    #[test]
    fn load_copies_code_and_zeroes_bss() {
        let mut frames = phys_arena(64);
        let mut space = AddressSpace::create(&mut frames).unwrap();

        let code = b"program text";
        let elf = build_elf(0x8004_8000, 0x8004_8000, code, code.len() as u32 + 64);
        let entry = load_image(&elf, &mut space, &mut frames).unwrap();
        assert_eq!(entry, 0x8004_8000);

        let pa = space.translate(VirtAddr::new(0x8004_8000));
        assert!(!pa.is_null());
        // SAFETY: マップ済みフレーム
        let loaded = unsafe { core::slice::from_raw_parts(phys_to_ptr(pa), code.len() + 64) };
        assert_eq!(&loaded[..code.len()], code);
        assert!(loaded[code.len()..].iter().all(|&b| b == 0));

        space.destroy(&mut frames);
    }

    #[test]
    fn load_rebases_low_images_into_user_range() {
        let mut frames = phys_arena(64);
        let mut space = AddressSpace::create(&mut frames).unwrap();

        let elf = build_elf(0x1000, 0x1000, b"low image", 9);
        let entry = load_image(&elf, &mut space, &mut frames).unwrap();
        assert_eq!(entry, USER_LOAD_BASE);
        assert!(!space.translate(VirtAddr::new(USER_LOAD_BASE)).is_null());

        space.destroy(&mut frames);
    }
}
