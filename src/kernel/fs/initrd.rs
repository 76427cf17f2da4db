// src/kernel/fs/initrd.rs
//! Initrd (CPIO-newc)
//!
//! ブートローダが積んだアーカイブをブート時に一度だけ走査し、各エントリを
//! 通常ファイルの VFS ノードとして公開します。ファイルデータはアーカイブ
//! バッファ内をそのまま指すため読み取りはゼロコピーで、バッファはカーネル
//! の生存期間中有効です。書き込みはありません。

use crate::debug_println;
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::fs::vfs::Filesystem;
use crate::kernel::fs::{NodeKind, NodeOps, NodeRef, VfsNode};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// newc 形式のマジック
const CPIO_MAGIC: &[u8; 6] = b"070701";
/// newc ヘッダ長
const HEADER_LEN: usize = 110;
/// ルートノードのハンドル値
const ROOT_HANDLE: u32 = u32::MAX;

/// アーカイブ中の 1 エントリ
#[derive(Debug, Clone, Copy)]
pub struct CpioEntry<'a> {
    /// エントリ名（先頭の `./` は剥がされる）
    pub name: &'a str,
    /// ファイル内容
    pub data: &'a [u8],
}

/// 8 桁の 16 進テキストフィールドを読む
fn parse_hex(field: &[u8]) -> u32 {
    let mut value = 0u32;
    for &c in field {
        value <<= 4;
        value += match c {
            b'0'..=b'9' => u32::from(c - b'0'),
            b'a'..=b'f' => u32::from(c - b'a') + 10,
            b'A'..=b'F' => u32::from(c - b'A') + 10,
            _ => 0,
        };
    }
    value
}

/// CPIO-newc アーカイブを走査してエントリ列を返す
///
/// `.` と `TRAILER!!!` は飛ばす。ヘッダ+名前とデータはそれぞれ 4 バイト
/// 境界に整列している。マジックが合わない位置に来たら走査を打ち切る。
pub fn parse_cpio(archive: &[u8]) -> Vec<CpioEntry<'_>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + HEADER_LEN <= archive.len() {
        let header = &archive[pos..pos + HEADER_LEN];
        if &header[..6] != CPIO_MAGIC {
            break;
        }

        let filesize = parse_hex(&header[54..62]) as usize;
        let namesize = parse_hex(&header[94..102]) as usize;

        let name_start = pos + HEADER_LEN;
        if name_start + namesize > archive.len() {
            break;
        }
        // namesize は NUL を含む
        let name_bytes = &archive[name_start..name_start + namesize.saturating_sub(1)];
        let Ok(name) = core::str::from_utf8(name_bytes) else {
            break;
        };

        let header_total = (HEADER_LEN + namesize + 3) & !3;
        let data_total = (filesize + 3) & !3;

        if name == "TRAILER!!!" {
            break;
        }

        let data_start = pos + header_total;
        if data_start + filesize > archive.len() {
            break;
        }

        // "." と "./" だけのエントリは登録しない
        let stripped = name.strip_prefix("./").unwrap_or(name);
        if !stripped.is_empty() && stripped != "." {
            entries.push(CpioEntry {
                name: stripped,
                data: &archive[data_start..data_start + filesize],
            });
        }

        pos += header_total + data_total;
    }

    entries
}

struct InitrdFile {
    name: String,
    data: &'static [u8],
}

/// initrd ファイルシステム
///
/// ルートディレクトリ 1 つと、その直下の通常ファイルノード群。
pub struct InitrdFs {
    files: Vec<InitrdFile>,
    nodes: Mutex<Vec<NodeRef>>,
    root: Mutex<Option<NodeRef>>,
}

impl InitrdFs {
    /// アーカイブからファイルシステムを構築する
    pub fn new(archive: &'static [u8]) -> Arc<Self> {
        let entries = parse_cpio(archive);
        debug_println!("[INITRD] {} files in archive", entries.len());

        let fs = Arc::new(Self {
            files: entries
                .iter()
                .map(|e| InitrdFile {
                    name: e.name.to_string(),
                    data: e.data,
                })
                .collect(),
            nodes: Mutex::new(Vec::new()),
            root: Mutex::new(None),
        });

        let nodes = fs
            .files
            .iter()
            .enumerate()
            .map(|(i, file)| {
                Arc::new(VfsNode::new(
                    file.name.clone(),
                    NodeKind::Regular,
                    file.data.len() as u32,
                    i as u32,
                    i as u32,
                    fs.clone() as Arc<dyn NodeOps>,
                ))
            })
            .collect();
        *fs.nodes.lock() = nodes;

        *fs.root.lock() = Some(Arc::new(VfsNode::new(
            String::from("initrd"),
            NodeKind::Directory,
            0,
            0,
            ROOT_HANDLE,
            fs.clone() as Arc<dyn NodeOps>,
        )));
        fs
    }

    /// ルートノード
    #[must_use]
    pub fn root(&self) -> NodeRef {
        self.root.lock().clone().expect("initrd root missing")
    }

    /// ファイル数
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl NodeOps for InitrdFs {
    fn read(&self, node: &VfsNode, offset: u32, buf: &mut [u8]) -> KernelResult<usize> {
        let file = self
            .files
            .get(node.handle as usize)
            .ok_or(KernelError::new(ErrorKind::InvalidArgument))?;
        let offset = offset as usize;
        if offset >= file.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.data.len() - offset);
        buf[..n].copy_from_slice(&file.data[offset..offset + n]);
        Ok(n)
    }

    fn readdir(&self, node: &VfsNode, index: u32) -> KernelResult<Option<NodeRef>> {
        if node.handle != ROOT_HANDLE {
            return Err(KernelError::new(ErrorKind::Unsupported));
        }
        Ok(self.nodes.lock().get(index as usize).cloned())
    }

    fn finddir(&self, node: &VfsNode, name: &str) -> KernelResult<Option<NodeRef>> {
        if node.handle != ROOT_HANDLE {
            return Err(KernelError::new(ErrorKind::Unsupported));
        }
        Ok(self.nodes.lock().iter().find(|n| n.name == name).cloned())
    }
}

impl Filesystem for InitrdFs {
    fn fstype(&self) -> &str {
        "initrd"
    }

    fn mount(&self, _source: &str) -> KernelResult<NodeRef> {
        Ok(self.root())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! テスト用に newc アーカイブを組み立てるヘルパ

    use alloc::vec::Vec;

    fn push_hex(out: &mut Vec<u8>, value: u32) {
        for shift in (0..8).rev() {
            let nibble = (value >> (shift * 4)) & 0xF;
            out.push(b"0123456789abcdef"[nibble as usize]);
        }
    }

    fn push_entry(out: &mut Vec<u8>, name: &str, data: &[u8]) {
        out.extend_from_slice(b"070701");
        // ino, mode, uid, gid, nlink, mtime
        for _ in 0..6 {
            push_hex(out, 0);
        }
        push_hex(out, data.len() as u32); // filesize
        // devmajor, devminor, rdevmajor, rdevminor
        for _ in 0..4 {
            push_hex(out, 0);
        }
        push_hex(out, name.len() as u32 + 1); // namesize (NUL 込み)
        push_hex(out, 0); // check
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    /// (名前, 内容) の列から newc アーカイブを作る
    pub fn build_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        push_entry(&mut out, ".", b"");
        for (name, data) in files {
            push_entry(&mut out, name, data);
        }
        push_entry(&mut out, "TRAILER!!!", b"");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_archive;
    use super::*;

    fn leak(archive: Vec<u8>) -> &'static [u8] {
        archive.leak()
    }

    #[test]
    fn parse_skips_dot_and_trailer() {
        let archive = leak(build_archive(&[
            ("hello.txt", b"hi\n" as &[u8]),
            ("bin/prog", b"\x7fELF junk" as &[u8]),
        ]));
        let entries = parse_cpio(archive);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "hello.txt");
        assert_eq!(entries[0].data, b"hi\n");
        assert_eq!(entries[1].name, "bin/prog");
    }

    #[test]
    fn parse_strips_leading_dot_slash() {
        let archive = leak(build_archive(&[("./nested.txt", b"x" as &[u8])]));
        let entries = parse_cpio(archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "nested.txt");
    }

    #[test]
    fn parse_stops_on_bad_magic() {
        let mut archive = build_archive(&[("a", b"1" as &[u8])]);
        archive[0] = b'9';
        let entries = parse_cpio(leak(archive));
        assert!(entries.is_empty());
    }

    #[test]
    fn nodes_serve_zero_copy_reads() {
        let archive = leak(build_archive(&[("hello.txt", b"hi\n" as &[u8])]));
        let fs = InitrdFs::new(archive);
        assert_eq!(fs.file_count(), 1);

        let root = fs.root();
        let node = root.finddir("hello.txt").unwrap().unwrap();
        assert_eq!(node.kind, NodeKind::Regular);
        assert_eq!(node.length, 3);

        let mut buf = [0u8; 16];
        assert_eq!(node.read(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
        // 終端以降は 0
        assert_eq!(node.read(3, &mut buf).unwrap(), 0);
        // 部分読み
        assert_eq!(node.read(1, &mut buf[..1]).unwrap(), 1);
        assert_eq!(buf[0], b'i');
    }

    #[test]
    fn root_readdir_enumerates_files() {
        let archive = leak(build_archive(&[
            ("a", b"1" as &[u8]),
            ("b", b"22" as &[u8]),
        ]));
        let fs = InitrdFs::new(archive);
        let root = fs.root();
        assert_eq!(root.readdir(0).unwrap().unwrap().name, "a");
        assert_eq!(root.readdir(1).unwrap().unwrap().name, "b");
        assert!(root.readdir(2).unwrap().is_none());
        // ファイルノードに readdir は無い
        let a = root.finddir("a").unwrap().unwrap();
        assert!(a.readdir(0).is_err());
    }
}
