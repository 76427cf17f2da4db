// tests/initrd_vfs.rs
//! initrd を root にした VFS のエンドツーエンドシナリオ

use ember_os::kernel::core::KernelResult;
use ember_os::kernel::fs::initrd::InitrdFs;
use ember_os::kernel::fs::vfs::{self, Filesystem};
use ember_os::kernel::fs::{
    Dirent, FdTable, NodeKind, NodeOps, NodeRef, OpenFlags, Stat, VfsNode,
};
use spin::Mutex;
use std::sync::Arc;

// マウントテーブルはグローバルなのでテストを直列化する
static TEST_LOCK: Mutex<()> = Mutex::new(());

// ---- newc アーカイブの組み立て ----

fn push_hex(out: &mut Vec<u8>, value: u32) {
    for shift in (0..8).rev() {
        let nibble = (value >> (shift * 4)) & 0xF;
        out.push(b"0123456789abcdef"[nibble as usize]);
    }
}

fn push_entry(out: &mut Vec<u8>, name: &str, data: &[u8]) {
    out.extend_from_slice(b"070701");
    for _ in 0..6 {
        push_hex(out, 0);
    }
    push_hex(out, data.len() as u32);
    for _ in 0..4 {
        push_hex(out, 0);
    }
    push_hex(out, name.len() as u32 + 1);
    push_hex(out, 0);
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

fn build_archive(files: &[(&str, &[u8])]) -> &'static [u8] {
    let mut out = Vec::new();
    push_entry(&mut out, ".", b"");
    for (name, data) in files {
        push_entry(&mut out, name, data);
    }
    push_entry(&mut out, "TRAILER!!!", b"");
    out.leak()
}

// ---- /mnt 用の小さなメモリ内 fs ----

struct MntFs {
    node: Mutex<Option<NodeRef>>,
    root: Mutex<Option<NodeRef>>,
}

impl MntFs {
    fn new() -> Arc<Self> {
        let fs = Arc::new(Self {
            node: Mutex::new(None),
            root: Mutex::new(None),
        });
        *fs.node.lock() = Some(Arc::new(VfsNode::new(
            "file".into(),
            NodeKind::Regular,
            12,
            1,
            0,
            fs.clone() as Arc<dyn NodeOps>,
        )));
        *fs.root.lock() = Some(Arc::new(VfsNode::new(
            "/".into(),
            NodeKind::Directory,
            0,
            0,
            u32::MAX,
            fs.clone() as Arc<dyn NodeOps>,
        )));
        fs
    }
}

impl NodeOps for MntFs {
    fn read(&self, _node: &VfsNode, offset: u32, buf: &mut [u8]) -> KernelResult<usize> {
        let data = b"mnt contents";
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn finddir(&self, node: &VfsNode, name: &str) -> KernelResult<Option<NodeRef>> {
        if node.handle != u32::MAX {
            return Ok(None);
        }
        if name == "file" {
            Ok(self.node.lock().clone())
        } else {
            Ok(None)
        }
    }

    fn readdir(&self, node: &VfsNode, index: u32) -> KernelResult<Option<NodeRef>> {
        if node.handle != u32::MAX || index > 0 {
            return Ok(None);
        }
        Ok(self.node.lock().clone())
    }
}

impl Filesystem for MntFs {
    fn fstype(&self) -> &str {
        "mntfs"
    }

    fn mount(&self, _source: &str) -> KernelResult<NodeRef> {
        Ok(self.root.lock().clone().unwrap())
    }
}

fn mount_fresh_root() {
    vfs::clear_mounts();
    let archive = build_archive(&[
        ("hello.txt", b"hi\n" as &[u8]),
        ("bin/init", b"\x7fELF not really" as &[u8]),
    ]);
    let fs = InitrdFs::new(archive);
    vfs::register_filesystem(fs);
    vfs::mount("initrd0", "/", "initrd").unwrap();
}

#[test]
fn boot_and_read_hello() {
    let _guard = TEST_LOCK.lock();
    mount_fresh_root();
    let mut fds = FdTable::new();

    let fd = vfs::open(&mut fds, "/hello.txt", OpenFlags::RDONLY).unwrap();
    assert!(fd >= 3);

    let mut buf = [0u8; 16];
    assert_eq!(vfs::read(&mut fds, fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"hi\n");
    assert_eq!(vfs::read(&mut fds, fd, &mut buf).unwrap(), 0);
    vfs::close(&mut fds, fd).unwrap();
}

#[test]
fn longest_prefix_mount_shadows_root() {
    let _guard = TEST_LOCK.lock();
    mount_fresh_root();
    let mut fds = FdTable::new();

    // `/` しかマウントされていなければ /mnt/file は -1 相当
    assert!(vfs::open(&mut fds, "/mnt/file", OpenFlags::RDONLY).is_err());

    vfs::register_filesystem(MntFs::new());
    vfs::mount("mem0", "/mnt", "mntfs").unwrap();

    let fd = vfs::open(&mut fds, "/mnt/file", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 32];
    let n = vfs::read(&mut fds, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"mnt contents");
    vfs::close(&mut fds, fd).unwrap();

    vfs::unmount("/mnt").unwrap();
    assert!(vfs::open(&mut fds, "/mnt/file", OpenFlags::RDONLY).is_err());
}

#[test]
fn readdir_and_stat_via_descriptors() {
    let _guard = TEST_LOCK.lock();
    mount_fresh_root();
    let mut fds = FdTable::new();

    let fd = vfs::open(&mut fds, "/", OpenFlags::RDONLY).unwrap();
    let mut entry = Dirent::zeroed();
    let mut names = Vec::new();
    while vfs::readdir(&mut fds, fd, &mut entry).unwrap() == 1 {
        names.push(entry.name_str().to_string());
    }
    assert_eq!(names, ["hello.txt", "bin/init"]);
    vfs::close(&mut fds, fd).unwrap();

    let mut st = Stat::default();
    vfs::stat("/hello.txt", &mut st).unwrap();
    assert_eq!(st.mode, 0x8000);
    assert_eq!(st.size, 3);

    vfs::stat("/", &mut st).unwrap();
    assert_eq!(st.mode, 0x4000);
}

#[test]
fn descriptor_table_exhaustion_is_reported() {
    let _guard = TEST_LOCK.lock();
    mount_fresh_root();
    let mut fds = FdTable::new();

    let mut opened = Vec::new();
    loop {
        match vfs::open(&mut fds, "/hello.txt", OpenFlags::RDONLY) {
            Ok(fd) => opened.push(fd),
            Err(_) => break,
        }
    }
    // 0/1/2 は予約なので MAX_FDS - 3 個で尽きる
    assert_eq!(opened.len(), ember_os::kernel::fs::MAX_FDS - 3);
    for fd in opened {
        vfs::close(&mut fds, fd).unwrap();
    }
}
