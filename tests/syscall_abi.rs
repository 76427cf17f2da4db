// tests/syscall_abi.rs
//! syscall 番号テーブルとエラー規約の検査

use ember_os::kernel::syscall::{dispatch, Syscall};
use ember_os::kernel::trap::RegisterFrame;

fn call(number: u32, a1: u32, a2: u32, a3: u32) -> i32 {
    let mut frame = RegisterFrame::zeroed();
    frame.eax = number;
    frame.ebx = a1;
    frame.ecx = a2;
    frame.edx = a3;
    dispatch(&mut frame);
    frame.eax as i32
}

#[test]
fn every_defined_number_resolves() {
    for number in 0..=26u32 {
        assert!(
            Syscall::from_number(number).is_some(),
            "syscall {number} missing"
        );
    }
}

#[test]
fn undefined_numbers_fail_with_minus_one() {
    for number in [27u32, 100, 0x80, u32::MAX] {
        assert!(Syscall::from_number(number).is_none());
        assert_eq!(call(number, 1, 2, 3), -1);
    }
}

#[test]
fn null_pointer_arguments_fail_with_minus_one() {
    assert_eq!(call(3, 0, 0, 0), -1); // open
    assert_eq!(call(6, 0, 0, 0), -1); // stat
    assert_eq!(call(9, 0, 0, 0), -1); // exec
    assert_eq!(call(13, 0, 0, 0), -1); // gettime
    assert_eq!(call(16, 0, 0, 0), -1); // mkdir
    assert_eq!(call(19, 0, 0, 0), -1); // mount
    assert_eq!(call(21, 0, 0, 0), -1); // load_driver
    assert_eq!(call(23, 0, 64, 0), -1); // getcwd
    assert_eq!(call(26, 0, 8, 0), -1); // getprocs
}

#[test]
fn process_guards_hold() {
    // ブート前の current はカーネル (pid 0)
    assert_eq!(call(7, 0, 0, 0), 0); // getpid
    assert_eq!(call(25, 0, 9, 0), -1); // kill pid 0
    assert_eq!(call(25, 4242, 9, 0), -1); // kill 不在 pid
    assert_eq!(call(22, 3, 0, 0), -1); // ioctl は VFS fd を受けない
    assert_eq!(call(11, 0, 0, 0), -1); // malloc(0)
    assert_eq!(call(12, 0, 0, 0), -1); // free(NULL)
}
