pub mod dependencies;
pub mod diagnostics;
pub mod files;
pub mod filesystems;
pub mod fstrim;
pub mod losetup;
pub mod lvm;
pub mod mke2fs;
pub mod mount;
pub mod mountpoint;
pub mod proc_mounts;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
