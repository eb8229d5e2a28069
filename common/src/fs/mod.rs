mod dir_lock;

pub use dir_lock::DirLock;
