fn main() {
    #[cfg(not(unix))]
    compile_error!("purgemem requires a unix-like target (mmap/munmap of anonymous memory)");
}
