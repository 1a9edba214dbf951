//! All binaries in this workspace should use the same allocator. Put
//! `common_alloc::used!();` at the top of main.rs to install it.

#[cfg(target_env = "msvc")]
pub use std::alloc::System as DefaultAllocator;
#[cfg(not(target_env = "msvc"))]
pub use tikv_jemallocator::Jemalloc as DefaultAllocator;

#[macro_export]
macro_rules! used {
    () => {
        #[global_allocator]
        static GLOBAL: $crate::DefaultAllocator = $crate::DefaultAllocator;
    };
}
