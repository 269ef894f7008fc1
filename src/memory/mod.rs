pub(crate) mod allocation;
pub(crate) mod block;
pub(crate) mod class_allocator;
pub(crate) mod device;
pub(crate) mod device_pool;
pub(crate) mod error;
pub(crate) mod heap;
pub(crate) mod host_device;
pub(crate) mod recycle;
pub(crate) mod size_class_set;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
pub(crate) mod testing;
