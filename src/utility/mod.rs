pub mod stack_slot_pool;
pub mod syscall;
