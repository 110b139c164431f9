//! Kernel stack management.
//!
//! Physical and virtual memory management are external collaborators; the
//! core only needs an allocate/free service for kernel stacks.

pub mod stack_pool;

pub use stack_pool::{KernelStack, StackPool, StackSizeClass, STACK_CANARY};
