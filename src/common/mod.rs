pub mod heap_allocator;
