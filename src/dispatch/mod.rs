//! The one concrete dispatcher shipped with this crate: a work-stealing
//! thread pool kept only so the runtime is testable end-to-end. Concrete
//! dispatcher variants (thread-per-agent, fixed pool, adaptive pool) beyond
//! this single reference implementation are a named non-goal.

pub mod thread_pool;
